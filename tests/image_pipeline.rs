// tests/image_pipeline.rs

//! Integration tests for the image pipeline against a canned HTTP server.

mod common;

use common::{chunked_response, http_response, png_bytes, serve_http, serve_http_delayed};
use snapstore::cache::namespace;
use snapstore::{CacheStore, CancellationToken, Error, FetchedImage, ImagePipeline};
use std::sync::Arc;
use std::time::Duration;

fn pipeline() -> (ImagePipeline, CacheStore) {
    let cache = CacheStore::open_in_memory().unwrap();
    (ImagePipeline::new(reqwest::Client::new(), cache.clone()), cache)
}

fn fresh(result: FetchedImage) -> Arc<snapstore::DecodedImage> {
    match result {
        FetchedImage::Fresh(image) => image,
        FetchedImage::NotModified => panic!("expected fresh image"),
    }
}

#[tokio::test]
async fn test_fetch_scales_and_caches() {
    let body = png_bytes(800, 600);
    let served = body.clone();
    let (addr, log) = serve_http(move |_| {
        http_response(
            200,
            &[("ETag", "\"v1\""), ("Cache-Control", "public, max-age=3600")],
            &served,
        )
    })
    .await;
    let uri = format!("http://{addr}/icon.png");
    let (pipeline, cache) = pipeline();

    let fetched = pipeline.fetch(&uri, None, 400, 400, &CancellationToken::new()).await;
    let image = fresh(fetched.unwrap());
    assert_eq!((image.width(), image.height()), (400, 300));
    assert_eq!((image.original_width, image.original_height), (800, 600));
    assert_eq!(log.count(), 1);

    let metadata = pipeline.cached_metadata(&uri).unwrap().unwrap();
    assert_eq!(metadata.uri, uri);
    assert_eq!((metadata.width, metadata.height), (800, 600));
    assert_eq!(metadata.etag.as_deref(), Some("\"v1\""));
    assert_eq!(metadata.max_age, Some(3600));
    assert!(metadata.is_fresh(chrono::Utc::now()));

    let entry = cache.lookup(namespace::IMAGES, &uri, true).unwrap().unwrap();
    assert_eq!(entry.payload.as_blob(), Some(body.as_slice()));
    let freshness = entry.freshness.unwrap();
    assert_eq!(freshness.etag.as_deref(), Some("\"v1\""));
    assert_eq!((freshness.width, freshness.height), (Some(800), Some(600)));
}

#[tokio::test]
async fn test_chunked_body_of_unknown_length() {
    let served = png_bytes(64, 128);
    let (addr, _log) = serve_http(move |_| chunked_response(200, &[], &served, 97)).await;
    let uri = format!("http://{addr}/banner.png");
    let (pipeline, _cache) = pipeline();

    let fetched = pipeline.fetch(&uri, None, 300, 600, &CancellationToken::new()).await;
    let image = fresh(fetched.unwrap());
    assert_eq!((image.original_width, image.original_height), (64, 128));
    assert_eq!((image.width(), image.height()), (300, 600));
}

#[tokio::test]
async fn test_conditional_fetch_not_modified() {
    let body = png_bytes(32, 32);
    let served = body.clone();
    let (addr, log) = serve_http(move |request| {
        if request.header("If-None-Match") == Some("\"v1\"") {
            http_response(304, &[("ETag", "\"v1\"")], b"")
        } else {
            http_response(200, &[("ETag", "\"v1\"")], &served)
        }
    })
    .await;
    let uri = format!("http://{addr}/icon.png");
    let (pipeline, _cache) = pipeline();
    let token = CancellationToken::new();

    // No cached copy yet: the etag is not sent
    fresh(pipeline.fetch(&uri, Some("\"v1\""), 0, 0, &token).await.unwrap());
    assert!(log.all()[0].header("If-None-Match").is_none());

    let etag = pipeline.cached_metadata(&uri).unwrap().unwrap().etag;
    let second = pipeline.fetch(&uri, etag.as_deref(), 0, 0, &token).await.unwrap();
    assert!(matches!(second, FetchedImage::NotModified));
    assert_eq!(log.all()[1].header("If-None-Match"), Some("\"v1\""));

    let cached = pipeline.lookup_cached_only(&uri, 16, 16).await.unwrap().unwrap();
    assert_eq!((cached.width(), cached.height()), (16, 16));
}

#[tokio::test]
async fn test_decode_failure_writes_nothing() {
    let (addr, _log) =
        serve_http(|_| http_response(200, &[("ETag", "\"x\"")], b"<html>not an image</html>"))
            .await;
    let uri = format!("http://{addr}/broken.png");
    let (pipeline, cache) = pipeline();

    let result = pipeline.fetch(&uri, None, 10, 10, &CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Decode(_))));
    assert!(cache.lookup(namespace::IMAGES, &uri, false).unwrap().is_none());
    assert!(pipeline.cached_metadata(&uri).unwrap().is_none());
}

#[tokio::test]
async fn test_http_error_is_transport() {
    let (addr, _log) = serve_http(|_| http_response(404, &[], b"missing")).await;
    let uri = format!("http://{addr}/missing.png");
    let (pipeline, cache) = pipeline();

    let result = pipeline.fetch(&uri, None, 10, 10, &CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(cache.keys(namespace::IMAGES).unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_fetch_writes_nothing() {
    let served = png_bytes(8, 8);
    let (addr, _log) =
        serve_http_delayed(Duration::from_millis(500), move |_| http_response(200, &[], &served))
            .await;
    let uri = format!("http://{addr}/slow.png");
    let (pipeline, cache) = pipeline();
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = pipeline.fetch(&uri, None, 0, 0, &token).await;
    assert!(result.unwrap_err().is_cancelled());
    assert!(cache.keys(namespace::IMAGES).unwrap().is_empty());
    assert!(cache.keys(namespace::IMAGE_METADATA).unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_download() {
    let served = png_bytes(100, 50);
    let (addr, log) =
        serve_http_delayed(Duration::from_millis(50), move |_| http_response(200, &[], &served))
            .await;
    let uri = format!("http://{addr}/shared.png");
    let (pipeline, _cache) = pipeline();
    let token = CancellationToken::new();

    let (a, b, c) = tokio::join!(
        pipeline.fetch(&uri, None, 50, 50, &token),
        pipeline.fetch(&uri, None, 50, 50, &token),
        pipeline.fetch(&uri, None, 20, 20, &token),
    );

    assert_eq!(log.count(), 1);
    assert_eq!(pipeline.coalesced_count(), 2);
    let (a, b, c) = (fresh(a.unwrap()), fresh(b.unwrap()), fresh(c.unwrap()));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!((a.width(), a.height()), (50, 25));
    assert_eq!((c.width(), c.height()), (20, 10));
}

#[tokio::test]
async fn test_unconditional_fetch_not_joined_to_conditional() {
    let served = png_bytes(32, 32);
    let (addr, log) = serve_http_delayed(Duration::from_millis(50), move |request| {
        if request.header("If-None-Match") == Some("\"v1\"") {
            http_response(304, &[("ETag", "\"v1\"")], b"")
        } else {
            http_response(200, &[("ETag", "\"v1\"")], &served)
        }
    })
    .await;
    let uri = format!("http://{addr}/icon.png");
    let (pipeline, _cache) = pipeline();
    let token = CancellationToken::new();
    fresh(pipeline.fetch(&uri, None, 0, 0, &token).await.unwrap());

    let (conditional, unconditional) = tokio::join!(
        pipeline.fetch(&uri, Some("\"v1\""), 0, 0, &token),
        pipeline.fetch(&uri, None, 4, 4, &token),
    );

    assert!(matches!(conditional.unwrap(), FetchedImage::NotModified));
    let image = fresh(unconditional.unwrap());
    assert_eq!((image.width(), image.height()), (4, 4));
    assert_eq!(log.count(), 3);
    assert_eq!(pipeline.coalesced_count(), 0);
}

#[tokio::test]
async fn test_waiting_fetch_honours_own_token() {
    let served = png_bytes(16, 16);
    let (addr, log) = serve_http_delayed(Duration::from_millis(300), move |_| {
        http_response(200, &[], &served)
    })
    .await;
    let uri = format!("http://{addr}/shared.png");
    let (pipeline, _cache) = pipeline();
    let first = CancellationToken::new();
    let second = CancellationToken::new();

    let canceller = second.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let (a, b) = tokio::join!(
        pipeline.fetch(&uri, None, 0, 0, &first),
        pipeline.fetch(&uri, None, 0, 0, &second),
    );

    assert_eq!(fresh(a.unwrap()).width(), 16);
    assert!(b.unwrap_err().is_cancelled());
    assert_eq!(pipeline.coalesced_count(), 1);
    assert_eq!(log.count(), 1);
}

#[tokio::test]
async fn test_concurrent_decode_failure_keeps_kind() {
    let (addr, _log) = serve_http_delayed(Duration::from_millis(50), |_| {
        http_response(200, &[], b"garbage")
    })
    .await;
    let uri = format!("http://{addr}/garbage.png");
    let (pipeline, _cache) = pipeline();
    let token = CancellationToken::new();

    let (a, b) = tokio::join!(
        pipeline.fetch(&uri, None, 0, 0, &token),
        pipeline.fetch(&uri, None, 0, 0, &token),
    );

    assert!(matches!(a, Err(Error::Decode(_))));
    assert!(matches!(b, Err(Error::Decode(_))));
    assert_eq!(pipeline.coalesced_count(), 1);
}

#[tokio::test]
async fn test_cached_only_miss() {
    let (pipeline, _cache) = pipeline();
    assert!(pipeline.lookup_cached_only("http://nowhere/x.png", 10, 10).await.unwrap().is_none());
}
