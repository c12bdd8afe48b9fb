// src/entities/review.rs

//! User reviews
//!
//! A review is immutable once built from a source. The cache document form
//! stores the creation date as whole epoch seconds and omits it when the
//! source had none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user review of an app
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Review {
    pub author: String,
    pub date_created: Option<DateTime<Utc>>,
    pub description: String,
    pub id: i64,
    pub rating: i64,
    pub summary: String,
    pub voted: bool,
}

/// Cached document form of a [`Review`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReviewDocument {
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created: Option<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rating: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub voted: bool,
}

impl From<&Review> for ReviewDocument {
    fn from(review: &Review) -> Self {
        Self {
            author: review.author.clone(),
            date_created: review.date_created.map(|d| d.timestamp()),
            description: review.description.clone(),
            id: review.id,
            rating: review.rating,
            summary: review.summary.clone(),
            voted: review.voted,
        }
    }
}

impl From<ReviewDocument> for Review {
    fn from(doc: ReviewDocument) -> Self {
        Self {
            author: doc.author,
            date_created: doc.date_created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            description: doc.description,
            id: doc.id,
            rating: doc.rating,
            summary: doc.summary,
            voted: doc.voted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(date: Option<DateTime<Utc>>) -> Review {
        Review {
            author: "Alice".to_string(),
            date_created: date,
            description: "Works well".to_string(),
            id: 42,
            rating: 80,
            summary: "Good".to_string(),
            voted: true,
        }
    }

    #[test]
    fn test_document_round_trip() {
        let original = review(DateTime::from_timestamp(1_556_712_000, 0));
        let json = serde_json::to_value(ReviewDocument::from(&original)).unwrap();
        assert_eq!(json["date-created"], json!(1_556_712_000));

        let doc: ReviewDocument = serde_json::from_value(json).unwrap();
        assert_eq!(Review::from(doc), original);
    }

    #[test]
    fn test_null_date_round_trip() {
        let original = review(None);
        let json = serde_json::to_value(ReviewDocument::from(&original)).unwrap();
        assert!(json.get("date-created").is_none());

        let doc: ReviewDocument = serde_json::from_value(json).unwrap();
        assert_eq!(Review::from(doc), original);
    }

    #[test]
    fn test_missing_members_default() {
        let doc: ReviewDocument = serde_json::from_value(json!({"id": 3})).unwrap();
        let review = Review::from(doc);
        assert_eq!(review.id, 3);
        assert_eq!(review.author, "");
        assert!(!review.voted);
        assert!(review.date_created.is_none());
    }
}
