//! Review comments attached to merged/pushed loops

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::new_loop_id;

/// Status of a review comment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Addressed,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Addressed => write!(f, "addressed"),
        }
    }
}

/// A comment raised during a post-merge/post-push review cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub loop_id: String,
    pub review_cycle: u32,
    pub text: String,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressed_at: Option<DateTime<Utc>>,
}

impl ReviewComment {
    pub fn new(loop_id: impl Into<String>, review_cycle: u32, text: impl Into<String>) -> Self {
        Self {
            id: new_loop_id(),
            loop_id: loop_id.into(),
            review_cycle,
            text: text.into(),
            status: ReviewStatus::Pending,
            created_at: Utc::now(),
            addressed_at: None,
        }
    }

    pub fn mark_addressed(&mut self) {
        self.status = ReviewStatus::Addressed;
        self.addressed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_addressed() {
        let mut comment = ReviewComment::new("loop-1", 0, "rename this function");
        assert_eq!(comment.status, ReviewStatus::Pending);
        assert!(comment.addressed_at.is_none());

        comment.mark_addressed();
        assert_eq!(comment.status, ReviewStatus::Addressed);
        assert!(comment.addressed_at.is_some());
    }
}
