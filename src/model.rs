//! Normalized target-store entities.
//!
//! `New*` structs are what the materializer hands to a [`TargetStore`];
//! the plain structs are what the store holds (and what tests inspect).
//!
//! [`TargetStore`]: crate::database_ops::store::TargetStore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type BookId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    /// Parse a legacy role label. Returns `None` for anything unrecognized.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "member" | "editor" => Some(Role::User),
            "admin" | "administrator" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageStatus {
    Available,
    InProgress,
    Completed,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Available => "available",
            PageStatus::InProgress => "in-progress",
            PageStatus::Completed => "completed",
        }
    }

    /// Parse a legacy status label, accepting the spellings older exports used.
    pub fn parse(raw: &str) -> Option<Self> {
        let norm: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match norm.as_str() {
            "available" | "open" | "free" | "" => Some(PageStatus::Available),
            "inprogress" | "claimed" | "working" => Some(PageStatus::InProgress),
            "completed" | "complete" | "done" | "finished" => Some(PageStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Approved,
    Rejected,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Approved => "approved",
            UploadStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "new" | "" => Some(UploadStatus::Pending),
            "approved" | "accepted" => Some(UploadStatus::Approved),
            "rejected" | "declined" => Some(UploadStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub legacy_id: Option<String>,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub legacy_id: Option<String>,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBook {
    pub name: String,
    pub slug: String,
    pub total_pages: i64,
    pub completed_pages: i64,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub name: String,
    pub slug: String,
    pub total_pages: i64,
    pub completed_pages: i64,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPage {
    pub book_id: BookId,
    pub page_number: i64,
    pub content: String,
    pub status: PageStatus,
    pub claimed_by: Option<UserId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub image_path: Option<String>,
}

/// Pages carry no surrogate id; (book_id, page_number) is the identity.
pub type Page = NewPage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUpload {
    pub uploader: Option<UserId>,
    pub book_name: String,
    pub original_file_name: String,
    pub content: String,
    pub status: UploadStatus,
    pub uploaded_at: Option<DateTime<Utc>>,
}

pub type Upload = NewUpload;

/// Who a message is addressed to. An unresolvable legacy recipient is kept
/// apart from a broadcast so a private message never becomes public.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Broadcast,
    User(UserId),
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub sender: Option<UserId>,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Legacy id, or a content fingerprint when the export carried none.
    pub identity: String,
    pub sender: Option<UserId>,
    pub recipient: Recipient,
    pub subject: String,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub replies: Vec<Reply>,
}

pub type Message = NewMessage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_status_accepts_legacy_spellings() {
        assert_eq!(PageStatus::parse("in_progress"), Some(PageStatus::InProgress));
        assert_eq!(PageStatus::parse("In-Progress"), Some(PageStatus::InProgress));
        assert_eq!(PageStatus::parse("inProgress"), Some(PageStatus::InProgress));
        assert_eq!(PageStatus::parse("DONE"), Some(PageStatus::Completed));
        assert_eq!(PageStatus::parse(""), Some(PageStatus::Available));
        assert_eq!(PageStatus::parse("archived"), None);
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse(" Admin "), Some(Role::Admin));
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn recipient_serializes_with_kind_tag() {
        let v = serde_json::to_value(Recipient::User(7)).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "user", "value": 7}));
        let b = serde_json::to_value(Recipient::Broadcast).unwrap();
        assert_eq!(b, serde_json::json!({"kind": "broadcast"}));
    }
}
