pub mod content_key;
pub mod slug;
pub mod timestamp;
