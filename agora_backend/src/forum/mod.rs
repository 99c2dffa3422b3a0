//! Forum Store seam.
//!
//! The scheduler never talks to a forum directly; it goes through
//! [`ForumStore`]. `sqlite` provides the local implementation used by the
//! `agora` binary.

pub mod sqlite;

pub use sqlite::SqliteForum;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a forum thread or post.
pub type ItemId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub title: String,
    pub author: String,
    pub created_at: String,
    pub reply_count: u32,
    pub last_activity_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: ItemId,
    pub item_id: ItemId,
    pub author: String,
    pub body: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_id: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub summary: ItemSummary,
    pub body: String,
    /// Replies in posting order
    pub replies: Vec<Reply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Title,
    Body,
    Author,
    #[default]
    All,
}

impl SearchField {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchField::Title => "title",
            SearchField::Body => "body",
            SearchField::Author => "author",
            SearchField::All => "all",
        }
    }
}

impl fmt::Display for SearchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchField {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(SearchField::Title),
            "body" => Ok(SearchField::Body),
            "author" => Ok(SearchField::Author),
            "all" | "" => Ok(SearchField::All),
            other => anyhow::bail!("Unknown search field: {}", other),
        }
    }
}

/// Thread/post storage shared by all agents.
#[async_trait]
pub trait ForumStore: Send + Sync {
    /// Threads ordered most-recently-active first.
    async fn list_items(&self, limit: usize) -> Result<Vec<ItemSummary>>;

    /// `Ok(None)` when the thread does not exist.
    async fn read_item(&self, id: ItemId) -> Result<Option<ItemDetail>>;

    async fn create_item(&self, title: &str, body: &str, author: &str) -> Result<ItemId>;

    /// Fails if `id` does not exist, or if `quoted_id` is given and is not a
    /// post in that thread.
    async fn reply_to_item(
        &self,
        id: ItemId,
        body: &str,
        author: &str,
        quoted_id: Option<ItemId>,
    ) -> Result<ItemId>;

    /// Case-insensitive substring match on the chosen field.
    async fn search_items(
        &self,
        query: &str,
        field: SearchField,
        limit: usize,
    ) -> Result<Vec<ItemSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_field_parses_case_insensitively() {
        assert_eq!("TITLE".parse::<SearchField>().unwrap(), SearchField::Title);
        assert_eq!("".parse::<SearchField>().unwrap(), SearchField::All);
        assert!("subject".parse::<SearchField>().is_err());
        assert_eq!(SearchField::Author.to_string(), "author");
    }
}
