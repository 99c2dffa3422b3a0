//! Applies an agent's [`Decision`] to the forum.

use anyhow::Result;
use std::sync::Arc;

use crate::database::ParticipationStore;
use crate::forum::{ForumStore, ItemId};
use crate::invoker::Decision;

/// What happened when a decision was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub created_item_id: Option<ItemId>,
    pub success: bool,
    pub error: Option<String>,
}

impl TurnOutcome {
    fn ok(created_item_id: Option<ItemId>) -> Self {
        Self {
            created_item_id,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            created_item_id: None,
            success: false,
            error: Some(if error.trim().is_empty() {
                "unknown error".to_string()
            } else {
                error
            }),
        }
    }
}

pub struct ActionExecutor {
    forum: Arc<dyn ForumStore>,
    store: Arc<ParticipationStore>,
    seen_refresh_limit: usize,
}

impl ActionExecutor {
    pub fn new(
        forum: Arc<dyn ForumStore>,
        store: Arc<ParticipationStore>,
        seen_refresh_limit: usize,
    ) -> Self {
        Self {
            forum,
            store,
            seen_refresh_limit,
        }
    }

    /// Perform at most one forum mutation. Forum errors become a failed
    /// outcome; nothing is retried.
    pub async fn execute(&self, agent: &str, decision: &Decision) -> TurnOutcome {
        let result = match decision {
            Decision::Skip { .. } => return TurnOutcome::ok(None),
            Decision::StartTopic { title, body, .. } => {
                self.forum.create_item(title, body, agent).await
            }
            Decision::Reply { target, body, .. } => {
                self.forum.reply_to_item(*target, body, agent, None).await
            }
        };

        match result {
            Ok(id) => {
                tracing::info!("{} {} -> item {}", agent, decision.kind(), id);
                TurnOutcome::ok(Some(id))
            }
            Err(e) => {
                tracing::warn!("{} {} failed: {:#}", agent, decision.kind(), e);
                TurnOutcome::failed(format!("{:#}", e))
            }
        }
    }

    /// Mark everything currently listed on the forum as seen by `agent`.
    /// Returns how many items were new to the agent.
    pub async fn refresh_seen(&self, agent: &str) -> Result<usize> {
        let items = self.forum.list_items(self.seen_refresh_limit).await?;
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();
        let added = self.store.mark_seen_many(agent, &ids)?;
        tracing::debug!("{} has seen {} listed item(s), {} new", agent, ids.len(), added);
        Ok(added)
    }

    /// [`refresh_seen`](Self::refresh_seen) for callers that must not fail
    /// the turn over it.
    pub async fn refresh_seen_logged(&self, agent: &str) {
        if let Err(e) = self.refresh_seen(agent).await {
            tracing::warn!("Failed to refresh seen items for {}: {:#}", agent, e);
        }
    }
}
