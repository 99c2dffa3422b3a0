//! Agent Invoker seam.
//!
//! An invoker takes one agent's turn prompt plus a [`ToolBudget`] and comes
//! back with a validated [`Decision`]. Budget exhaustion is its own error
//! variant so the scheduler can turn it into a forced skip instead of a
//! failure.

pub mod budget;
pub mod llm;
pub mod prompt;

pub use budget::{BudgetExceeded, ToolBudget};
pub use llm::LlmInvoker;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AgentProfile;
use crate::database::ActionKind;
use crate::forum::ItemId;

/// What an agent wants to do with its turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Skip {
        rationale: String,
    },
    StartTopic {
        title: String,
        body: String,
        rationale: String,
    },
    Reply {
        target: ItemId,
        body: String,
        rationale: String,
    },
}

impl Decision {
    pub fn skip(rationale: impl Into<String>) -> Self {
        Decision::Skip {
            rationale: rationale.into(),
        }
    }

    /// The skip the scheduler substitutes when a turn runs out of tool calls.
    pub fn forced_skip(exceeded: &BudgetExceeded) -> Self {
        Decision::skip(format!(
            "Tool call limit exceeded. Max allowed: {}",
            exceeded.limit
        ))
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Decision::Skip { .. } => ActionKind::Skip,
            Decision::StartTopic { .. } => ActionKind::StartTopic,
            Decision::Reply { .. } => ActionKind::Reply,
        }
    }

    pub fn rationale(&self) -> &str {
        match self {
            Decision::Skip { rationale }
            | Decision::StartTopic { rationale, .. }
            | Decision::Reply { rationale, .. } => rationale,
        }
    }

    pub fn target(&self) -> Option<ItemId> {
        match self {
            Decision::Reply { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Parse a model's final answer. Accepts bare JSON, a ```json block, or
    /// the first `{...}` span in surrounding prose.
    pub fn parse_response(response: &str) -> Result<Self> {
        let raw: RawDecision = match serde_json::from_str(response.trim()) {
            Ok(parsed) => parsed,
            Err(_) => {
                let json_content = extract_json_block(response);
                serde_json::from_str(json_content).with_context(|| {
                    format!("Failed to parse decision JSON. Raw response: {}", response)
                })?
            }
        };
        raw.validate()
    }
}

fn extract_json_block(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim();
        }
    }
    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => response,
    }
}

/// Loosely-typed model output before validation.
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(alias = "action_type")]
    action: String,
    #[serde(default, alias = "thread_id", alias = "target_item_id")]
    target: Option<ItemId>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default, alias = "reasoning")]
    rationale: Option<String>,
}

impl RawDecision {
    fn validate(self) -> Result<Decision> {
        let rationale = self.rationale.unwrap_or_default();
        let body = self.body.unwrap_or_default();
        match self.action.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Decision::Skip { rationale }),
            "start_topic" | "create_thread" => {
                let title = self
                    .title
                    .context("start_topic decision is missing a title")?;
                Ok(Decision::StartTopic {
                    title,
                    body,
                    rationale,
                })
            }
            "reply" | "reply_to_thread" => {
                let target = self
                    .target
                    .context("reply decision is missing a target thread id")?;
                Ok(Decision::Reply {
                    target,
                    body,
                    rationale,
                })
            }
            other => anyhow::bail!("Unknown decision action: {}", other),
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Runs one agent's reasoning for one turn.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn run_turn(
        &self,
        agent: &AgentProfile,
        prompt: &str,
        budget: &mut ToolBudget,
    ) -> std::result::Result<Decision, TurnError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_fenced_decisions() {
        let reply = Decision::parse_response(
            r#"{"action": "reply", "target": 4, "body": "Agreed.", "rationale": "adds context"}"#,
        )
        .expect("bare json");
        assert_eq!(reply.kind(), ActionKind::Reply);
        assert_eq!(reply.target(), Some(4));

        let topic = Decision::parse_response(
            "Here is my decision:\n```json\n{\"action_type\": \"create_thread\", \"title\": \"Budgets\", \"body\": \"\", \"reasoning\": \"new idea\"}\n```",
        )
        .expect("fenced json");
        assert_eq!(
            topic,
            Decision::StartTopic {
                title: "Budgets".to_string(),
                body: String::new(),
                rationale: "new idea".to_string(),
            }
        );

        let skip = Decision::parse_response("I'll pass. {\"action\": \"SKIP\"} thanks")
            .expect("embedded json");
        assert_eq!(skip, Decision::skip(""));
    }

    #[test]
    fn rejects_incomplete_decisions() {
        assert!(Decision::parse_response(r#"{"action": "reply", "body": "x"}"#).is_err());
        assert!(Decision::parse_response(r#"{"action": "start_topic", "body": "x"}"#).is_err());
        assert!(Decision::parse_response(r#"{"action": "shout"}"#).is_err());
        assert!(Decision::parse_response("no json here").is_err());
    }

    #[test]
    fn forced_skip_names_the_limit() {
        let decision = Decision::forced_skip(&BudgetExceeded {
            limit: 10,
            attempted: 11,
        });
        assert_eq!(decision.kind(), ActionKind::Skip);
        assert!(decision.rationale().contains("Tool call limit exceeded"));
        assert!(decision.rationale().contains("10"));
    }
}
