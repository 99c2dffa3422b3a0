//! Read-only forum tools offered to agents during a turn.
//!
//! - `list_forum_threads`: most recently active threads.
//! - `read_forum_thread`: one thread with its replies.
//! - `search_forum`: case-insensitive search over titles, bodies and authors.
//!
//! Agents never post through tools; posting happens once, after the turn, from
//! the agent's final decision.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::forum::{ForumStore, ItemSummary, SearchField};

use super::{Tool, ToolContext, ToolOutput, ToolRegistry};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

fn limit_param(params: &Value) -> usize {
    params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|v| (v as usize).clamp(1, MAX_LIST_LIMIT))
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

fn summary_json(item: &ItemSummary) -> Value {
    json!({
        "id": item.id,
        "title": item.title,
        "author": item.author,
        "created_at": item.created_at,
        "reply_count": item.reply_count,
        "last_activity_at": item.last_activity_at,
    })
}

/// Register the forum tools against one shared store.
pub async fn register_forum_tools(registry: &ToolRegistry, forum: Arc<dyn ForumStore>) {
    registry
        .register(Arc::new(ListThreadsTool::new(forum.clone())))
        .await;
    registry
        .register(Arc::new(ReadThreadTool::new(forum.clone())))
        .await;
    registry.register(Arc::new(SearchForumTool::new(forum))).await;
}

pub struct ListThreadsTool {
    forum: Arc<dyn ForumStore>,
}

impl ListThreadsTool {
    pub fn new(forum: Arc<dyn ForumStore>) -> Self {
        Self { forum }
    }
}

#[async_trait]
impl Tool for ListThreadsTool {
    fn name(&self) -> &str {
        "list_forum_threads"
    }

    fn description(&self) -> &str {
        "List forum threads, most recently active first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of threads to return (1-100, default 20)"
                }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let items = match self.forum.list_items(limit_param(&params)).await {
            Ok(items) => items,
            Err(e) => return Ok(ToolOutput::Error(format!("Listing threads failed: {}", e))),
        };
        Ok(ToolOutput::Json(json!({
            "status": "ok",
            "thread_count": items.len(),
            "threads": items.iter().map(summary_json).collect::<Vec<_>>(),
        })))
    }
}

pub struct ReadThreadTool {
    forum: Arc<dyn ForumStore>,
}

impl ReadThreadTool {
    pub fn new(forum: Arc<dyn ForumStore>) -> Self {
        Self { forum }
    }
}

#[async_trait]
impl Tool for ReadThreadTool {
    fn name(&self) -> &str {
        "read_forum_thread"
    }

    fn description(&self) -> &str {
        "Read a forum thread and all of its replies."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thread_id": {
                    "type": "integer",
                    "description": "Id of the thread to read"
                }
            },
            "required": ["thread_id"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(thread_id) = params.get("thread_id").and_then(Value::as_i64) else {
            return Ok(ToolOutput::Error(
                "Missing required 'thread_id' parameter".to_string(),
            ));
        };

        let detail = match self.forum.read_item(thread_id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                return Ok(ToolOutput::Error(format!(
                    "Thread {} does not exist",
                    thread_id
                )))
            }
            Err(e) => return Ok(ToolOutput::Error(format!("Reading thread failed: {}", e))),
        };

        Ok(ToolOutput::Json(json!({
            "status": "ok",
            "thread": summary_json(&detail.summary),
            "body": detail.body,
            "replies": detail.replies.iter().map(|reply| json!({
                "id": reply.id,
                "author": reply.author,
                "body": reply.body,
                "created_at": reply.created_at,
                "quoted_id": reply.quoted_id,
            })).collect::<Vec<_>>(),
        })))
    }
}

pub struct SearchForumTool {
    forum: Arc<dyn ForumStore>,
}

impl SearchForumTool {
    pub fn new(forum: Arc<dyn ForumStore>) -> Self {
        Self { forum }
    }
}

#[async_trait]
impl Tool for SearchForumTool {
    fn name(&self) -> &str {
        "search_forum"
    }

    fn description(&self) -> &str {
        "Search forum threads by title, body or author (case-insensitive substring match)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to look for"
                },
                "field": {
                    "type": "string",
                    "enum": ["title", "body", "author", "all"],
                    "description": "Which field to search (default all)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (1-100, default 20)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if query.is_empty() {
            return Ok(ToolOutput::Error(
                "Missing required 'query' parameter".to_string(),
            ));
        }

        let field = match params.get("field").and_then(Value::as_str) {
            Some(raw) => match raw.parse::<SearchField>() {
                Ok(field) => field,
                Err(e) => return Ok(ToolOutput::Error(e.to_string())),
            },
            None => SearchField::All,
        };

        let matches = match self
            .forum
            .search_items(query, field, limit_param(&params))
            .await
        {
            Ok(items) => items,
            Err(e) => return Ok(ToolOutput::Error(format!("Forum search failed: {}", e))),
        };

        Ok(ToolOutput::Json(json!({
            "status": "ok",
            "query": query,
            "field": field.as_str(),
            "match_count": matches.len(),
            "matches": matches.iter().map(summary_json).collect::<Vec<_>>(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::SqliteForum;

    async fn seeded_forum() -> Arc<dyn ForumStore> {
        let forum = SqliteForum::open_in_memory().expect("forum");
        let id = forum
            .create_item("Scheduling fairness", "shuffle every cycle", "opus")
            .await
            .expect("create");
        forum
            .reply_to_item(id, "agreed", "sonnet", None)
            .await
            .expect("reply");
        forum
            .create_item("Budgets", "ten calls", "haiku")
            .await
            .expect("create");
        Arc::new(forum)
    }

    #[tokio::test]
    async fn list_and_read_threads() {
        let forum = seeded_forum().await;
        let ctx = ToolContext::for_agent("opus");

        let listed = ListThreadsTool::new(forum.clone())
            .execute(json!({ "limit": 1 }), &ctx)
            .await
            .expect("list");
        let ToolOutput::Json(listed) = listed else {
            panic!("expected json output");
        };
        assert_eq!(listed["thread_count"], 1);

        let read = ReadThreadTool::new(forum.clone())
            .execute(json!({ "thread_id": 1 }), &ctx)
            .await
            .expect("read");
        let ToolOutput::Json(read) = read else {
            panic!("expected json output");
        };
        assert_eq!(read["thread"]["title"], "Scheduling fairness");
        assert_eq!(read["replies"][0]["author"], "sonnet");

        let missing = ReadThreadTool::new(forum)
            .execute(json!({ "thread_id": 99 }), &ctx)
            .await
            .expect("read");
        assert!(!missing.is_success());
    }

    #[tokio::test]
    async fn search_validates_arguments() {
        let forum = seeded_forum().await;
        let ctx = ToolContext::for_agent("opus");
        let tool = SearchForumTool::new(forum);

        let hits = tool
            .execute(json!({ "query": "HAIKU", "field": "author" }), &ctx)
            .await
            .expect("search");
        let ToolOutput::Json(hits) = hits else {
            panic!("expected json output");
        };
        assert_eq!(hits["match_count"], 1);
        assert_eq!(hits["matches"][0]["title"], "Budgets");

        let bad_field = tool
            .execute(json!({ "query": "x", "field": "tags" }), &ctx)
            .await
            .expect("search");
        assert!(!bad_field.is_success());

        let empty = tool.execute(json!({}), &ctx).await.expect("search");
        assert!(empty.to_llm_string().contains("query"));
    }

    #[tokio::test]
    async fn registers_three_tools() {
        let registry = ToolRegistry::new();
        register_forum_tools(&registry, seeded_forum().await).await;
        let names: Vec<String> = registry
            .tool_definitions()
            .await
            .into_iter()
            .map(|def| def.function.name)
            .collect();
        assert_eq!(
            names,
            vec!["list_forum_threads", "read_forum_thread", "search_forum"]
        );
    }
}
