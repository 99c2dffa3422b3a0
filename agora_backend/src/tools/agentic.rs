//! Agentic tool-calling loop.
//!
//! 1. Send system prompt, turn prompt and tool definitions to the model
//! 2. If the model asks for tool calls, charge the budget and execute them
//! 3. Feed results back and repeat until the model answers without tool calls
//!
//! Every round with tool calls spends at least one unit of budget, so the
//! loop is bounded by the turn's [`ToolBudget`].

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ToolCall, ToolContext, ToolDef, ToolRegistry};
use crate::config::LlmConfig;
use crate::invoker::{ToolBudget, TurnError};

/// Connection settings for one loop run
#[derive(Debug, Clone)]
pub struct AgenticConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl AgenticConfig {
    pub fn from_llm(llm: &LlmConfig, model_override: Option<&str>) -> Self {
        Self {
            api_url: llm.api_url.trim_end_matches('/').to_string(),
            model: model_override.unwrap_or(&llm.model).to_string(),
            api_key: llm.api_key.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: &str, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone)]
pub struct AgenticResult {
    /// Final text with thinking blocks removed
    pub response: Option<String>,
    /// Extracted private reasoning blocks (from <think>/<thinking> tags)
    pub thinking_blocks: Vec<String>,
}

pub struct AgenticLoop {
    config: AgenticConfig,
    registry: Arc<ToolRegistry>,
    client: reqwest::Client,
}

impl AgenticLoop {
    pub fn new(
        config: AgenticConfig,
        registry: Arc<ToolRegistry>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            registry,
            client,
        }
    }

    /// Run until the model produces a final answer.
    ///
    /// Returns [`TurnError::BudgetExceeded`] as soon as a tool call would go
    /// past the budget; that call is not executed.
    pub async fn run(
        &self,
        system_prompt: &str,
        user_message: &str,
        tool_ctx: &ToolContext,
        budget: &mut ToolBudget,
    ) -> Result<AgenticResult, TurnError> {
        let mut messages = vec![
            Message::text("system", system_prompt),
            Message::text("user", user_message),
        ];
        let tool_defs = self.registry.tool_definitions().await;

        let mut calls_made = 0;
        let mut iterations = 0;

        loop {
            iterations += 1;
            tracing::debug!(
                "Agentic loop iteration {} for {} ({} tool calls left)",
                iterations,
                tool_ctx.agent_name,
                budget.remaining()
            );

            let llm_response = self
                .call_llm(&messages, &tool_defs)
                .await
                .context("LLM call failed in agentic loop")?;

            let tool_calls = llm_response.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                let (response, thinking_blocks) = llm_response
                    .content
                    .as_deref()
                    .map(split_visible_and_thinking)
                    .map(|(visible, thinking)| (Some(visible), thinking))
                    .unwrap_or_else(|| (None, Vec::new()));
                tracing::debug!(
                    "Agentic loop for {} finished after {} iteration(s), {} tool call(s)",
                    tool_ctx.agent_name,
                    iterations,
                    calls_made
                );
                return Ok(AgenticResult {
                    response,
                    thinking_blocks,
                });
            }

            tracing::debug!("LLM requested {} tool call(s)", tool_calls.len());
            messages.push(llm_response);

            for tc in &tool_calls {
                let arguments: serde_json::Value = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|e| {
                        tracing::warn!("Failed to parse tool arguments as JSON: {}", e);
                        serde_json::json!({})
                    });

                let call = ToolCall {
                    name: tc.function.name.clone(),
                    arguments,
                };
                let result = self.registry.execute_call(&call, tool_ctx, budget).await?;
                calls_made += 1;
                tracing::debug!("Tool {} ran for {}", result.name, tool_ctx.agent_name);

                messages.push(Message::tool_result(&tc.id, result.output.to_llm_string()));
            }
        }
    }

    async fn call_llm(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDef],
    ) -> anyhow::Result<Message> {
        let url = format!("{}/chat/completions", self.config.api_url);

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        if !tool_defs.is_empty() {
            body["tools"] = serde_json::to_value(tool_defs)?;
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        parse_assistant_message(&response_json)
    }
}

fn parse_assistant_message(response_json: &serde_json::Value) -> anyhow::Result<Message> {
    let message = response_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .map(|choice| &choice["message"])
        .context("Empty choices in LLM response")?;

    let tool_calls: Option<Vec<LlmToolCall>> = message
        .get("tool_calls")
        .and_then(|tc| serde_json::from_value(tc.clone()).ok());

    Ok(Message {
        role: "assistant".to_string(),
        content: message["content"].as_str().map(String::from),
        tool_calls,
        tool_call_id: None,
    })
}

fn split_visible_and_thinking(input: &str) -> (String, Vec<String>) {
    fn extract_tag(text: String, open_tag: &str, close_tag: &str) -> (String, Vec<String>) {
        let mut rest = text;
        let mut thoughts = Vec::new();

        while let Some(start) = rest.find(open_tag) {
            let content_start = start + open_tag.len();
            let (thought_end, remove_end) = match rest[content_start..].find(close_tag) {
                Some(rel_end) => {
                    let end = content_start + rel_end;
                    (end, end + close_tag.len())
                }
                None => (rest.len(), rest.len()),
            };
            let thought = rest[content_start..thought_end].trim();
            if !thought.is_empty() {
                thoughts.push(thought.to_string());
            }
            rest.replace_range(start..remove_end, "");
        }

        (rest, thoughts)
    }

    let (without_thinking_tag, mut thoughts) =
        extract_tag(input.to_string(), "<thinking>", "</thinking>");
    let (visible, mut more) = extract_tag(without_thinking_tag, "<think>", "</think>");
    thoughts.append(&mut more);

    (visible.trim().to_string(), thoughts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_message_serialization() {
        let msg = Message {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![LlmToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: LlmFunctionCall {
                    name: "read_forum_thread".to_string(),
                    arguments: r#"{"thread_id": 3}"#.to_string(),
                },
            }]),
            tool_call_id: None,
        };

        let json = serde_json::to_value(&msg).expect("serialize");
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["function"]["name"], "read_forum_thread");

        let result = serde_json::to_value(Message::tool_result("call_1", "ok".to_string()))
            .expect("serialize");
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }

    #[test]
    fn parses_tool_calls_from_completion() {
        let response = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "list_forum_threads", "arguments": "{}" }
                    }]
                }
            }]
        });
        let message = parse_assistant_message(&response).expect("parse");
        assert!(message.content.is_none());
        let calls = message.tool_calls.expect("tool calls");
        assert_eq!(calls[0].function.name, "list_forum_threads");

        assert!(parse_assistant_message(&serde_json::json!({ "choices": [] })).is_err());
    }

    #[test]
    fn strips_both_think_tag_variants() {
        let (visible, thoughts) = split_visible_and_thinking(
            "<thinking>plan</thinking>\n<think>detail</think>\n{\"action\": \"skip\"}",
        );
        assert_eq!(visible, "{\"action\": \"skip\"}");
        assert_eq!(thoughts, vec!["plan", "detail"]);

        let (visible, thoughts) = split_visible_and_thinking("answer <think>unterminated");
        assert_eq!(visible, "answer");
        assert_eq!(thoughts, vec!["unterminated"]);
    }
}
