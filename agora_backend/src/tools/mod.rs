//! Tools the model may call while deciding what to do with its turn.
//!
//! Each tool declares a JSON Schema for its parameters so it can be offered
//! through OpenAI-style function calling. Every call goes through
//! [`ToolRegistry::execute_call`], which charges the turn's [`ToolBudget`]
//! before the tool runs.

pub mod agentic;
pub mod forum;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::invoker::{BudgetExceeded, ToolBudget};

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    Text(String),
    Json(serde_json::Value),
    Error(String),
}

impl ToolOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Text(_) | ToolOutput::Json(_))
    }
}

/// Context passed to tools during execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The agent whose turn is running
    pub agent_name: String,
}

impl ToolContext {
    pub fn for_agent(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "read_forum_thread")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call parsed from LLM output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

/// Registry of the tools offered to agents.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registered tool: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// OpenAI-format definitions for every registered tool, sorted by name so
    /// requests are stable.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Charge the budget, then run the tool.
    ///
    /// Only budget exhaustion is an `Err`: unknown tools and tool failures
    /// come back as [`ToolOutput::Error`] for the model to read, and still
    /// count against the budget.
    pub async fn execute_call(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        budget: &mut ToolBudget,
    ) -> std::result::Result<ToolCallResult, BudgetExceeded> {
        budget.charge(&call.name)?;

        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                return Ok(ToolCallResult {
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Unknown tool: {}", call.name)),
                });
            }
        };

        let output = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::Error(format!("Tool execution failed: {}", e)),
        };
        Ok(ToolCallResult {
            name: call.name.clone(),
            output,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
