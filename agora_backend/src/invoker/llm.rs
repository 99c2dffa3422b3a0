use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use super::prompt::build_system_prompt;
use super::{AgentInvoker, Decision, ToolBudget, TurnError};
use crate::config::{AgentProfile, AppConfig, CycleConfig, LlmConfig};
use crate::forum::ForumStore;
use crate::tools::agentic::{AgenticConfig, AgenticLoop};
use crate::tools::forum::register_forum_tools;
use crate::tools::{ToolContext, ToolRegistry};

/// Agent Invoker backed by an OpenAI-compatible chat-completions endpoint.
pub struct LlmInvoker {
    llm: LlmConfig,
    cycle: CycleConfig,
    registry: Arc<ToolRegistry>,
    client: reqwest::Client,
}

impl LlmInvoker {
    pub fn new(config: &AppConfig, registry: Arc<ToolRegistry>) -> Self {
        Self {
            llm: config.llm.clone(),
            cycle: config.cycle.clone(),
            registry,
            client: reqwest::Client::new(),
        }
    }

    /// Invoker whose tools read from `forum`.
    pub async fn with_forum_tools(config: &AppConfig, forum: Arc<dyn ForumStore>) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        register_forum_tools(&registry, forum).await;
        Self::new(config, registry)
    }

    pub fn model_for<'a>(&'a self, agent: &'a AgentProfile) -> &'a str {
        agent.model.as_deref().unwrap_or(&self.llm.model)
    }
}

#[async_trait]
impl AgentInvoker for LlmInvoker {
    async fn run_turn(
        &self,
        agent: &AgentProfile,
        prompt: &str,
        budget: &mut ToolBudget,
    ) -> Result<Decision, TurnError> {
        let model = self.model_for(agent);
        let system_prompt = build_system_prompt(agent, &self.cycle, model);
        let agentic = AgenticLoop::new(
            AgenticConfig::from_llm(&self.llm, Some(model)),
            self.registry.clone(),
            self.client.clone(),
        );

        let result = agentic
            .run(
                &system_prompt,
                prompt,
                &ToolContext::for_agent(&agent.name),
                budget,
            )
            .await?;

        if !result.thinking_blocks.is_empty() {
            tracing::debug!(
                "{} produced {} thinking block(s)",
                agent.name,
                result.thinking_blocks.len()
            );
        }

        let response = result
            .response
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| anyhow!("{} returned no final answer", agent.name))?;
        let decision = Decision::parse_response(&response)?;

        tracing::debug!(
            "{} decided {} after {} tool call(s)",
            agent.name,
            decision.kind(),
            budget.used()
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::SqliteForum;

    #[tokio::test]
    async fn unreachable_endpoint_is_a_failed_turn() {
        let mut config = AppConfig::default();
        config.llm.api_url = "http://127.0.0.1:9".to_string();
        let forum: Arc<dyn ForumStore> = Arc::new(SqliteForum::open_in_memory().expect("forum"));
        let invoker = LlmInvoker::with_forum_tools(&config, forum).await;

        let agent = AgentProfile::named("opus");
        let mut budget = ToolBudget::new(3);
        let err = invoker
            .run_turn(&agent, "hello", &mut budget)
            .await
            .expect_err("no server");
        assert!(matches!(err, TurnError::Failed(_)));
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn agent_model_overrides_default() {
        let config = AppConfig::default();
        let invoker = LlmInvoker::new(&config, Arc::new(ToolRegistry::new()));
        let mut agent = AgentProfile::named("opus");
        assert_eq!(invoker.model_for(&agent), config.llm.model);
        agent.model = Some("qwen2.5".to_string());
        assert_eq!(invoker.model_for(&agent), "qwen2.5");
    }
}
