use super::agent::LlmAgent;
use super::call::AgentOverrides;
use super::filter::EventFilter;
use super::llm::{ReasoningPolicy, ReasoningProvider, ResilientProvider, SamplingConfig, Temperature};
use super::tools::ToolRegistry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

/// Serializable part of an [`LlmAgent`]'s setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Spoken once when the call starts (or when the agent is handed the call).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Upper bound on consecutive tool rounds within one turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default)]
    pub policy: ReasoningPolicy,
}

const fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            introduction: None,
            sampling: SamplingConfig::default(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            policy: ReasoningPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn apply(&mut self, overrides: &AgentOverrides) {
        if let Some(prompt) = &overrides.system_prompt {
            self.system_prompt = Some(prompt.clone());
        }
        if let Some(intro) = &overrides.introduction {
            self.introduction = Some(intro.clone());
        }
    }
}

pub struct LlmAgentBuilder {
    name: String,
    provider: Option<Arc<dyn ReasoningProvider>>,
    fallbacks: Vec<Arc<dyn ReasoningProvider>>,
    config: AgentConfig,
    tools: ToolRegistry,
    run_filter: EventFilter,
    cancel_filter: EventFilter,
}

impl LlmAgentBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "llm_agent".to_string(),
            provider: None,
            fallbacks: Vec::new(),
            config: AgentConfig::default(),
            tools: ToolRegistry::new(),
            run_filter: EventFilter::default_run(),
            cancel_filter: EventFilter::default_cancel(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Tried in order when the primary provider cannot open a stream.
    #[must_use]
    pub fn fallback(mut self, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.fallbacks.push(provider);
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn introduction(mut self, intro: impl Into<String>) -> Self {
        self.config.introduction = Some(intro.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.sampling.model = Some(model.into());
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: Temperature) -> Self {
        self.config.sampling.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.sampling.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub const fn max_tool_iterations(mut self, limit: usize) -> Self {
        self.config.max_tool_iterations = limit;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: ReasoningPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    #[must_use]
    pub fn overrides(mut self, overrides: &AgentOverrides) -> Self {
        self.config.apply(overrides);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn run_filter(mut self, filter: EventFilter) -> Self {
        self.run_filter = filter;
        self
    }

    #[must_use]
    pub fn cancel_filter(mut self, filter: EventFilter) -> Self {
        self.cancel_filter = filter;
        self
    }

    /// # Errors
    /// Returns an error if no provider is set or the tool loop bound is zero.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<LlmAgent> {
        let primary = self
            .provider
            .ok_or_else(|| Error::InvalidConfig("reasoning provider required".to_string()))?;
        if self.config.max_tool_iterations == 0 {
            return Err(Error::InvalidConfig("max_tool_iterations must be at least 1".to_string()));
        }
        let provider = self
            .fallbacks
            .into_iter()
            .fold(ResilientProvider::new(primary, self.config.policy.clone()), ResilientProvider::fallback);

        Ok(LlmAgent {
            name: self.name,
            config: self.config,
            provider: Arc::new(provider),
            tools: self.tools,
            run_filter: self.run_filter,
            cancel_filter: self.cancel_filter,
            introduced: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        })
    }
}

impl Default for LlmAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_required() {
        let Err(err) = LlmAgent::builder().build() else {
            panic!("expected missing provider to fail");
        };
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn overrides_replace_prompt_and_introduction() {
        let mut config = AgentConfig { system_prompt: Some("base".to_string()), ..AgentConfig::default() };
        config.apply(&AgentOverrides { system_prompt: None, introduction: Some("Hi!".to_string()) });
        assert_eq!(config.system_prompt.as_deref(), Some("base"));
        assert_eq!(config.introduction.as_deref(), Some("Hi!"));
    }

    #[test]
    fn config_defaults_fill_in_from_json() {
        let config: AgentConfig = serde_json::from_str(r#"{"system_prompt": "Be brief."}"#).unwrap();
        assert_eq!(config.max_tool_iterations, DEFAULT_MAX_TOOL_ITERATIONS);
        assert_eq!(config.policy, ReasoningPolicy::default());
    }
}
