//! Reasoning provider abstraction and the retry/fallback wrapper around it.

use crate::error::{ProviderError, ProviderErrorKind};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Tool as advertised to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: Some(content.into()), ..Self::default() }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: Some(content.into()), ..Self::default() }
    }

    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Temperature(f32);

impl Temperature {
    /// # Errors
    /// Returns an error if `val` is outside the inclusive range [0.0, 2.0].
    pub fn new(val: f32) -> std::result::Result<Self, TemperatureError> {
        if (0.0..=2.0).contains(&val) {
            Ok(Self(val))
        } else {
            Err(TemperatureError { value: val })
        }
    }

    #[must_use]
    pub const fn value(self) -> f32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureError {
    pub value: f32,
}

impl std::fmt::Display for TemperatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "temperature must be between 0.0 and 2.0, got {}", self.value)
    }
}

impl std::error::Error for TemperatureError {}

impl TryFrom<f32> for Temperature {
    type Error = TemperatureError;

    fn try_from(value: f32) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Temperature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f32::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SamplingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReasoningRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningDelta {
    Text(String),
    ToolCall(ToolCallRequest),
}

pub type ReasoningStream = BoxStream<'static, Result<ReasoningDelta>>;

#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streamed completion.
    ///
    /// # Errors
    /// Providers report upstream failures as [`Error::Provider`].
    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningStream>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReasoningPolicy {
    /// Bound on opening a stream and on the gap between chunks.
    #[serde(default = "default_timeout", with = "crate::serde_ext::option_millis")]
    pub timeout: Option<Duration>,
    /// Extra attempts per provider before moving to the next one.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff", with = "crate::serde_ext::millis")]
    pub backoff: Duration,
}

#[allow(clippy::unnecessary_wraps)]
const fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

const fn default_retries() -> u32 {
    1
}

const fn default_backoff() -> Duration {
    Duration::from_millis(250)
}

impl Default for ReasoningPolicy {
    fn default() -> Self {
        Self { timeout: default_timeout(), retries: default_retries(), backoff: default_backoff() }
    }
}

/// Wraps a primary provider and an ordered list of fallbacks.
///
/// Retries and fallbacks only happen before the first chunk arrives. Once
/// anything has streamed, a failure or chunk timeout surfaces to the caller.
pub struct ResilientProvider {
    chain: Vec<Arc<dyn ReasoningProvider>>,
    policy: ReasoningPolicy,
}

impl ResilientProvider {
    #[must_use]
    pub fn new(primary: Arc<dyn ReasoningProvider>, policy: ReasoningPolicy) -> Self {
        Self { chain: vec![primary], policy }
    }

    #[must_use]
    pub fn fallback(mut self, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.chain.push(provider);
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &ReasoningPolicy {
        &self.policy
    }

    async fn open(&self, provider: &dyn ReasoningProvider, request: ReasoningRequest) -> Result<ReasoningStream> {
        let opening = async {
            let mut stream = provider.complete(request).await?;
            let first = stream.next().await;
            Ok::<_, Error>((first, stream))
        };
        let (first, rest) = match self.policy.timeout {
            Some(limit) => tokio::time::timeout(limit, opening)
                .await
                .map_err(|_| Error::ReasoningTimeout(limit))??,
            None => opening.await?,
        };
        match first {
            None => Ok(futures::stream::empty().boxed()),
            Some(Err(err)) => Err(err),
            Some(Ok(delta)) => Ok(futures::stream::once(async move { Ok(delta) })
                .chain(with_chunk_timeout(rest, self.policy.timeout))
                .boxed()),
        }
    }
}

#[async_trait]
impl ReasoningProvider for ResilientProvider {
    fn name(&self) -> &str {
        self.chain.first().map_or("resilient", |provider| provider.name())
    }

    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningStream> {
        let mut attempts = 0usize;
        let mut last: Option<ProviderError> = None;

        for provider in &self.chain {
            for attempt in 0..=self.policy.retries {
                attempts += 1;
                let err = match self.open(provider.as_ref(), request.clone()).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => err,
                };
                let Some(mut failure) = provider_failure(&err) else {
                    return Err(err);
                };
                failure.provider.get_or_insert_with(|| provider.name().to_string());
                tracing::warn!(
                    provider = provider.name(),
                    attempt,
                    error = %failure,
                    "reasoning provider attempt failed"
                );
                let retryable = failure.is_retryable();
                last = Some(failure);
                if !retryable {
                    break;
                }
                if attempt < self.policy.retries && !self.policy.backoff.is_zero() {
                    tokio::time::sleep(self.policy.backoff.saturating_mul(attempt + 1)).await;
                }
            }
        }

        let last = last.unwrap_or_else(|| ProviderError::new(ProviderErrorKind::Unknown, "no providers configured"));
        Err(Error::ProviderExhausted { attempts, last })
    }
}

fn provider_failure(err: &Error) -> Option<ProviderError> {
    match err {
        Error::Provider(failure) => Some(failure.clone()),
        Error::ReasoningTimeout(limit) => Some(ProviderError::new(
            ProviderErrorKind::Timeout,
            format!("no response within {limit:?}"),
        )),
        _ => None,
    }
}

fn with_chunk_timeout(stream: ReasoningStream, timeout: Option<Duration>) -> ReasoningStream {
    let Some(limit) = timeout else {
        return stream;
    };
    futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((Err(Error::ReasoningTimeout(limit)), None)),
        }
    })
    .boxed()
}
