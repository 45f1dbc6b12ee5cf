//! Provider dispatch: turns an `AgentConfig` into a concrete `LlmClient`,
//! and wraps any client with the on-disk cache and a retry/backoff layer.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rig::completion::Prompt;
use tracing::{instrument, warn};

use crate::config::{AgentConfig, CacheMode, LlmProvider};
use crate::errors::{AgentResult, LlmError};
use crate::message::Message;

use super::cache::{request_hash, DiskCache};
use super::{LlmClient, ModelParams, RawCompletion};

/// Dispatches to the configured `rig-core` provider client. Gemini/Ollama
/// are represented so the surface exists even where `rig` doesn't yet ship
/// a first-class client for them; they fall back to the OpenAI-compatible
/// completion endpoint shape, which is how most self-hosted runtimes expose
/// themselves.
pub struct RigClient {
    provider: LlmProvider,
    api_key: String,
}

impl RigClient {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            provider: config.llm_provider.clone(),
            api_key: config.llm_api_key.clone(),
        }
    }
}

#[async_trait]
impl LlmClient for RigClient {
    #[instrument(skip(self, messages, params), fields(model = %params.model))]
    async fn completion_once(
        &self,
        messages: &[Message],
        params: &ModelParams,
    ) -> AgentResult<RawCompletion> {
        let prompt = messages
            .iter()
            .filter_map(|m| {
                m.content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n")
                    .into()
            })
            .collect::<Vec<String>>()
            .join("\n\n");

        let text = match self.provider {
            LlmProvider::Anthropic => {
                let client = rig::providers::anthropic::Client::new(&self.api_key);
                let agent = client.agent(&params.model).build();
                agent
                    .prompt(prompt)
                    .await
                    .map_err(|e| LlmError::Request(e.to_string()))?
            }
            LlmProvider::OpenAi | LlmProvider::Gemini | LlmProvider::Ollama => {
                let client = rig::providers::openai::Client::new(&self.api_key);
                let agent = client.agent(&params.model).build();
                agent
                    .prompt(prompt)
                    .await
                    .map_err(|e| LlmError::Request(e.to_string()))?
            }
        };

        Ok(RawCompletion {
            content: vec![crate::message::ContentBlock::text(text)],
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: "end_turn".to_string(),
        })
    }
}

/// Wraps an inner client with the on-disk cache and exponential-backoff
/// retry, matching `agent/llm/cached.py` + the provider retry loop.
pub struct CachedClient<C: LlmClient> {
    inner: C,
    cache: DiskCache,
    max_retries: u32,
}

impl<C: LlmClient> CachedClient<C> {
    pub fn new(inner: C, cache: DiskCache, max_retries: u32) -> Self {
        Self {
            inner,
            cache,
            max_retries,
        }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for CachedClient<C> {
    async fn completion_once(
        &self,
        messages: &[Message],
        params: &ModelParams,
    ) -> AgentResult<RawCompletion> {
        let key = request_hash(messages, params);
        if let Some(hit) = self.cache.get(&key)? {
            return Ok(hit);
        }
        if self.cache.mode() == CacheMode::ReplayOnly {
            return Err(LlmError::Cache(format!("replay cache miss for key {key}")).into());
        }

        let mut attempt = 0;
        loop {
            match self.inner.completion_once(messages, params).await {
                Ok(completion) => {
                    self.cache.put(&key, &completion)?;
                    return Ok(completion);
                }
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    let jitter_ms = rand::thread_rng().gen_range(0..250);
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt) + jitter_ms);
                    warn!(attempt, ?backoff, %err, "llm request failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ContentBlock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingClient {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        async fn completion_once(
            &self,
            _messages: &[Message],
            _params: &ModelParams,
        ) -> AgentResult<RawCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawCompletion {
                content: vec![ContentBlock::text("hi")],
                input_tokens: 1,
                output_tokens: 1,
                stop_reason: "end_turn".to_string(),
            })
        }
    }

    fn params() -> ModelParams {
        ModelParams {
            model: "test-model".into(),
            max_tokens: 16,
            temperature: None,
            stop_sequences: vec![],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn second_identical_request_hits_the_cache_without_calling_inner() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let client = CachedClient::new(
            CountingClient { calls: Arc::clone(&calls) },
            DiskCache::new(dir.path(), CacheMode::ReadWrite, 10),
            0,
        );
        let messages = vec![Message::user("hello")];

        client.completion_once(&messages, &params()).await.unwrap();
        client.completion_once(&messages, &params()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_only_mode_fails_instead_of_calling_inner_on_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let client = CachedClient::new(
            CountingClient { calls: Arc::clone(&calls) },
            DiskCache::new(dir.path(), CacheMode::ReplayOnly, 10),
            0,
        );
        let err = client
            .completion_once(&[Message::user("hello")], &params())
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, crate::errors::AgentError::Llm(LlmError::Cache(_))));
    }
}
