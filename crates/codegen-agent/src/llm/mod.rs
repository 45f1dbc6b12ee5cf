//! LLM client abstraction: a neutral `completion()` protocol, transparent
//! `max_tokens` continuation, and an on-disk cache sitting in front of the
//! real provider call.

pub mod cache;
pub mod providers;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::errors::{AgentResult, LlmError};
use crate::message::{merge_adjacent_text, ContentBlock, Message, Role, Tool};

/// Parameters for a single completion request.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<Tool>,
}

/// One turn's raw response from a provider, before continuation merging.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub content: Vec<ContentBlock>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: String,
}

/// The provider-neutral client every actor talks to. Implementations
/// dispatch to a specific backend (`providers::RigClient`) or replay from a
/// fixture (test doubles).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn completion_once(
        &self,
        messages: &[Message],
        params: &ModelParams,
    ) -> AgentResult<RawCompletion>;
}

/// Track cumulative token usage for a session, surfaced via tracing fields
/// rather than a dedicated metrics backend.
#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

impl UsageTotals {
    pub fn record(&mut self, completion: &RawCompletion) {
        self.input_tokens += completion.input_tokens as u64;
        self.output_tokens += completion.output_tokens as u64;
    }
}

/// Drive `completion_once` in a loop, extending `content` and reissuing the
/// request (with the partial response appended as an assistant turn) while
/// `stop_reason == "max_tokens"`. On return, adjacent text blocks are
/// merged exactly once, matching `_merge_text` in the original.
#[instrument(skip(client, messages, params, usage))]
pub async fn completion(
    client: &dyn LlmClient,
    messages: &[Message],
    params: &ModelParams,
    max_continuation_turns: usize,
    usage: &mut UsageTotals,
) -> AgentResult<Vec<ContentBlock>> {
    let mut history: Vec<Message> = messages.to_vec();
    let mut content: Vec<ContentBlock> = Vec::new();

    for turn in 0..=max_continuation_turns {
        let raw = client.completion_once(&history, params).await?;
        usage.record(&raw);
        content.extend(raw.content.clone());

        if raw.stop_reason != "max_tokens" {
            debug!(turn, stop_reason = %raw.stop_reason, "completion finished");
            return Ok(merge_adjacent_text(content));
        }
        if turn == max_continuation_turns {
            return Err(LlmError::Request(format!(
                "exceeded {max_continuation_turns} continuation turns without finishing"
            ))
            .into());
        }
        history.push(Message::assistant(raw.content));
    }

    unreachable!("loop always returns or errors on its last iteration")
}

pub(crate) fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}
