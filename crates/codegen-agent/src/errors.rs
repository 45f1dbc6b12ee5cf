//! Error taxonomy for the agent server.
//!
//! Leaf errors are `thiserror` enums scoped to one component; callers above
//! the component boundary (the HSM driver, the HTTP handlers) compose them
//! into `anyhow::Result`.

use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

/// Top-level error a session or HTTP handler can surface.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Hsm(#[from] HsmError),
    #[error(transparent)]
    Actor(#[from] ActorError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the workspace/container engine (§4.A).
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path {path} is protected and not in the allowed set")]
    Protected { path: String },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("container engine error: {0}")]
    Engine(String),
    #[error("mutating exec failed with exit code {code}: {stderr}")]
    ExecFailed { code: i32, stderr: String },
    #[error("SEARCH block for {path} matched {count} times, expected exactly 1")]
    DiffMismatch { path: String, count: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while driving the hierarchical state machine (§4.E).
#[derive(Debug, Error)]
pub enum HsmError {
    #[error("invalid event {event} in current state stack")]
    InvalidEvent { event: String },
    #[error("invalid transition target: {0}")]
    InvalidTransition(String),
    #[error("checkpoint schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("actor invocation failed: {0}")]
    ActorFailed(#[from] Box<ActorError>),
}

/// Errors raised by a beam-search actor invocation (§4.D).
#[derive(Debug, Error, Clone)]
pub enum ActorError {
    #[error("llm completion failed: {0}")]
    Llm(String),
    #[error("no candidate passed validation out of {attempted}")]
    NoGreenLeaf { attempted: usize },
    #[error("candidate pool exhausted without a solution")]
    NoSolutions,
    #[error("workspace operation failed: {0}")]
    Workspace(String),
}

/// Classification used to decide whether an error is worth retrying, ported
/// from the orchestrator's retry taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transient,
    RateLimit,
    ContextExhausted,
    ParseFailure,
    ToolFailure,
    PolicyViolation,
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimit | Self::ContextExhausted | Self::ParseFailure
        )
    }
}

/// Errors raised by the LLM client abstraction (§4.B).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("response did not contain a usable completion")]
    EmptyCompletion,
    #[error("cache io error: {0}")]
    Cache(String),
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

/// Errors raised by the snapshot saver (§4.I).
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("object store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
