//! Runtime configuration, read from environment variables with documented
//! defaults, following the same `Default`-impl-reads-env-vars shape used
//! throughout the orchestrator configuration this crate was built from.

use std::path::PathBuf;

/// Selects which LLM backend `llm::providers` dispatches completions to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
    Gemini,
    Ollama,
}

impl LlmProvider {
    fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "gemini" => Self::Gemini,
            "ollama" => Self::Ollama,
            _ => Self::Anthropic,
        }
    }
}

/// Which application template graph `app_fsm::build` wires up. Only
/// `TrpcAgent` ships a concrete state graph; the others are named so a
/// future template only has to add a graph builder, not new machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    TrpcAgent,
    NiceguiAgent,
    LaravelAgent,
}

impl Template {
    fn from_env_str(s: &str) -> Self {
        match s {
            "nicegui_agent" => Self::NiceguiAgent,
            "laravel_agent" => Self::LaravelAgent,
            _ => Self::TrpcAgent,
        }
    }
}

/// How the LLM client cache persists completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Never read or write the cache.
    Off,
    /// Read cached completions when present, write new ones.
    ReadWrite,
    /// Only read; a miss is an error (deterministic replay for tests).
    ReplayOnly,
}

/// Top-level agent configuration, populated from `AGENT_*` environment
/// variables with sensible defaults for local development.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// LLM backend selected via `AGENT_LLM_PROVIDER` (default: anthropic).
    pub llm_provider: LlmProvider,
    /// Model name passed to the provider client.
    pub llm_model: String,
    /// API key for the selected provider (`AGENT_LLM_API_KEY`).
    pub llm_api_key: String,
    /// Application template graph (`AGENT_TEMPLATE`, default: trpc_agent).
    pub template: Template,
    /// Bearer token required on `/message`. `None` disables auth, matching
    /// the "missing auth token disables authentication" rule.
    pub auth_token: Option<String>,
    /// Directory (or object-store URI) snapshots are written under.
    pub snapshot_store_path: PathBuf,
    /// Beam width for candidate expansion (`AGENT_BEAM_WIDTH`, default 5).
    pub beam_width: usize,
    /// Maximum `max_tokens` continuation turns per completion (default 4).
    pub max_continuation_turns: usize,
    /// LLM response cache mode (`AGENT_CACHE_MODE`, default read-write).
    pub cache_mode: CacheMode,
    /// Directory the LLM cache is stored under.
    pub cache_dir: PathBuf,
    /// Maximum retries for a single LLM request.
    pub max_retries: u32,
    /// Host the HTTP server binds to (`AGENT_HOST`, default 0.0.0.0).
    pub host: String,
    /// Port the HTTP server binds to (`AGENT_PORT`, default 8080).
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_provider: std::env::var("AGENT_LLM_PROVIDER")
                .map(|s| LlmProvider::from_env_str(&s))
                .unwrap_or(LlmProvider::Anthropic),
            llm_model: std::env::var("AGENT_LLM_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
            llm_api_key: std::env::var("AGENT_LLM_API_KEY").unwrap_or_default(),
            template: std::env::var("AGENT_TEMPLATE")
                .map(|s| Template::from_env_str(&s))
                .unwrap_or(Template::TrpcAgent),
            auth_token: std::env::var("AGENT_AUTH_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            snapshot_store_path: std::env::var("AGENT_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            beam_width: std::env::var("AGENT_BEAM_WIDTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            max_continuation_turns: std::env::var("AGENT_MAX_CONTINUATION_TURNS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            cache_mode: match std::env::var("AGENT_CACHE_MODE").as_deref() {
                Ok("off") => CacheMode::Off,
                Ok("replay") => CacheMode::ReplayOnly,
                _ => CacheMode::ReadWrite,
            },
            cache_dir: std::env::var("AGENT_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.llm-cache")),
            max_retries: std::env::var("AGENT_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            host: std::env::var("AGENT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("AGENT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.beam_width, 5);
        assert_eq!(cfg.template, Template::TrpcAgent);
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!(LlmProvider::from_env_str("OpenAI"), LlmProvider::OpenAi);
        assert_eq!(LlmProvider::from_env_str("unknown"), LlmProvider::Anthropic);
    }
}
