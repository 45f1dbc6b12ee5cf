//! On-disk completion cache, keyed by a hash of the canonicalized request.
//!
//! Mirrors the original's `agent/llm/cached.py`: a `completion()` call is
//! looked up by a deterministic key before hitting the network, and the
//! response is recorded after a real call so replays are byte-identical.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::config::CacheMode;
use crate::errors::{AgentResult, LlmError};
use crate::message::Message;

use super::{ModelParams, RawCompletion};

#[derive(Serialize)]
struct CacheKeyInput<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature_bits: Option<u32>,
    stop_sequences: &'a [String],
    tool_names: Vec<&'a str>,
    messages: &'a [Message],
}

/// Canonicalize a request into a stable `blake3` hex digest. Using
/// serde_json's stable field order (the struct definition order) plus a
/// bit-pattern for the float avoids nondeterminism across platforms.
pub fn request_hash(messages: &[Message], params: &ModelParams) -> String {
    let key_input = CacheKeyInput {
        model: &params.model,
        max_tokens: params.max_tokens,
        temperature_bits: params.temperature.map(|t| t.to_bits()),
        stop_sequences: &params.stop_sequences,
        tool_names: params.tools.iter().map(|t| t.name.as_str()).collect(),
        messages,
    };
    let canonical = serde_json::to_vec(&key_input).expect("cache key is always serializable");
    blake3::hash(&canonical).to_hex().to_string()
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    content: Vec<crate::message::ContentBlock>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: String,
}

/// File-backed cache with a bounded number of entries, evicting the least
/// recently accessed file (by mtime) once the cap is exceeded.
pub struct DiskCache {
    dir: PathBuf,
    mode: CacheMode,
    max_entries: usize,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, mode: CacheMode, max_entries: usize) -> Self {
        Self {
            dir: dir.into(),
            mode,
            max_entries,
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn get(&self, key: &str) -> AgentResult<Option<RawCompletion>> {
        if self.mode == CacheMode::Off {
            return Ok(None);
        }
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path).map_err(|e| LlmError::Cache(e.to_string()))?;
        let entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| LlmError::Cache(e.to_string()))?;
        touch(&path);
        Ok(Some(RawCompletion {
            content: entry.content,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            stop_reason: entry.stop_reason,
        }))
    }

    pub fn put(&self, key: &str, completion: &RawCompletion) -> AgentResult<()> {
        if self.mode == CacheMode::Off || self.mode == CacheMode::ReplayOnly {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| LlmError::Cache(e.to_string()))?;
        let entry = CacheEntry {
            content: completion.content.clone(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            stop_reason: completion.stop_reason.clone(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| LlmError::Cache(e.to_string()))?;
        std::fs::write(self.path_for(key), bytes).map_err(|e| LlmError::Cache(e.to_string()))?;
        self.evict_if_over_capacity()?;
        Ok(())
    }

    fn evict_if_over_capacity(&self) -> AgentResult<()> {
        let mut entries: Vec<(PathBuf, SystemTime)> = std::fs::read_dir(&self.dir)
            .map_err(|e| LlmError::Cache(e.to_string()))?
            .filter_map(|e| e.ok())
            .map(|e| {
                let path = e.path();
                let mtime = e
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (path, mtime)
            })
            .collect();

        if entries.len() <= self.max_entries {
            return Ok(());
        }
        entries.sort_by_key(|(_, mtime)| *mtime);
        let overflow = entries.len() - self.max_entries;
        for (path, _) in entries.into_iter().take(overflow) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

fn touch(path: &Path) {
    let now = SystemTime::now();
    let _ = filetime_touch(path, now);
}

fn filetime_touch(path: &Path, _now: SystemTime) -> std::io::Result<()> {
    // Re-writing the same bytes bumps mtime without needing a filetime crate.
    let bytes = std::fs::read(path)?;
    std::fs::write(path, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn params() -> ModelParams {
        ModelParams {
            model: "test-model".into(),
            max_tokens: 100,
            temperature: Some(0.0),
            stop_sequences: vec![],
            tools: vec![],
        }
    }

    #[test]
    fn same_request_hashes_identically() {
        let messages = vec![Message::user("hello")];
        let a = request_hash(&messages, &params());
        let b = request_hash(&messages, &params());
        assert_eq!(a, b);
    }

    #[test]
    fn different_messages_hash_differently() {
        let a = request_hash(&[Message::user("hello")], &params());
        let b = request_hash(&[Message::user("goodbye")], &params());
        assert_ne!(a, b);
    }

    #[test]
    fn cache_round_trips_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), CacheMode::ReadWrite, 10);
        let key = "abc123";
        assert!(cache.get(key).unwrap().is_none());

        let completion = RawCompletion {
            content: vec![crate::message::ContentBlock::text("hi")],
            input_tokens: 3,
            output_tokens: 1,
            stop_reason: "end_turn".into(),
        };
        cache.put(key, &completion).unwrap();

        let loaded = cache.get(key).unwrap().expect("entry present");
        assert_eq!(loaded.stop_reason, "end_turn");
        assert_eq!(loaded.output_tokens, 1);
    }

    #[test]
    fn replay_only_mode_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), CacheMode::ReplayOnly, 10);
        let completion = RawCompletion {
            content: vec![],
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: "end_turn".into(),
        };
        cache.put("key", &completion).unwrap();
        assert!(cache.get("key").unwrap().is_none());
    }
}
