//! Snapshot saver (§4.I): writes checkpoint blobs keyed
//! `"{trace_id}/{phase}.json"` with jittered-backoff retry. A failed write
//! is logged and swallowed — losing a checkpoint must never fail the
//! session that produced it.

use std::sync::Arc;
use std::time::Duration;

use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use rand::Rng;
use serde::Serialize;
use tracing::{error, warn};

use crate::errors::{AgentResult, SnapshotError};

/// The FSM lifecycle point a checkpoint was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FsmEnter,
    FsmExit,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::FsmEnter => "fsm_enter",
            Self::FsmExit => "fsm_exit",
        }
    }
}

pub struct SnapshotSaver {
    store: Arc<dyn ObjectStore>,
    max_retries: u32,
}

impl SnapshotSaver {
    pub fn local(root: impl AsRef<std::path::Path>) -> AgentResult<Self> {
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| SnapshotError::Store(e.to_string()))?;
        Ok(Self {
            store: Arc::new(store),
            max_retries: 3,
        })
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Best-effort checkpoint write. Returns `Ok(())` even on eventual
    /// failure after retries; the caller only sees a `warn!`/`error!` log,
    /// never a propagated error, so a storage hiccup never aborts a run.
    pub async fn save<T: Serialize>(&self, trace_id: &str, phase: Phase, data: &T) {
        let key = StorePath::from(format!("{trace_id}/{}.json", phase.as_str()));
        let bytes = match serde_json::to_vec(data) {
            Ok(b) => b,
            Err(err) => {
                error!(%err, "failed to serialize checkpoint, dropping");
                return;
            }
        };

        for attempt in 0..=self.max_retries {
            match self.store.put(&key, bytes.clone().into()).await {
                Ok(_) => return,
                Err(err) if attempt < self.max_retries => {
                    let jitter_ms = rand::thread_rng().gen_range(0..250);
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt) + jitter_ms);
                    warn!(attempt, ?backoff, %err, "checkpoint write failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    error!(%err, trace_id, phase = phase.as_str(), "checkpoint write failed permanently");
                    return;
                }
            }
        }
    }

    pub async fn load(&self, trace_id: &str, phase: Phase) -> AgentResult<Vec<u8>> {
        let key = StorePath::from(format!("{trace_id}/{}.json", phase.as_str()));
        let result = self
            .store
            .get(&key)
            .await
            .map_err(|e| SnapshotError::Store(e.to_string()))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| SnapshotError::Store(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Checkpoint {
        iteration: u32,
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let saver = SnapshotSaver::local(dir.path()).unwrap();

        saver.save("trace-1", Phase::FsmEnter, &Checkpoint { iteration: 3 }).await;
        let bytes = saver.load("trace-1", Phase::FsmEnter).await.unwrap();
        let loaded: Checkpoint = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(loaded, Checkpoint { iteration: 3 });
    }

    #[tokio::test]
    async fn load_missing_checkpoint_errors() {
        let dir = tempfile::tempdir().unwrap();
        let saver = SnapshotSaver::local(dir.path()).unwrap();
        let err = saver.load("missing", Phase::FsmExit).await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::AgentError::Snapshot(SnapshotError::Store(_))
        ));
    }
}
