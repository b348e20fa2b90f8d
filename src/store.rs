//! Persisted run state.
//!
//! The store is the single source of truth shared across step invocations:
//! every step reloads the state at entry and persists it immediately after any
//! mutation that must survive a crash, so losing the controller mid-step loses
//! at most the in-flight step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tokio::sync::Mutex;

use crate::agent::AgentError;
use crate::protocol::TabId;

/// Well-known key for the persisted run state.
pub const RUN_STATE_STORAGE_KEY: &str = "agent_run_state";
/// Well-known key for the decision-client credential.
pub const API_KEY_STORAGE_KEY: &str = "gemini_api_key";

/// State of the single run, one instance per profile.
///
/// `history` is append-only and never truncated in storage; only the most
/// recent window is surfaced to the decision client per step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub is_running: bool,
    pub abort_requested: bool,
    pub current_goal: Option<String>,
    pub history: Vec<String>,
    pub active_tab_id: Option<TabId>,
    pub api_key: Option<String>,
    /// Short id for log correlation, assigned at goal acceptance.
    pub run_id: Option<String>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Load the current state; a store with no saved state yields the default
    /// idle state.
    async fn load(&self) -> Result<RunState, AgentError>;
    async fn save(&self, state: &RunState) -> Result<(), AgentError>;
    async fn load_api_key(&self) -> Result<Option<String>, AgentError>;
    async fn save_api_key(&self, key: &str) -> Result<(), AgentError>;
}

// ========================= In-memory store =========================

/// Session-scoped store backed by memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<RunState>,
    api_key: Mutex<Option<String>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(RunState::default()),
                api_key: Mutex::new(Some(key.into())),
            }),
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load(&self) -> Result<RunState, AgentError> {
        Ok(self.inner.state.lock().await.clone())
    }

    async fn save(&self, state: &RunState) -> Result<(), AgentError> {
        *self.inner.state.lock().await = state.clone();
        Ok(())
    }

    async fn load_api_key(&self) -> Result<Option<String>, AgentError> {
        Ok(self.inner.api_key.lock().await.clone())
    }

    async fn save_api_key(&self, key: &str) -> Result<(), AgentError> {
        *self.inner.api_key.lock().await = Some(key.to_string());
        Ok(())
    }
}

// ========================= Disk store =========================

/// JSON files under a directory, one per storage key. Survives process
/// restarts, which is what lets a run resume after the controller's host is
/// recycled between steps.
pub struct DiskRunStore {
    dir: PathBuf,
}

impl DiskRunStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{RUN_STATE_STORAGE_KEY}.json"))
    }

    fn api_key_path(&self) -> PathBuf {
        self.dir.join(format!("{API_KEY_STORAGE_KEY}.json"))
    }
}

#[async_trait]
impl RunStore for DiskRunStore {
    async fn load(&self) -> Result<RunState, AgentError> {
        match async_fs::read(self.state_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AgentError::Store(format!("corrupt run state: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RunState::default()),
            Err(e) => Err(AgentError::Store(format!("read run state: {e}"))),
        }
    }

    async fn save(&self, state: &RunState) -> Result<(), AgentError> {
        async_fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Store(format!("create store dir: {e}")))?;
        let bytes = serde_json::to_vec(state)
            .map_err(|e| AgentError::Store(format!("encode run state: {e}")))?;
        async_fs::write(self.state_path(), bytes)
            .await
            .map_err(|e| AgentError::Store(format!("write run state: {e}")))
    }

    async fn load_api_key(&self) -> Result<Option<String>, AgentError> {
        match async_fs::read(self.api_key_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| AgentError::Store(format!("corrupt api key: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Store(format!("read api key: {e}"))),
        }
    }

    async fn save_api_key(&self, key: &str) -> Result<(), AgentError> {
        async_fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::Store(format!("create store dir: {e}")))?;
        let bytes = serde_json::to_vec(&key)
            .map_err(|e| AgentError::Store(format!("encode api key: {e}")))?;
        async_fs::write(self.api_key_path(), bytes)
            .await
            .map_err(|e| AgentError::Store(format!("write api key: {e}")))
    }
}
