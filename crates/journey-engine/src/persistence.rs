//! Journey snapshots and the stores that keep them.
//!
//! A [`JourneySnapshot`] wraps a full [`JourneyState`] with a format version and
//! save time. Restoring a snapshot injects the state directly; nothing is
//! replayed. Stores are keyed by session id.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journey_types::{Clock, EngineError, JourneyState, Result};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::catalog::StepCatalog;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneySnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: JourneyState,
}

impl JourneySnapshot {
    pub fn capture(state: &JourneyState, now: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            state: state.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    /// Check the snapshot can be injected into an engine running `catalog`.
    pub fn validate_against(&self, catalog: &StepCatalog) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(EngineError::InvalidSnapshot(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        let state = &self.state;
        if !catalog.contains(&state.current_step) {
            return Err(EngineError::InvalidSnapshot(format!(
                "current step '{}' is not in the catalog",
                state.current_step
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &state.completed_steps {
            if !catalog.contains(step) {
                return Err(EngineError::InvalidSnapshot(format!(
                    "completed step '{step}' is not in the catalog"
                )));
            }
            if !seen.insert(step) {
                return Err(EngineError::InvalidSnapshot(format!(
                    "completed step '{step}' is listed twice"
                )));
            }
        }
        if let Some(step) = state.step_progress.keys().find(|s| !catalog.contains(s)) {
            return Err(EngineError::InvalidSnapshot(format!(
                "progress recorded for unknown step '{step}'"
            )));
        }
        if state.session.session_id.is_empty() {
            return Err(EngineError::InvalidSnapshot("empty session id".into()));
        }
        Ok(())
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &JourneySnapshot) -> Result<()>;
    /// `Ok(None)` when nothing is stored for the session.
    async fn load(&self, session_id: &str) -> Result<Option<JourneySnapshot>>;
    async fn remove(&self, session_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Writes `<root>/<session_id>.json`.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a session. Characters outside `[A-Za-z0-9_-]` are replaced so a
    /// session id can never escape the root directory.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    /// Read a snapshot file from an explicit path.
    pub async fn read_path(path: &Path) -> Result<JourneySnapshot> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &JourneySnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(snapshot.session_id());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), session = snapshot.session_id(), "Snapshot saved");
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<JourneySnapshot>> {
        let path = self.path_for(session_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_path(&path).await.map(Some)
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory store
// ---------------------------------------------------------------------------

/// In-process store. Snapshots expire after `ttl` and the least recently
/// used are evicted past `max_sessions`.
pub struct MemorySnapshotStore {
    cache: Mutex<TtlCache<String, JourneySnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, max_sessions: usize) -> Self {
        Self {
            cache: Mutex::new(TtlCache::new(clock, ttl, max_sessions)),
        }
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut TtlCache<String, JourneySnapshot>) -> T) -> T {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut cache)
    }

    pub fn len(&self) -> usize {
        self.with_cache(|c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &JourneySnapshot) -> Result<()> {
        let key = snapshot.session_id().to_string();
        self.with_cache(|c| c.insert(key, snapshot.clone()));
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<JourneySnapshot>> {
        Ok(self.with_cache(|c| c.get(&session_id.to_string())))
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        self.with_cache(|c| c.remove(&session_id.to_string()));
        Ok(())
    }
}
