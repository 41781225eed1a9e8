//! Live control sessions, keyed by run id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::control::Control;

/// At most one session per run id. Cheap to clone.
#[derive(Clone, Default)]
pub struct ControlRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Control>>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctl` under its run id, returning the session it displaced.
    pub async fn insert(&self, ctl: Arc<Control>) -> Option<Arc<Control>> {
        self.sessions
            .write()
            .await
            .insert(ctl.run_id().to_string(), ctl)
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Control>> {
        self.sessions.read().await.get(run_id).cloned()
    }

    /// Remove the entry for `run_id` only if it is still `ctl`, so a session
    /// that was already replaced cannot evict its successor.
    pub async fn remove_if_same(&self, run_id: &str, ctl: &Arc<Control>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(run_id) {
            Some(current) if Arc::ptr_eq(current, ctl) => {
                sessions.remove(run_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Arc<Control>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
