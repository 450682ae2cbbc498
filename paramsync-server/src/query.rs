//! Read-only views over live hubs and persisted history, used by the
//! admin HTTP surface. Never mutates a hub beyond the teardown that
//! `delete_session` explicitly asks for.

use std::sync::Arc;

use paramsync_core::{HistoryEvent, SessionState, User};

use crate::hub::HubRegistry;
use crate::store::PersistenceStore;

#[derive(Debug, Clone)]
pub struct LiveSessionInfo {
    pub session_id: String,
    pub user_count: usize,
    pub seq: u64,
    pub state: SessionState,
}

#[derive(Debug, Clone)]
pub struct PersistedMetadata {
    pub session_id: String,
    pub state: SessionState,
    pub seq: u64,
    pub users: Vec<User>,
    pub history_count: usize,
}

pub struct QuerySurface {
    hubs: Arc<HubRegistry>,
    store: Arc<dyn PersistenceStore>,
}

impl QuerySurface {
    pub fn new(hubs: Arc<HubRegistry>, store: Arc<dyn PersistenceStore>) -> Self {
        QuerySurface { hubs, store }
    }

    pub async fn list_live_sessions(&self) -> Vec<LiveSessionInfo> {
        let mut infos = Vec::new();
        for session_id in self.hubs.session_ids() {
            if let Some(handle) = self.hubs.existing(&session_id) {
                if let Some(snapshot) = handle.snapshot().await {
                    infos.push(LiveSessionInfo {
                        session_id: snapshot.session_id,
                        user_count: snapshot.users.len(),
                        seq: snapshot.seq,
                        state: snapshot.state,
                    });
                }
            }
        }
        infos
    }

    pub async fn get_live_session(&self, session_id: &str) -> Option<LiveSessionInfo> {
        let handle = self.hubs.existing(session_id)?;
        let snapshot = handle.snapshot().await?;
        Some(LiveSessionInfo {
            session_id: snapshot.session_id,
            user_count: snapshot.users.len(),
            seq: snapshot.seq,
            state: snapshot.state,
        })
    }

    /// Metadata assembled from the persistence store, independent of
    /// whether the session currently has live connections.
    pub async fn get_persisted_metadata(&self, session_id: &str) -> Result<Option<PersistedMetadata>, paramsync_core::StoreError> {
        let Some(snapshot) = self.store.load_state(session_id).await? else {
            return Ok(None);
        };
        let history = self.store.load_history(session_id, 0, None).await?;
        let users = match self.hubs.existing(session_id) {
            Some(handle) => handle
                .snapshot()
                .await
                .map(|s| s.users)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(Some(PersistedMetadata {
            session_id: session_id.to_string(),
            state: snapshot.state,
            seq: snapshot.seq,
            users,
            history_count: history.len(),
        }))
    }

    /// Whether the persistence store is actually backed by a reachable
    /// database. History-facing routes report `503` when this is `false`.
    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    pub async fn get_history(
        &self,
        session_id: &str,
        start_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<HistoryEvent>, paramsync_core::StoreError> {
        self.store.load_history(session_id, start_seq, end_seq).await
    }

    /// Session ids with a persisted state snapshot, independent of the
    /// live hub registry.
    pub async fn list_persisted_sessions(&self) -> Result<Vec<String>, paramsync_core::StoreError> {
        self.store.list_active_sessions().await
    }

    /// Disconnect every live participant and drop the hub. Persisted state
    /// is left intact — pair with [`Self::delete_history`] for full removal.
    pub fn delete_live_session(&self, session_id: &str) -> bool {
        self.hubs.remove(session_id)
    }

    pub async fn delete_history(&self, session_id: &str) -> Result<(), paramsync_core::StoreError> {
        self.store.delete_session(session_id).await
    }
}
