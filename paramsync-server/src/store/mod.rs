//! Pluggable persistence for session state. The hub treats this as
//! best-effort: a store failure is logged and swallowed, never surfaced
//! to a connected client, because the in-memory [`crate::hub::SessionHub`]
//! state is always authoritative.

mod redis_store;

use async_trait::async_trait;
use paramsync_core::{HistoryEvent, StateSnapshot, StoreError};

pub use redis_store::RedisStore;

/// Storage backend for session snapshots and history. Implement this for
/// whatever durable store backs a deployment; the hub only ever talks to
/// the trait.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Whether this store is actually backed by a reachable durable
    /// database right now. History-facing HTTP routes report `503` when
    /// this is `false` rather than silently returning empty results.
    fn is_enabled(&self) -> bool;

    async fn save_state(&self, session_id: &str, snapshot: &StateSnapshot) -> Result<(), StoreError>;

    async fn load_state(&self, session_id: &str) -> Result<Option<StateSnapshot>, StoreError>;

    async fn append_history(&self, session_id: &str, event: &HistoryEvent) -> Result<(), StoreError>;

    /// Events with `start_seq <= seq <= end_seq` (or `seq >= start_seq`
    /// when `end_seq` is `None`), ordered by `seq`.
    async fn load_history(
        &self,
        session_id: &str,
        start_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    async fn save_user(&self, session_id: &str, user_id: &str, display_name: &str) -> Result<(), StoreError>;

    async fn remove_user(&self, session_id: &str, user_id: &str) -> Result<(), StoreError>;

    /// Delete every key for a session: state, history, and user presence.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Session ids with a persisted state snapshot, derived by scanning
    /// `session:*:state` keys rather than the live hub registry.
    async fn list_active_sessions(&self) -> Result<Vec<String>, StoreError>;
}

/// A no-op store used when `REDIS_URL` is unset. Sessions still work; they
/// just don't survive a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl PersistenceStore for NullStore {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn save_state(&self, _session_id: &str, _snapshot: &StateSnapshot) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_state(&self, _session_id: &str) -> Result<Option<StateSnapshot>, StoreError> {
        Ok(None)
    }

    async fn append_history(&self, _session_id: &str, _event: &HistoryEvent) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_history(
        &self,
        _session_id: &str,
        _start_seq: u64,
        _end_seq: Option<u64>,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        Ok(Vec::new())
    }

    async fn save_user(&self, _session_id: &str, _user_id: &str, _display_name: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove_user(&self, _session_id: &str, _user_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_session(&self, _session_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}
