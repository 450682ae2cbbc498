use async_trait::async_trait;
use paramsync_core::{HistoryEvent, StateSnapshot, StoreError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::PersistenceStore;

/// TTL applied to every session key. A session with no writes for this
/// long is assumed abandoned; the in-memory hub is what actually decides
/// when a session is torn down, this just bounds Redis memory.
const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum number of history events retained per session.
const HISTORY_LIMIT: isize = 1000;

/// Best-effort Redis-backed persistence. Key layout per session:
///
/// - `session:{id}:state`   — JSON-encoded [`StateSnapshot`]
/// - `session:{id}:seq`     — current sequence number, mirrored out of the
///   state blob for cheap reads that only need the counter
/// - `session:{id}:history` — sorted set of JSON [`HistoryEvent`]s, scored by `seq`
/// - `session:{id}:users`   — hash of `user_id -> display_name`
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(RedisStore { conn })
    }

    fn state_key(session_id: &str) -> String {
        format!("session:{session_id}:state")
    }

    fn seq_key(session_id: &str) -> String {
        format!("session:{session_id}:seq")
    }

    fn history_key(session_id: &str) -> String {
        format!("session:{session_id}:history")
    }

    fn users_key(session_id: &str) -> String {
        format!("session:{session_id}:users")
    }
}

#[async_trait]
impl PersistenceStore for RedisStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn save_state(&self, session_id: &str, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(snapshot).map_err(|e| StoreError(e.to_string()))?;
        conn.set_ex::<_, _, ()>(Self::state_key(session_id), payload, SESSION_TTL_SECS)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        conn.set_ex::<_, _, ()>(Self::seq_key(session_id), snapshot.seq, SESSION_TTL_SECS)
            .await
            .map_err(|e| StoreError(e.to_string()))
    }

    async fn load_state(&self, session_id: &str) -> Result<Option<StateSnapshot>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::state_key(session_id))
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError(e.to_string())),
            None => Ok(None),
        }
    }

    async fn append_history(&self, session_id: &str, event: &HistoryEvent) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event).map_err(|e| StoreError(e.to_string()))?;
        let key = Self::history_key(session_id);
        conn.zadd::<_, _, _, ()>(&key, payload, event.seq as f64)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        conn.expire::<_, ()>(&key, SESSION_TTL_SECS as i64)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        // Keep only the most recent HISTORY_LIMIT events.
        conn.zremrangebyrank::<_, ()>(&key, 0, -(HISTORY_LIMIT + 1))
            .await
            .map_err(|e| StoreError(e.to_string()))
    }

    async fn load_history(
        &self,
        session_id: &str,
        start_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::history_key(session_id);
        let raw: Vec<String> = match end_seq {
            Some(end) => conn
                .zrangebyscore(&key, start_seq, end)
                .await
                .map_err(|e| StoreError(e.to_string()))?,
            None => conn
                .zrangebyscore(&key, start_seq, "+inf")
                .await
                .map_err(|e| StoreError(e.to_string()))?,
        };

        Ok(raw
            .into_iter()
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect())
    }

    async fn save_user(&self, session_id: &str, user_id: &str, display_name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::users_key(session_id);
        conn.hset::<_, _, _, ()>(&key, user_id, display_name)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        conn.expire::<_, ()>(&key, SESSION_TTL_SECS as i64)
            .await
            .map_err(|e| StoreError(e.to_string()))
    }

    async fn remove_user(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(Self::users_key(session_id), user_id)
            .await
            .map_err(|e| StoreError(e.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>([
            Self::state_key(session_id),
            Self::seq_key(session_id),
            Self::history_key(session_id),
            Self::users_key(session_id),
        ])
        .await
        .map_err(|e| StoreError(e.to_string()))
    }

    async fn list_active_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys("session:*:state")
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.split(':').nth(1).map(str::to_string))
            .collect())
    }
}
