//! The session hub: one actor task per active session, reached through a
//! [`HubHandle`] and commands sent over an mpsc queue. Serializing every
//! mutation through a single task gives the per-session single-writer
//! guarantee without a mutex, mirroring the cap-table-plus-registry shape
//! of a capability server but keyed by session id instead of capability id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use paramsync_core::{
    ConflictDetectedPayload, HistoryEvent, ParamName, ParamUpdate, ServerMessage, SessionState,
    SessionStatePayload, StateSnapshot, User,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::store::PersistenceStore;

/// A conflicting proposal is only flagged if the param it touches changed
/// within this window.
const CONFLICT_WINDOW: Duration = Duration::from_millis(500);
/// Two values closer than this are the same value for conflict purposes.
const CONFLICT_TOLERANCE: f64 = 1e-3;

pub type ConnectionId = u64;

struct Connection {
    sender: mpsc::UnboundedSender<Value>,
    user_id: Option<String>,
}

struct HubState {
    session_id: String,
    state: SessionState,
    seq: u64,
    users: HashMap<String, User>,
    connections: HashMap<ConnectionId, Connection>,
    last_update: HashMap<ParamName, Instant>,
    next_conn_id: ConnectionId,
    store: Arc<dyn PersistenceStore>,
}

/// A point-in-time view of a hub, used by the read-only query surface and
/// by `auth:success` replies.
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub seq: u64,
    pub users: Vec<User>,
}

enum HubCommand {
    Join {
        sender: mpsc::UnboundedSender<Value>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Leave {
        conn_id: ConnectionId,
    },
    Authenticate {
        conn_id: ConnectionId,
        user: User,
        reply: oneshot::Sender<HubSnapshot>,
    },
    ProposeUpdate {
        conn_id: ConnectionId,
        update: ParamUpdate,
    },
    ResolveConflict {
        conn_id: ConnectionId,
        param: ParamName,
        resolved_value: f64,
    },
    Resync {
        reply: oneshot::Sender<SessionStatePayload>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    Unicast {
        conn_id: ConnectionId,
        msg: ServerMessage,
    },
    Shutdown,
}

/// Handle to a running hub actor. Cheap to clone; every clone shares the
/// same underlying task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn spawn(session_id: String, initial: SessionState, seq: u64, store: Arc<dyn PersistenceStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = HubState {
            session_id,
            state: initial,
            seq,
            users: HashMap::new(),
            connections: HashMap::new(),
            last_update: HashMap::new(),
            next_conn_id: 0,
            store,
        };
        tokio::spawn(run(hub, rx));
        HubHandle { tx }
    }

    /// Register a new connection's outbound channel. Returns the
    /// connection id the caller uses for all further commands.
    pub async fn join(&self, sender: mpsc::UnboundedSender<Value>) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Join { sender, reply }).ok()?;
        rx.await.ok()
    }

    pub fn leave(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Leave { conn_id });
    }

    pub async fn authenticate(&self, conn_id: ConnectionId, user: User) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Authenticate { conn_id, user, reply })
            .ok()?;
        rx.await.ok()
    }

    pub fn propose_update(&self, conn_id: ConnectionId, update: ParamUpdate) {
        let _ = self.tx.send(HubCommand::ProposeUpdate { conn_id, update });
    }

    pub fn resolve_conflict(&self, conn_id: ConnectionId, param: ParamName, resolved_value: f64) {
        let _ = self.tx.send(HubCommand::ResolveConflict {
            conn_id,
            param,
            resolved_value,
        });
    }

    pub async fn resync(&self) -> Option<SessionStatePayload> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Resync { reply }).ok()?;
        rx.await.ok()
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }

    /// Send a frame directly to one connection without bumping `seq` or
    /// fanning out to anyone else — used for replies only the requester
    /// should see (`auth:success`, `auth:failed`, `pong`, `session:state`).
    pub async fn unicast(&self, conn_id: ConnectionId, msg: ServerMessage) {
        let _ = self.tx.send(HubCommand::Unicast { conn_id, msg });
    }

    /// Drop every connection's outbound channel, forcing each connection
    /// task's forwarder to exit and its socket to close. Used by the admin
    /// `DELETE /sessions/{id}` endpoint.
    pub fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown);
    }

    /// Whether the actor task behind this handle is still running. A hub
    /// whose roster dropped to zero tears itself down; a stale handle left
    /// in the registry reports `false` here.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

async fn run(mut hub: HubState, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    info!(session_id = %hub.session_id, "hub started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Join { sender, reply } => {
                let conn_id = hub.next_conn_id;
                hub.next_conn_id += 1;
                hub.connections.insert(
                    conn_id,
                    Connection {
                        sender,
                        user_id: None,
                    },
                );
                let _ = reply.send(conn_id);
            }
            HubCommand::Leave { conn_id } => hub.handle_leave(conn_id).await,
            HubCommand::Authenticate { conn_id, user, reply } => {
                let snapshot = hub.handle_authenticate(conn_id, user).await;
                let _ = reply.send(snapshot);
            }
            HubCommand::ProposeUpdate { conn_id, update } => {
                hub.handle_propose(conn_id, update).await;
            }
            HubCommand::ResolveConflict {
                conn_id,
                param,
                resolved_value,
            } => {
                hub.handle_resolve(conn_id, param, resolved_value).await;
            }
            HubCommand::Resync { reply } => {
                let _ = reply.send(SessionStatePayload {
                    params: hub.state,
                    seq: hub.seq,
                });
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(hub.snapshot());
            }
            HubCommand::Unicast { conn_id, msg } => {
                let frame = msg.to_frame(None, None);
                hub.send_to(conn_id, frame);
            }
            HubCommand::Shutdown => {
                hub.connections.clear();
                break;
            }
        }

        // Empty → Active → Destroyed: once the last participant leaves,
        // tear down this task. A later join for the same session id
        // rehydrates a fresh Active hub from the persistence store.
        if hub.connections.is_empty() {
            debug!(session_id = %hub.session_id, "last participant left, tearing down hub");
            break;
        }
    }
    info!(session_id = %hub.session_id, "hub task exiting");
}

impl HubState {
    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            session_id: self.session_id.clone(),
            state: self.state,
            seq: self.seq,
            users: self.users.values().cloned().collect(),
        }
    }

    /// Send a frame to one connection, dropping it from the registry if
    /// the channel is closed (the connection task has already exited).
    fn send_to(&mut self, conn_id: ConnectionId, frame: Value) {
        let dead = match self.connections.get(&conn_id) {
            Some(conn) => conn.sender.send(frame).is_err(),
            None => return,
        };
        if dead {
            self.connections.remove(&conn_id);
        }
    }

    /// Fan a frame out to every connected client, optionally skipping one.
    fn broadcast(&mut self, msg: &ServerMessage, exclude: Option<ConnectionId>) {
        self.seq += 1;
        let frame = msg.to_frame(Some(self.seq), Some(Utc::now()));
        let targets: Vec<ConnectionId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| Some(*id) != exclude)
            .collect();
        for conn_id in targets {
            self.send_to(conn_id, frame.clone());
        }
    }

    async fn handle_authenticate(&mut self, conn_id: ConnectionId, user: User) -> HubSnapshot {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.user_id = Some(user.id.clone());
        }
        self.users.insert(user.id.clone(), user.clone());

        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let user_id = user.id.clone();
        let display_name = user.name.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_user(&session_id, &user_id, &display_name).await {
                warn!(session_id = %session_id, error = %e, "failed to persist joining user");
            }
        });

        self.broadcast(
            &ServerMessage::SessionJoined(paramsync_core::SessionJoinedPayload { user }),
            Some(conn_id),
        );

        self.snapshot()
    }

    async fn handle_leave(&mut self, conn_id: ConnectionId) {
        let user_id = self.connections.remove(&conn_id).and_then(|c| c.user_id);
        let Some(user_id) = user_id else { return };
        self.users.remove(&user_id);

        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let uid = user_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.remove_user(&session_id, &uid).await {
                warn!(session_id = %session_id, error = %e, "failed to remove departing user");
            }
        });

        self.broadcast(
            &ServerMessage::SessionLeft(paramsync_core::SessionLeftPayload { user_id }),
            None,
        );
    }

    /// Check every touched param against the conflict window, reject the
    /// whole proposal atomically on a bounds violation, and otherwise
    /// apply + broadcast + persist as one step.
    async fn handle_propose(&mut self, conn_id: ConnectionId, update: ParamUpdate) {
        let Some(user_id) = self.connections.get(&conn_id).and_then(|c| c.user_id.clone()) else {
            return;
        };
        if update.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut conflicts = Vec::new();
        for (name, value) in update.iter() {
            if let Some(conflict) = self.detect_conflict(name, value, &user_id, now) {
                conflicts.push(conflict);
            }
        }

        if !conflicts.is_empty() {
            for conflict in conflicts {
                let frame = ServerMessage::ConflictDetected(conflict).to_frame(None, None);
                self.send_to(conn_id, frame);
            }
            return;
        }

        let changed = match self.state.apply(&update) {
            Ok(changed) => changed,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "dropped out-of-bounds proposal");
                return;
            }
        };
        if changed.is_empty() {
            return;
        }

        for name in &changed {
            self.last_update.insert(*name, now);
        }

        self.broadcast(
            &ServerMessage::ParamBroadcast(paramsync_core::ParamBroadcastPayload {
                user_id: user_id.clone(),
                params: update.clone(),
            }),
            Some(conn_id),
        );

        self.persist_update(user_id, update).await;
    }

    async fn handle_resolve(&mut self, conn_id: ConnectionId, param: ParamName, resolved_value: f64) {
        let Some(user_id) = self.connections.get(&conn_id).and_then(|c| c.user_id.clone()) else {
            return;
        };
        let update = ParamUpdate::single(param, resolved_value);
        let changed = match self.state.apply(&update) {
            Ok(changed) => changed,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "dropped out-of-bounds conflict resolution");
                return;
            }
        };
        self.last_update.insert(param, Instant::now());
        if changed.is_empty() {
            return;
        }

        self.broadcast(
            &ServerMessage::ParamBroadcast(paramsync_core::ParamBroadcastPayload {
                user_id: user_id.clone(),
                params: update.clone(),
            }),
            Some(conn_id),
        );

        self.persist_update(user_id, update).await;
    }

    /// Compare `value` against the currently stored value (not necessarily
    /// the proposal that actually wrote it) — this intentionally does not
    /// track a true "last writer", only the fact that the field moved
    /// recently.
    fn detect_conflict(
        &self,
        param: ParamName,
        value: f64,
        user_id: &str,
        now: Instant,
    ) -> Option<ConflictDetectedPayload> {
        let last = *self.last_update.get(&param)?;
        if now.duration_since(last) >= CONFLICT_WINDOW {
            return None;
        }

        let current = self.state.get(param);
        if (current - value).abs() <= CONFLICT_TOLERANCE {
            return None;
        }

        let other = self.users.values().find(|u| u.id != user_id);
        Some(ConflictDetectedPayload {
            param: param.as_str().to_string(),
            your_value: value,
            their_value: current,
            their_user_id: other.map(|u| u.id.clone()).unwrap_or_else(|| "unknown".to_string()),
            their_user_name: other
                .map(|u| u.name.clone())
                .unwrap_or_else(|| "Another user".to_string()),
        })
    }

    async fn persist_update(&self, user_id: String, update: ParamUpdate) {
        let snapshot = StateSnapshot {
            state: self.state,
            seq: self.seq,
            updated_at: Utc::now(),
        };
        let event = HistoryEvent {
            seq: self.seq,
            user_id,
            params: update,
            timestamp: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_state(&session_id, &snapshot).await {
                warn!(session_id = %session_id, error = %e, "failed to persist session state");
            }
            if let Err(e) = store.append_history(&session_id, &event).await {
                warn!(session_id = %session_id, error = %e, "failed to persist history event");
            }
        });
    }
}

/// Process-wide registry of running hubs, keyed by session id. Creates a
/// hub on first contact, restoring from the persistence store if a
/// snapshot exists.
pub struct HubRegistry {
    hubs: DashMap<String, HubHandle>,
    store: Arc<dyn PersistenceStore>,
}

impl HubRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        HubRegistry {
            hubs: DashMap::new(),
            store,
        }
    }

    /// Get the hub for a session, creating and (best-effort) restoring it
    /// from persistence if this is the first connection to see it, or if
    /// the previous hub already tore itself down after its last
    /// participant left.
    pub async fn get_or_create(&self, session_id: &str) -> HubHandle {
        if let Some(handle) = self.hubs.get(session_id) {
            if handle.is_alive() {
                return handle.clone();
            }
        }
        // Either there was no entry, or the previous hub tore itself down
        // after its last participant left; drop the stale handle so the
        // fresh one below takes its place.
        self.hubs.remove(session_id);

        let restored = self.store.load_state(session_id).await.unwrap_or_else(|e| {
            warn!(session_id = %session_id, error = %e, "failed to load session state, starting fresh");
            None
        });

        let (state, seq) = match restored {
            Some(snapshot) => {
                info!(session_id = %session_id, seq = snapshot.seq, "restored session from persistence");
                (snapshot.state, snapshot.seq)
            }
            None => {
                info!(session_id = %session_id, "created new session");
                (SessionState::new(), 0)
            }
        };

        // Two connections racing to create the same session each spawn a
        // hub task; `entry().or_insert` keeps only one in the registry and
        // the loser's task exits on its own once its sender is dropped.
        let handle = HubHandle::spawn(session_id.to_string(), state, seq, Arc::clone(&self.store));
        self.hubs
            .entry(session_id.to_string())
            .or_insert(handle)
            .clone()
    }

    pub fn existing(&self, session_id: &str) -> Option<HubHandle> {
        self.hubs.get(session_id).map(|h| h.clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.hubs.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down a live session: disconnects every socket and removes the
    /// hub so the next `get_or_create` starts fresh (or restores from
    /// whatever the store still has, if `delete_history` wasn't also run).
    pub fn remove(&self, session_id: &str) -> bool {
        if let Some((_, handle)) = self.hubs.remove(session_id) {
            handle.shutdown();
            true
        } else {
            false
        }
    }
}
