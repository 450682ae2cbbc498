//! The closed wire message set. Every server→client frame carries
//! `type`, an optional `seq`/`timestamp`, and a `payload`; client→server
//! frames carry `type` and `payload`. Unknown `type` values are a
//! [`ProtocolError::UnknownType`] the caller is expected to ignore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::principal::User;
use crate::state::{ParamName, ParamUpdate, SessionState};

/// Inbound frame shape, before the `payload` has been matched against a
/// known `type`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictResolvedRequest {
    pub param: String,
    #[serde(rename = "resolvedValue")]
    pub resolved_value: f64,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResyncRequest {
    #[serde(rename = "lastSeenSeq")]
    pub last_seen_seq: u64,
}

/// A parsed, typed client→server message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth(AuthRequest),
    ParamUpdate(ParamUpdate),
    ConflictResolved(ConflictResolvedRequest),
    Resync(ResyncRequest),
    Ping,
}

impl ClientMessage {
    /// Parse a raw JSON frame. Malformed payloads and unrecognized types
    /// are both reported as a [`ProtocolError`] — the connection state
    /// machine drops both silently rather than tearing down the socket.
    pub fn parse(frame: RawFrame) -> Result<Self, ProtocolError> {
        let malformed = |e: serde_json::Error| {
            ProtocolError::MalformedPayload(frame.kind.clone(), e.to_string())
        };

        match frame.kind.as_str() {
            "auth" => Ok(ClientMessage::Auth(
                serde_json::from_value(frame.payload).map_err(malformed)?,
            )),
            "param:update" => Ok(ClientMessage::ParamUpdate(
                serde_json::from_value(frame.payload).map_err(malformed)?,
            )),
            "conflict:resolved" => Ok(ClientMessage::ConflictResolved(
                serde_json::from_value(frame.payload).map_err(malformed)?,
            )),
            "session:resync" => Ok(ClientMessage::Resync(
                serde_json::from_value(frame.payload).map_err(malformed)?,
            )),
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn resolve_param_name(raw: &str) -> Option<ParamName> {
    match raw {
        "mu" => Some(ParamName::Mu),
        "omega" => Some(ParamName::Omega),
        "kappa" => Some(ParamName::Kappa),
        _ => None,
    }
}

impl ConflictResolvedRequest {
    pub fn param_name(&self) -> Option<ParamName> {
        resolve_param_name(&self.param)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthSuccessPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub users: Vec<User>,
    #[serde(rename = "currentState")]
    pub current_state: CurrentStatePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentStatePayload {
    pub params: SessionState,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthFailedPayload {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamBroadcastPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub params: ParamUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictDetectedPayload {
    pub param: String,
    #[serde(rename = "yourValue")]
    pub your_value: f64,
    #[serde(rename = "theirValue")]
    pub their_value: f64,
    #[serde(rename = "theirUserId")]
    pub their_user_id: String,
    #[serde(rename = "theirUserName")]
    pub their_user_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionJoinedPayload {
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionLeftPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatePayload {
    pub params: SessionState,
    pub seq: u64,
}

/// A typed, constructed server→client message, ready to be stamped with
/// `seq`/`timestamp` and serialized.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    AuthSuccess(AuthSuccessPayload),
    AuthFailed(AuthFailedPayload),
    ParamBroadcast(ParamBroadcastPayload),
    ConflictDetected(ConflictDetectedPayload),
    SessionJoined(SessionJoinedPayload),
    SessionLeft(SessionLeftPayload),
    SessionState(SessionStatePayload),
    Pong,
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::AuthSuccess(_) => "auth:success",
            ServerMessage::AuthFailed(_) => "auth:failed",
            ServerMessage::ParamBroadcast(_) => "param:broadcast",
            ServerMessage::ConflictDetected(_) => "conflict:detected",
            ServerMessage::SessionJoined(_) => "session:joined",
            ServerMessage::SessionLeft(_) => "session:left",
            ServerMessage::SessionState(_) => "session:state",
            ServerMessage::Pong => "pong",
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            ServerMessage::AuthSuccess(p) => serde_json::to_value(p),
            ServerMessage::AuthFailed(p) => serde_json::to_value(p),
            ServerMessage::ParamBroadcast(p) => serde_json::to_value(p),
            ServerMessage::ConflictDetected(p) => serde_json::to_value(p),
            ServerMessage::SessionJoined(p) => serde_json::to_value(p),
            ServerMessage::SessionLeft(p) => serde_json::to_value(p),
            ServerMessage::SessionState(p) => serde_json::to_value(p),
            ServerMessage::Pong => Ok(Value::Object(Default::default())),
        }
        .unwrap_or(Value::Null)
    }

    /// Build the full outbound frame. `seq`/`timestamp` are present only
    /// on broadcasts.
    pub fn to_frame(&self, seq: Option<u64>, timestamp: Option<DateTime<Utc>>) -> Value {
        let mut frame = serde_json::json!({
            "type": self.type_name(),
            "payload": self.payload_value(),
        });
        let obj = frame.as_object_mut().expect("frame is always an object");
        if let Some(seq) = seq {
            obj.insert("seq".to_string(), Value::from(seq));
        }
        if let Some(timestamp) = timestamp {
            obj.insert("timestamp".to_string(), Value::from(timestamp.to_rfc3339()));
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_param_update() {
        let frame = RawFrame {
            kind: "param:update".to_string(),
            payload: serde_json::json!({"mu": 0.6}),
        };
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::ParamUpdate(update) => assert_eq!(update.mu, Some(0.6)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported_not_panicked() {
        let frame = RawFrame {
            kind: "frobnicate".to_string(),
            payload: Value::Null,
        };
        assert!(matches!(
            ClientMessage::parse(frame),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn server_message_frame_carries_seq_and_timestamp() {
        let msg = ServerMessage::ParamBroadcast(ParamBroadcastPayload {
            user_id: "u1".to_string(),
            params: ParamUpdate::single(ParamName::Mu, 0.6),
        });
        let frame = msg.to_frame(Some(3), Some(Utc::now()));
        assert_eq!(frame["type"], "param:broadcast");
        assert_eq!(frame["seq"], 3);
        assert!(frame.get("timestamp").is_some());
    }

    #[test]
    fn auth_failed_frame_has_no_seq() {
        let msg = ServerMessage::AuthFailed(AuthFailedPayload {
            error: "bad token".to_string(),
        });
        let frame = msg.to_frame(None, None);
        assert!(frame.get("seq").is_none());
    }
}
