use thiserror::Error;

/// Outcome of bearer-token verification. Two-variant by design: callers
/// never need more than "ok" or "why not".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid or malformed token")]
    Invalid,
    #[error("token has expired")]
    Expired,
}

/// A `SessionState::apply` proposal that touches a primary field outside
/// its declared bounds. The whole proposal is rejected atomically.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("{field} = {value} is outside [{min}, {max}]")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// A well-formed frame whose `type` the protocol does not recognize, or
/// whose payload doesn't match the shape the named type expects. Both
/// are dropped silently by the connection state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed payload for {0:?}: {1}")]
    MalformedPayload(String, String),
}

/// Opaque failure from the persistence store. Never surfaced to clients;
/// the hub's in-memory state remains authoritative regardless.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);
