//! Shared types for the parameter-sync collaboration server: the wire
//! protocol, session state, and the principal produced by authentication.
//! Kept dependency-light so it can be pulled in by both the server binary
//! and any future client tooling.

pub mod error;
pub mod message;
pub mod principal;
pub mod state;

pub use error::{AuthError, ProtocolError, StoreError, ValidationError};
pub use message::{
    AuthFailedPayload, AuthSuccessPayload, ClientMessage, ConflictDetectedPayload,
    ConflictResolvedRequest, CurrentStatePayload, ParamBroadcastPayload, RawFrame, ResyncRequest,
    ServerMessage, SessionJoinedPayload, SessionLeftPayload, SessionStatePayload,
};
pub use principal::{Principal, User};
pub use state::{HistoryEvent, ParamName, ParamUpdate, SessionState, StateSnapshot};
