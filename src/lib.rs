pub mod backend;
pub mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod signaling;
mod utils;

pub use backend::{BackendError, CallKind, CallParticipant, CallRecord, CallStatus, CallStore, CallUpdate};
pub use call::{CallController, CallEvent, CallRole, CallSnapshot, CallState, EndReason};
pub use config::CallConfig;
pub use error::CallError;
pub use peer::{
    ConnectionState, IceCandidate, LocalStream, LocalTrack, MediaDevices, MediaSession,
    NullDevices, SdpPayload, ServerConfig, SessionEvent,
};
pub use signaling::{Signal, SignalingChannel};
