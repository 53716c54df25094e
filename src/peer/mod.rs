pub mod media;
pub mod session;
pub mod state;
pub mod types;

pub use media::{LocalStream, LocalTrack, MediaDevices, NullDevices};
pub use session::{MediaSession, SessionEvent};
pub use state::ConnectionState;
pub use types::{IceCandidate, SdpPayload, ServerConfig};
