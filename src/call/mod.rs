pub mod controller;
pub mod types;

pub use controller::CallController;
pub use types::{CallEvent, CallRole, CallSnapshot, CallState, EndReason};
