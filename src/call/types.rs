use crate::backend::CallKind;
use crate::peer::session::MediaSession;
use crate::peer::types::SdpPayload;
use std::sync::Arc;
use tokio::time::Instant;
use webrtc::track::track_remote::TrackRemote;

/// Состояние звонка глазами контроллера. `Idle` — звонка нет.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Active,
    Ended,
    Missed,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::OutgoingRinging => "outgoing_ringing",
            CallState::IncomingRinging => "incoming_ringing",
            CallState::Active => "active",
            CallState::Ended => "ended",
            CallState::Missed => "missed",
            CallState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Missed | CallState::Failed)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, CallState::OutgoingRinging | CallState::IncomingRinging)
    }
}

/// Кто мы в этом звонке
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Receiver,
}

/// Почему звонок закончился
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    Rejected,
    Missed,
    Failed,
}

/// Живой звонок; живёт внутри контроллера от initiate до терминального
/// состояния, после чего уничтожается
pub(crate) struct CallSession {
    pub call_id: String,
    pub kind: CallKind,
    pub role: CallRole,
    pub remote_user_id: String,
    pub state: CallState,
    pub media: Option<Arc<MediaSession>>,
    /// offer, пришедший раньше, чем мы успели принять звонок
    pub pending_offer: Option<SdpPayload>,
    pub connected_at: Option<Instant>,
    /// Монотонный счётчик: результаты отставших асинхронных операций
    /// с чужим поколением отбрасываются
    pub generation: u64,
    pub ring_timer: Option<tokio::task::JoinHandle<()>>,
    pub was_connected: bool,
}

/// Снимок звонка для слоя представления
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call_id: String,
    pub kind: CallKind,
    pub role: CallRole,
    pub remote_user_id: String,
    pub state: CallState,
}

/// События для слоя представления
#[derive(Clone)]
pub enum CallEvent {
    IncomingCall {
        call_id: String,
        from: String,
        kind: CallKind,
    },
    OutgoingCall {
        call_id: String,
        to: String,
        kind: CallKind,
    },
    CallActive {
        call_id: String,
    },
    RemoteTrack {
        call_id: String,
        track: Arc<TrackRemote>,
    },
    ConnectionProblem {
        call_id: String,
    },
    ConnectionRecovered {
        call_id: String,
    },
    CallEnded {
        call_id: String,
        reason: EndReason,
    },
    /// Запись в бэкенд не удалась; звонок это не ломает
    BackendWarning {
        call_id: String,
        message: String,
    },
}

impl CallEvent {
    /// Имя события для логов
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::IncomingCall { .. } => "incoming_call",
            CallEvent::OutgoingCall { .. } => "outgoing_call",
            CallEvent::CallActive { .. } => "call_active",
            CallEvent::RemoteTrack { .. } => "remote_track",
            CallEvent::ConnectionProblem { .. } => "connection_problem",
            CallEvent::ConnectionRecovered { .. } => "connection_recovered",
            CallEvent::CallEnded { .. } => "call_ended",
            CallEvent::BackendWarning { .. } => "backend_warning",
        }
    }
}
