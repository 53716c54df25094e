use thiserror::Error;

/// Ошибки движка звонков
#[derive(Debug, Error)]
pub enum CallError {
    /// Пользователь не дал доступ к микрофону/камере
    #[error("media permission denied")]
    PermissionDenied,

    /// Устройство захвата недоступно
    #[error("capture device unavailable")]
    DeviceUnavailable,

    /// Операция вызвана не в том состоянии
    #[error("invalid session state: {0}")]
    InvalidSessionState(&'static str),

    /// ICE не дошёл до connected; TURN-фолбэка нет, повторов нет
    #[error("peer connectivity failed")]
    ConnectivityFailed,

    /// Уже есть незавершённый звонок
    #[error("already in a call")]
    AlreadyInCall,

    /// Очередь remote-кандидатов переполнена до установки remote description
    #[error("ice candidate queue overflow (cap {0})")]
    SignalingOverflow(usize),

    /// Запись в бэкенд не удалась (не фатально для звонка)
    #[error("backend write failed: {0}")]
    BackendWriteFailed(String),

    /// Отправка в сигнальный канал не удалась
    #[error("signaling send failed: {0}")]
    SignalingSendFailed(String),

    /// Пришёл нечитаемый payload
    #[error("malformed signaling payload: {0}")]
    MalformedPayload(String),

    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
}
