use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Тип звонка
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }

    pub fn wants_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }
}

/// Статус строки в таблице calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }
}

/// Участник звонка (как его хранит бэкенд)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
}

impl CallParticipant {
    pub fn new(user_id: &str, video: bool) -> Self {
        Self {
            user_id: user_id.to_owned(),
            joined_at: None,
            left_at: None,
            is_muted: false,
            is_video_enabled: video,
        }
    }
}

/// Строка таблицы calls; поля в camelCase, как их отдаёт бэкенд
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub initiator_id: String,
    pub participants: Vec<CallParticipant>,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub is_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
}

impl CallRecord {
    /// Новая строка в статусе ringing
    pub fn ringing(
        call_id: &str,
        kind: CallKind,
        chat_id: Option<&str>,
        initiator_id: &str,
        remote_user_id: &str,
    ) -> Self {
        Self {
            id: call_id.to_owned(),
            kind,
            chat_id: chat_id.map(str::to_owned),
            initiator_id: initiator_id.to_owned(),
            participants: vec![
                CallParticipant::new(initiator_id, kind.wants_video()),
                CallParticipant::new(remote_user_id, kind.wants_video()),
            ],
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            duration: None,
            is_recorded: false,
            recording_url: None,
        }
    }
}

/// Частичное обновление строки звонка
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl CallUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Переход в active: статус + момент начала
    pub fn activated(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CallStatus::Active),
            started_at: Some(at),
            ..Default::default()
        }
    }

    /// Завершение: статус + момент окончания + длительность в секундах
    pub fn finished(at: DateTime<Utc>, duration: i64) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            ended_at: Some(at),
            duration: Some(duration),
            ..Default::default()
        }
    }
}

/// Ошибка бэкенда; для звонка не фатальна
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// CRUD по таблице calls. Реализация живёт снаружи (REST-клиент бэкенда);
/// движку нужны только вставка и частичное обновление.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert_call(&self, record: &CallRecord) -> Result<(), BackendError>;
    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<(), BackendError>;
}
