use crate::error::CallError;
use crate::logger::log;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Источник локальных треков: платформа владеет реальным захватом,
/// движок получает готовые треки. Ошибки доступа маппятся в
/// `PermissionDenied` / `DeviceUnavailable`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_audio(&self) -> Result<LocalTrack, CallError>;
    async fn open_video(&self) -> Result<LocalTrack, CallError>;
}

/// Локальный трек с флагами для захватывающей стороны:
/// `enabled` — писать ли кадры (mute без перезаключения сессии),
/// `live` — false после teardown, насос захвата должен остановиться.
#[derive(Clone)]
pub struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Локальный поток звонка: аудио всегда, видео по запросу
pub struct LocalStream {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalStream {
    /// Mute/unmute; no-op если трека нет
    pub fn toggle_audio(&self, enabled: bool) {
        if let Some(a) = &self.audio {
            a.set_enabled(enabled);
            log(&format!("Audio track enabled={}", enabled));
        }
    }

    pub fn toggle_video(&self, enabled: bool) {
        if let Some(v) = &self.video {
            v.set_enabled(enabled);
            log(&format!("Video track enabled={}", enabled));
        }
    }

    /// Останавливает все локальные треки
    pub fn stop(&self) {
        if let Some(a) = &self.audio {
            a.stop();
        }
        if let Some(v) = &self.video {
            v.stop();
        }
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }
}

/// Opus-трек с дефолтными параметрами кодека
pub fn new_audio_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        "zvonok-stream".to_owned(),
    ))
}

/// VP8-трек с дефолтными параметрами кодека
pub fn new_video_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "zvonok-stream".to_owned(),
    ))
}

/// Источник без реального захвата: отдаёт треки, в которые никто не пишет.
/// Используется в headless-режиме и тестах.
pub struct NullDevices;

#[async_trait]
impl MediaDevices for NullDevices {
    async fn open_audio(&self) -> Result<LocalTrack, CallError> {
        Ok(LocalTrack::new(new_audio_track()))
    }

    async fn open_video(&self) -> Result<LocalTrack, CallError> {
        Ok(LocalTrack::new(new_video_track()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toggle_is_noop_without_track() {
        let stream = LocalStream {
            audio: None,
            video: None,
        };
        // не должно паниковать
        stream.toggle_audio(false);
        stream.toggle_video(false);
        assert!(stream.tracks().is_empty());
    }

    #[tokio::test]
    async fn local_track_flags() {
        let devices = NullDevices;
        let track = devices.open_audio().await.unwrap();
        assert!(track.is_enabled());
        assert!(track.is_live());

        track.set_enabled(false);
        assert!(!track.is_enabled());

        track.stop();
        assert!(!track.is_live());
    }
}
