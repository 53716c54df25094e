use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{log, warn};
use crate::peer::media::{LocalStream, LocalTrack, MediaDevices};
use crate::peer::state::ConnectionState;
use crate::peer::types::{IceCandidate, SdpPayload, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// События медиа-сессии для контроллера
pub enum SessionEvent {
    /// Локальный ICE кандидат, его нужно переслать собеседнику
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack(Arc<TrackRemote>),
}

/// Часть состояния, доступная обработчикам peer connection
struct Shared {
    call_id: String,
    grace: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Отложенная задача для graceful disconnect
    disconnect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    remote_tracks: Mutex<Vec<Arc<TrackRemote>>>,
}

/// Медиа-сессия одного звонка: локальный захват плюс peer connection.
/// Кандидаты, пришедшие до remote description, копятся в очереди и
/// применяются после его установки в порядке поступления.
pub struct MediaSession {
    pc: Arc<RTCPeerConnection>,
    local: LocalStream,
    shared: Arc<Shared>,
    ice_queue: Mutex<VecDeque<IceCandidate>>,
    queue_cap: usize,
    local_desc_set: AtomicBool,
    remote_desc_set: AtomicBool,
    closed: AtomicBool,
}

impl MediaSession {
    /// Захватывает устройства и создаёт peer connection.
    /// Аудио берём всегда, видео — только для видеозвонка.
    pub async fn new(
        devices: &dyn MediaDevices,
        want_video: bool,
        cfg: &CallConfig,
        call_id: String,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, CallError> {
        let audio = devices.open_audio().await?;
        let video = if want_video {
            Some(devices.open_video().await?)
        } else {
            None
        };
        let local = LocalStream {
            audio: Some(audio),
            video,
        };

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&cfg.ice_servers))
                .await?,
        );

        for local_track in local.tracks() {
            pc.add_track(local_track.track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        // Голосовой звонок всё равно готов принимать видео:
        // апгрейд до видео не требует повторных переговоров
        if !want_video {
            pc.add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let shared = Arc::new(Shared {
            call_id,
            grace: cfg.grace_period,
            events,
            disconnect_task: Mutex::new(None),
            remote_tracks: Mutex::new(Vec::new()),
        });

        let shared_ice = shared.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            if let Some(c) = cand {
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            call_id: shared_ice.call_id.clone(),
                        };
                        let _ = shared_ice
                            .events
                            .send(SessionEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn(&format!("Failed to serialize local candidate: {:?}", e)),
                }
            } else {
                // cand == None означает конец сбора
                log("ICE candidate gathering completed");
            }
            Box::pin(async {})
        }));

        let shared_track = shared.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                log(&format!("Remote track added: {}", track.kind()));
                shared_track
                    .remote_tracks
                    .lock()
                    .unwrap()
                    .push(track.clone());
                let _ = shared_track.events.send(SessionEvent::RemoteTrack(track));
                Box::pin(async {})
            },
        ));

        let shared_state = shared.clone();
        let pc_state = pc.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            log(&format!("Peer connection state changed to: {:?}", st));
            let shared = shared_state.clone();

            match st {
                RTCPeerConnectionState::Connecting => {
                    let _ = shared
                        .events
                        .send(SessionEvent::StateChanged(ConnectionState::Connecting));
                }

                RTCPeerConnectionState::Connected => {
                    // отменяем отложенный disconnect, если он был
                    if let Some(handle) = shared.disconnect_task.lock().unwrap().take() {
                        log("Aborting pending disconnect task");
                        handle.abort();
                    }
                    let _ = shared
                        .events
                        .send(SessionEvent::StateChanged(ConnectionState::Connected));
                }

                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                    // уже ожидаем? – ничего не делаем
                    if shared.disconnect_task.lock().unwrap().is_some() {
                        log("Disconnect task already pending, ignoring");
                        return Box::pin(async {});
                    }
                    let _ = shared
                        .events
                        .send(SessionEvent::StateChanged(ConnectionState::Disconnected));

                    // ставим отложенную проверку: либо соединение вернётся,
                    // либо сообщаем о провале
                    let pc = pc_state.clone();
                    let shared_grace = shared.clone();
                    let handle = tokio::spawn(async move {
                        log(&format!(
                            "Grace period started, waiting {} s",
                            shared_grace.grace.as_secs()
                        ));
                        sleep(shared_grace.grace).await;

                        let state_now = pc.connection_state();
                        if state_now != RTCPeerConnectionState::Connected {
                            log(&format!(
                                "Grace over, state={:?} - reporting failure",
                                state_now
                            ));
                            let _ = shared_grace
                                .events
                                .send(SessionEvent::StateChanged(ConnectionState::Failed));
                        } else {
                            log("Connection recovered during grace period");
                        }
                    });
                    *shared.disconnect_task.lock().unwrap() = Some(handle);
                }

                RTCPeerConnectionState::Closed => {
                    if let Some(handle) = shared.disconnect_task.lock().unwrap().take() {
                        handle.abort();
                    }
                    let _ = shared
                        .events
                        .send(SessionEvent::StateChanged(ConnectionState::Closed));
                }

                _ => {}
            }
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            local,
            shared,
            ice_queue: Mutex::new(VecDeque::new()),
            queue_cap: cfg.ice_queue_cap,
            local_desc_set: AtomicBool::new(false),
            remote_desc_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    /// Упаковывает текущий local description в `SdpPayload`:
    /// `id` — идентификатор звонка, `ts` — момент создания
    async fn local_payload(&self) -> Result<SdpPayload, CallError> {
        let sdp = self
            .pc
            .local_description()
            .await
            .ok_or(CallError::InvalidSessionState("local description missing"))?;
        Ok(SdpPayload {
            sdp,
            id: self.shared.call_id.clone(),
            ts: chrono::Utc::now().timestamp(),
        })
    }

    /// Offer с запросом приёма и аудио, и видео
    pub async fn create_offer(&self) -> Result<SdpPayload, CallError> {
        self.ensure_open()?;
        if self.local_desc_set.load(Ordering::SeqCst) {
            return Err(CallError::InvalidSessionState(
                "local description already set",
            ));
        }
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_desc_set.store(true, Ordering::SeqCst);
        self.local_payload().await
    }

    /// Answer; допустим только после применения remote offer
    pub async fn create_answer(&self) -> Result<SdpPayload, CallError> {
        self.ensure_open()?;
        if !self.remote_desc_set.load(Ordering::SeqCst) {
            return Err(CallError::InvalidSessionState(
                "answer requested before remote offer",
            ));
        }
        if self.local_desc_set.load(Ordering::SeqCst) {
            return Err(CallError::InvalidSessionState(
                "local description already set",
            ));
        }
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_desc_set.store(true, Ordering::SeqCst);
        self.local_payload().await
    }

    /// Применяет remote description и сливает отложенные кандидаты
    /// в порядке поступления
    pub async fn set_remote_description(
        &self,
        sdp: RTCSessionDescription,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.remote_desc_set.load(Ordering::SeqCst) {
            return Err(CallError::InvalidSessionState(
                "remote description already set",
            ));
        }
        if sdp.sdp_type == RTCSdpType::Answer && !self.local_desc_set.load(Ordering::SeqCst) {
            return Err(CallError::InvalidSessionState(
                "answer arrived before local offer",
            ));
        }
        self.pc.set_remote_description(sdp).await?;
        self.remote_desc_set.store(true, Ordering::SeqCst);

        let queued: Vec<IceCandidate> = {
            let mut queue = self.ice_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if !queued.is_empty() {
            log(&format!("Applying {} queued candidates", queued.len()));
        }
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate.to_init()).await {
                warn(&format!("Failed to apply queued candidate: {:?}", e));
            }
        }
        Ok(())
    }

    /// Кандидат от удалённой стороны: до remote description — в очередь,
    /// после — сразу в peer connection. Кривой кандидат не валит звонок.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            // запоздавший сигналинг после teardown
            return Ok(());
        }
        if !self.remote_desc_set.load(Ordering::SeqCst) {
            let mut queue = self.ice_queue.lock().unwrap();
            if queue.len() >= self.queue_cap {
                return Err(CallError::SignalingOverflow(self.queue_cap));
            }
            log("Remote description not set yet, queuing candidate");
            queue.push_back(candidate);
            return Ok(());
        }
        if let Err(e) = self.pc.add_ice_candidate(candidate.to_init()).await {
            warn(&format!("Dropping malformed ICE candidate: {:?}", e));
        }
        Ok(())
    }

    /// Mute/unmute без переговоров; no-op если трека нет
    pub fn toggle_audio(&self, enabled: bool) {
        self.local.toggle_audio(enabled);
    }

    pub fn toggle_video(&self, enabled: bool) {
        self.local.toggle_video(enabled);
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        if self.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.local.tracks()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        if self.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.shared.remote_tracks.lock().unwrap().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    /// Останавливает треки и закрывает соединение. Идемпотентна:
    /// повторный вызов ничего не делает.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log("Tearing down media session");
        if let Some(handle) = self.shared.disconnect_task.lock().unwrap().take() {
            handle.abort();
        }
        self.local.stop();
        if let Err(e) = self.pc.close().await {
            warn(&format!("Peer connection close failed: {:?}", e));
        }
        self.shared.remote_tracks.lock().unwrap().clear();
        self.ice_queue.lock().unwrap().clear();
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CallError::InvalidSessionState("session closed"))
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_candidates(&self) -> Vec<IceCandidate> {
        self.ice_queue.lock().unwrap().iter().cloned().collect()
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}
