use crate::backend::{CallKind, CallRecord, CallStatus, CallStore, CallUpdate};
use crate::call::types::{CallEvent, CallRole, CallSession, CallSnapshot, CallState, EndReason};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::{log, warn};
use crate::peer::media::MediaDevices;
use crate::peer::session::{MediaSession, SessionEvent};
use crate::peer::state::ConnectionState;
use crate::signaling::{decode_sdp, encode_sdp, Signal, SignalingChannel};
use crate::utils::random_id;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep, Instant};

/// Контроллер жизненного цикла звонков: связывает сигнальный канал,
/// медиа-сессию и таблицу calls. Все зависимости внедряются при создании;
/// входящие события канала доставляет его владелец через `handle_signal`.
///
/// Одновременно живёт не больше одного незавершённого звонка.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

struct Inner {
    user_id: String,
    cfg: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    store: Arc<dyn CallStore>,
    devices: Arc<dyn MediaDevices>,
    slot: Mutex<Slot>,
    events: broadcast::Sender<CallEvent>,
}

/// Единственный слот звонка плюс счётчик поколений
struct Slot {
    current: Option<CallSession>,
    generation: u64,
}

impl CallController {
    pub fn new(
        user_id: &str,
        signaling: Arc<dyn SignalingChannel>,
        store: Arc<dyn CallStore>,
        devices: Arc<dyn MediaDevices>,
        cfg: CallConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.to_owned(),
                cfg,
                signaling,
                store,
                devices,
                slot: Mutex::new(Slot {
                    current: None,
                    generation: 0,
                }),
                events,
            }),
        }
    }

    /// События для слоя представления
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub async fn state(&self) -> CallState {
        let slot = self.inner.slot.lock().await;
        slot.current
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let slot = self.inner.slot.lock().await;
        slot.current.as_ref().map(|s| CallSnapshot {
            call_id: s.call_id.clone(),
            kind: s.kind,
            role: s.role,
            remote_user_id: s.remote_user_id.clone(),
            state: s.state,
        })
    }

    /// Исходящий звонок: строка в таблице calls + `initiate_call` пиру.
    /// Разрешён только из idle, иначе `AlreadyInCall` — без записи
    /// и без сигналинга.
    pub async fn place_call(
        &self,
        remote_user_id: &str,
        kind: CallKind,
        chat_id: Option<&str>,
    ) -> Result<String, CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        if slot.current.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let call_id = random_id();
        slot.generation += 1;
        let generation = slot.generation;
        log(&format!(
            "Placing {} call {} to {}",
            kind.as_str(),
            call_id,
            remote_user_id
        ));

        // запись в бэкенд не блокирует сигналинг
        let record = CallRecord::ringing(&call_id, kind, chat_id, &inner.user_id, remote_user_id);
        inner.write_insert(&call_id, &record).await;

        if let Err(e) = inner
            .signaling
            .send(
                remote_user_id,
                Signal::InitiateCall {
                    call_id: call_id.clone(),
                    kind,
                    from: inner.user_id.clone(),
                },
            )
            .await
        {
            warn(&format!("initiate_call failed to send: {}", e));
            inner
                .write_update(&call_id, CallUpdate::status(CallStatus::Ended))
                .await;
            return Err(e);
        }

        slot.current = Some(CallSession {
            call_id: call_id.clone(),
            kind,
            role: CallRole::Initiator,
            remote_user_id: remote_user_id.to_owned(),
            state: CallState::OutgoingRinging,
            media: None,
            pending_offer: None,
            connected_at: None,
            generation,
            ring_timer: None,
            was_connected: false,
        });
        // канал не подтверждает доставку, поэтому таймаут у обеих сторон свой
        inner.arm_ring_timer(slot.current.as_mut().unwrap());

        inner.emit(CallEvent::OutgoingCall {
            call_id: call_id.clone(),
            to: remote_user_id.to_owned(),
            kind,
        });
        Ok(call_id)
    }

    /// Принять входящий звонок. Захват устройств — точка приостановки:
    /// к её завершению звонок мог закончиться, поэтому состояние
    /// перепроверяется перед применением результата.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, kind, remote, generation) = {
            let slot = inner.slot.lock().await;
            match &slot.current {
                Some(s) if s.state == CallState::IncomingRinging => (
                    s.call_id.clone(),
                    s.kind,
                    s.remote_user_id.clone(),
                    s.generation,
                ),
                _ => {
                    return Err(CallError::InvalidSessionState("no incoming call to accept"))
                }
            }
        };

        let media = match inner.new_media_session(&call_id, kind).await {
            Ok(media) => media,
            Err(e) => {
                inner.abort_setup(&call_id, generation, &e).await;
                return Err(e);
            }
        };

        let mut slot = inner.slot.lock().await;
        let still_ringing = slot.current.as_ref().map_or(false, |s| {
            s.call_id == call_id
                && s.generation == generation
                && s.state == CallState::IncomingRinging
        });
        if !still_ringing {
            drop(slot);
            // звонок успели завершить, пока мы открывали устройства
            media.teardown().await;
            return Err(CallError::InvalidSessionState("call no longer ringing"));
        }

        let pending = {
            let session = slot.current.as_mut().unwrap();
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            session.media = Some(media.clone());
            session.pending_offer.take()
        };

        if let Err(e) = inner
            .signaling
            .send(
                &remote,
                Signal::AcceptCall {
                    call_id: call_id.clone(),
                },
            )
            .await
        {
            warn(&format!("accept_call failed to send: {}", e));
            let session = slot.current.take().unwrap();
            inner
                .finish_call(
                    session,
                    EndReason::Failed,
                    None,
                    CallUpdate::status(CallStatus::Ended),
                )
                .await;
            return Err(e);
        }

        {
            let session = slot.current.as_mut().unwrap();
            session.state = CallState::Active;
            session.connected_at = Some(Instant::now());
        }
        inner
            .write_update(&call_id, CallUpdate::activated(Utc::now()))
            .await;
        inner.emit(CallEvent::CallActive {
            call_id: call_id.clone(),
        });

        // offer мог обогнать наш accept: канал не упорядочен между типами
        if let Some(payload) = pending {
            if let Err(e) = inner.apply_offer_and_answer(&media, &remote, payload).await {
                warn(&format!("Failed to answer buffered offer: {}", e));
                let session = slot.current.take().unwrap();
                inner
                    .finish_call(
                        session,
                        EndReason::Failed,
                        Some(Signal::EndCall {
                            call_id: call_id.clone(),
                        }),
                        CallUpdate::status(CallStatus::Ended),
                    )
                    .await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Отклонить входящий звонок
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let is_incoming = slot
            .current
            .as_ref()
            .map_or(false, |s| s.state == CallState::IncomingRinging);
        if !is_incoming {
            return Err(CallError::InvalidSessionState("no incoming call to reject"));
        }
        let session = slot.current.take().unwrap();
        let call_id = session.call_id.clone();
        inner
            .finish_call(
                session,
                EndReason::Rejected,
                Some(Signal::RejectCall { call_id }),
                CallUpdate::status(CallStatus::Ended),
            )
            .await;
        Ok(())
    }

    /// Положить трубку. Из active пишем длительность; из ringing это отмена.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let session = slot
            .current
            .take()
            .ok_or(CallError::InvalidSessionState("no call to end"))?;
        let update = match (session.state, session.connected_at) {
            (CallState::Active, Some(at)) => {
                CallUpdate::finished(Utc::now(), at.elapsed().as_secs() as i64)
            }
            _ => CallUpdate::status(CallStatus::Ended),
        };
        let call_id = session.call_id.clone();
        inner
            .finish_call(
                session,
                EndReason::HungUp,
                Some(Signal::EndCall { call_id }),
                update,
            )
            .await;
        Ok(())
    }

    /// Mute/unmute микрофона в текущем звонке
    pub async fn toggle_audio(&self, enabled: bool) -> Result<(), CallError> {
        let slot = self.inner.slot.lock().await;
        match slot.current.as_ref().and_then(|s| s.media.as_ref()) {
            Some(media) => {
                media.toggle_audio(enabled);
                Ok(())
            }
            None => Err(CallError::InvalidSessionState("no active media session")),
        }
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<(), CallError> {
        let slot = self.inner.slot.lock().await;
        match slot.current.as_ref().and_then(|s| s.media.as_ref()) {
            Some(media) => {
                media.toggle_video(enabled);
                Ok(())
            }
            None => Err(CallError::InvalidSessionState("no active media session")),
        }
    }

    /// Точка входа для входящих событий сигнального канала.
    /// Вызывается владельцем соединения; подписок внутри движка нет.
    pub async fn handle_signal(&self, from: &str, signal: Signal) -> Result<(), CallError> {
        log(&format!("Inbound {} from {}", signal.name(), from));
        match signal {
            Signal::InitiateCall {
                call_id,
                kind,
                from: _,
            } => self.on_initiate(from, call_id, kind).await,
            Signal::AcceptCall { call_id } => self.on_accept(from, call_id).await,
            Signal::RejectCall { call_id } => self.on_reject(from, call_id).await,
            Signal::EndCall { call_id } => self.on_end(from, call_id).await,
            Signal::WebrtcOffer { to, offer } => self.on_offer(from, &to, &offer).await,
            Signal::WebrtcAnswer { to, answer } => self.on_answer(from, &to, &answer).await,
            Signal::WebrtcIceCandidate { to, candidate } => {
                self.on_candidate(from, &to, candidate).await
            }
        }
    }

    async fn on_initiate(
        &self,
        from: &str,
        call_id: String,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        if slot.current.is_some() {
            // уже в звонке: отвечаем отказом, текущий звонок не трогаем
            log(&format!("Busy, rejecting incoming call {}", call_id));
            drop(slot);
            if let Err(e) = inner
                .signaling
                .send(from, Signal::RejectCall { call_id })
                .await
            {
                warn(&format!("Busy reject failed to send: {}", e));
            }
            return Ok(());
        }

        slot.generation += 1;
        let generation = slot.generation;
        slot.current = Some(CallSession {
            call_id: call_id.clone(),
            kind,
            role: CallRole::Receiver,
            remote_user_id: from.to_owned(),
            state: CallState::IncomingRinging,
            media: None,
            pending_offer: None,
            connected_at: None,
            generation,
            ring_timer: None,
            was_connected: false,
        });
        inner.arm_ring_timer(slot.current.as_mut().unwrap());
        inner.emit(CallEvent::IncomingCall {
            call_id,
            from: from.to_owned(),
            kind,
        });
        Ok(())
    }

    /// Пир принял наш звонок: поднимаем медиа-сессию и шлём offer
    async fn on_accept(&self, from: &str, call_id: String) -> Result<(), CallError> {
        let inner = &self.inner;
        let (kind, remote, generation) = {
            let slot = inner.slot.lock().await;
            match &slot.current {
                Some(s)
                    if s.call_id == call_id
                        && s.remote_user_id == from
                        && s.state == CallState::OutgoingRinging =>
                {
                    (s.kind, s.remote_user_id.clone(), s.generation)
                }
                _ => {
                    // принятие после таймаута: отвечаем end_call, чтобы
                    // собеседник не завис в active
                    drop(slot);
                    log(&format!("Stale accept_call for {}, replying end_call", call_id));
                    let _ = inner
                        .signaling
                        .send(from, Signal::EndCall { call_id })
                        .await;
                    return Ok(());
                }
            }
        };

        let media = match inner.new_media_session(&call_id, kind).await {
            Ok(media) => media,
            Err(e) => {
                inner.abort_setup(&call_id, generation, &e).await;
                return Err(e);
            }
        };

        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                media.teardown().await;
                inner.abort_setup(&call_id, generation, &e).await;
                return Err(e);
            }
        };
        let encoded = match encode_sdp(&offer) {
            Ok(encoded) => encoded,
            Err(e) => {
                media.teardown().await;
                inner.abort_setup(&call_id, generation, &e).await;
                return Err(e);
            }
        };

        let mut slot = inner.slot.lock().await;
        let still_ringing = slot.current.as_ref().map_or(false, |s| {
            s.call_id == call_id
                && s.generation == generation
                && s.state == CallState::OutgoingRinging
        });
        if !still_ringing {
            drop(slot);
            // пока готовили offer, звонок закончился
            media.teardown().await;
            return Ok(());
        }

        {
            let session = slot.current.as_mut().unwrap();
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            session.media = Some(media.clone());
            session.state = CallState::Active;
            session.connected_at = Some(Instant::now());
        }

        if let Err(e) = inner
            .signaling
            .send(
                &remote,
                Signal::WebrtcOffer {
                    to: remote.clone(),
                    offer: encoded,
                },
            )
            .await
        {
            warn(&format!("webrtc_offer failed to send: {}", e));
            let session = slot.current.take().unwrap();
            inner
                .finish_call(
                    session,
                    EndReason::Failed,
                    Some(Signal::EndCall {
                        call_id: call_id.clone(),
                    }),
                    CallUpdate::status(CallStatus::Ended),
                )
                .await;
            return Err(e);
        }

        inner
            .write_update(&call_id, CallUpdate::activated(Utc::now()))
            .await;
        inner.emit(CallEvent::CallActive { call_id });
        Ok(())
    }

    async fn on_reject(&self, from: &str, call_id: String) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let matches = slot.current.as_ref().map_or(false, |s| {
            s.call_id == call_id && s.remote_user_id == from && s.state.is_ringing()
        });
        if !matches {
            log(&format!("Stale reject_call for {}, ignoring", call_id));
            return Ok(());
        }
        let session = slot.current.take().unwrap();
        inner
            .finish_call(
                session,
                EndReason::Rejected,
                None,
                CallUpdate::status(CallStatus::Ended),
            )
            .await;
        Ok(())
    }

    async fn on_end(&self, from: &str, call_id: String) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let matches = slot
            .current
            .as_ref()
            .map_or(false, |s| s.call_id == call_id && s.remote_user_id == from);
        if !matches {
            log(&format!("Stale end_call for {}, ignoring", call_id));
            return Ok(());
        }
        let session = slot.current.take().unwrap();
        let update = match (session.state, session.connected_at) {
            (CallState::Active, Some(at)) => {
                CallUpdate::finished(Utc::now(), at.elapsed().as_secs() as i64)
            }
            _ => CallUpdate::status(CallStatus::Ended),
        };
        inner
            .finish_call(session, EndReason::HungUp, None, update)
            .await;
        Ok(())
    }

    async fn on_offer(&self, from: &str, to: &str, offer: &str) -> Result<(), CallError> {
        let inner = &self.inner;
        if to != inner.user_id {
            warn(&format!("webrtc_offer addressed to {}, dropping", to));
            return Ok(());
        }
        let payload = match decode_sdp(offer) {
            Ok(payload) => payload,
            Err(e) => {
                warn(&format!("Undecodable offer: {}", e));
                return Ok(());
            }
        };

        let mut slot = inner.slot.lock().await;
        let (media, remote, call_id) = {
            let session = match slot.current.as_mut() {
                Some(session) => session,
                None => {
                    log("webrtc_offer without a call, ignoring");
                    return Ok(());
                }
            };
            if session.call_id != payload.id
                || session.remote_user_id != from
                || session.role != CallRole::Receiver
            {
                log("Stale webrtc_offer, ignoring");
                return Ok(());
            }
            match (session.media.clone(), session.state) {
                (Some(media), CallState::Active) => (
                    media,
                    session.remote_user_id.clone(),
                    session.call_id.clone(),
                ),
                _ => {
                    // offer обогнал accept: применим при принятии звонка
                    log("Offer arrived before media session, buffering");
                    session.pending_offer = Some(payload);
                    return Ok(());
                }
            }
        };

        match inner.apply_offer_and_answer(&media, &remote, payload).await {
            Ok(()) => Ok(()),
            Err(CallError::InvalidSessionState(reason)) => {
                // канал доставляет как минимум один раз: повтор игнорируем
                log(&format!("Duplicate offer ignored: {}", reason));
                Ok(())
            }
            Err(e) => {
                warn(&format!("Failed to apply offer: {}", e));
                let session = slot.current.take().unwrap();
                inner
                    .finish_call(
                        session,
                        EndReason::Failed,
                        Some(Signal::EndCall { call_id }),
                        CallUpdate::status(CallStatus::Ended),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn on_answer(&self, from: &str, to: &str, answer: &str) -> Result<(), CallError> {
        let inner = &self.inner;
        if to != inner.user_id {
            warn(&format!("webrtc_answer addressed to {}, dropping", to));
            return Ok(());
        }
        let payload = match decode_sdp(answer) {
            Ok(payload) => payload,
            Err(e) => {
                warn(&format!("Undecodable answer: {}", e));
                return Ok(());
            }
        };

        let mut slot = inner.slot.lock().await;
        let media = {
            match &slot.current {
                Some(s)
                    if s.call_id == payload.id
                        && s.remote_user_id == from
                        && s.role == CallRole::Initiator
                        && s.state == CallState::Active =>
                {
                    s.media.clone()
                }
                _ => {
                    log("Stale webrtc_answer, ignoring");
                    return Ok(());
                }
            }
        };
        let Some(media) = media else {
            log("webrtc_answer before media session, ignoring");
            return Ok(());
        };

        match media.set_remote_description(payload.sdp).await {
            Ok(()) => Ok(()),
            Err(CallError::InvalidSessionState(reason)) => {
                log(&format!("Duplicate answer ignored: {}", reason));
                Ok(())
            }
            Err(e) => {
                warn(&format!("Failed to apply answer: {}", e));
                let session = slot.current.take().unwrap();
                let call_id = session.call_id.clone();
                inner
                    .finish_call(
                        session,
                        EndReason::Failed,
                        Some(Signal::EndCall { call_id }),
                        CallUpdate::status(CallStatus::Ended),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn on_candidate(
        &self,
        from: &str,
        to: &str,
        candidate: crate::peer::types::IceCandidate,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        if to != inner.user_id {
            return Ok(());
        }
        let mut slot = inner.slot.lock().await;
        let media = match &slot.current {
            Some(s)
                if s.remote_user_id == from
                    && s.call_id == candidate.call_id
                    && !s.state.is_terminal() =>
            {
                s.media.clone()
            }
            _ => None,
        };
        let Some(media) = media else {
            // запоздавший сигналинг после teardown отбрасываем молча
            return Ok(());
        };

        match media.add_remote_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(CallError::SignalingOverflow(cap)) => {
                // защита от пира, заливающего нас кандидатами: рвём звонок
                warn(&format!("ICE queue overflow (cap {}), ending call", cap));
                let session = slot.current.take().unwrap();
                let call_id = session.call_id.clone();
                inner
                    .finish_call(
                        session,
                        EndReason::Failed,
                        Some(Signal::EndCall { call_id }),
                        CallUpdate::status(CallStatus::Ended),
                    )
                    .await;
                Err(CallError::SignalingOverflow(cap))
            }
            Err(e) => Err(e),
        }
    }
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        log(&format!("Event: {}", event.name()));
        // нет подписчиков — не проблема
        let _ = self.events.send(event);
    }

    /// Вставка с одной повторной попыткой; неудача не блокирует звонок
    async fn write_insert(&self, call_id: &str, record: &CallRecord) {
        if let Err(first) = self.store.insert_call(record).await {
            warn(&format!("Call record insert failed, retrying: {}", first));
            if let Err(second) = self.store.insert_call(record).await {
                warn(&format!("Call record insert failed after retry: {}", second));
                self.emit(CallEvent::BackendWarning {
                    call_id: call_id.to_owned(),
                    message: CallError::BackendWriteFailed(second.0).to_string(),
                });
            }
        }
    }

    /// Обновление с одной повторной попыткой; неудача не блокирует звонок
    async fn write_update(&self, call_id: &str, update: CallUpdate) {
        if let Err(first) = self.store.update_call(call_id, update.clone()).await {
            warn(&format!("Call record update failed, retrying: {}", first));
            if let Err(second) = self.store.update_call(call_id, update).await {
                warn(&format!("Call record update failed after retry: {}", second));
                self.emit(CallEvent::BackendWarning {
                    call_id: call_id.to_owned(),
                    message: CallError::BackendWriteFailed(second.0).to_string(),
                });
            }
        }
    }

    fn arm_ring_timer(self: &Arc<Self>, session: &mut CallSession) {
        let inner = self.clone();
        let call_id = session.call_id.clone();
        let generation = session.generation;
        session.ring_timer = Some(tokio::spawn(async move {
            sleep(inner.cfg.ring_timeout).await;
            inner.ring_timed_out(&call_id, generation).await;
        }));
    }

    /// Никто не ответил: терминальный `missed`, ровно один раз
    async fn ring_timed_out(&self, call_id: &str, generation: u64) {
        let mut slot = self.slot.lock().await;
        let matches = slot.current.as_ref().map_or(false, |s| {
            s.call_id == call_id && s.generation == generation && s.state.is_ringing()
        });
        if !matches {
            return;
        }
        log(&format!("Ring timeout for call {}", call_id));
        let session = slot.current.take().unwrap();
        // сигнального ответа нет: у собеседника свой таймаут
        self.finish_call(
            session,
            EndReason::Missed,
            None,
            CallUpdate::status(CallStatus::Missed),
        )
        .await;
    }

    /// Медиа-сессия с насосом её событий в контроллер
    async fn new_media_session(
        self: &Arc<Self>,
        call_id: &str,
        kind: CallKind,
    ) -> Result<Arc<MediaSession>, CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let media = Arc::new(
            MediaSession::new(
                self.devices.as_ref(),
                kind.wants_video(),
                &self.cfg,
                call_id.to_owned(),
                tx,
            )
            .await?,
        );

        // насос умирает вместе с последним отправителем
        let inner = self.clone();
        let call_id = call_id.to_owned();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_session_event(&call_id, event).await;
            }
        });
        Ok(media)
    }

    async fn handle_session_event(&self, call_id: &str, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                // пересылаем только пока звонок жив
                let remote = {
                    let slot = self.slot.lock().await;
                    match &slot.current {
                        Some(s) if s.call_id == call_id && !s.state.is_terminal() => {
                            Some(s.remote_user_id.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(remote) = remote {
                    if let Err(e) = self
                        .signaling
                        .send(
                            &remote,
                            Signal::WebrtcIceCandidate {
                                to: remote.clone(),
                                candidate,
                            },
                        )
                        .await
                    {
                        warn(&format!("Failed to relay local candidate: {}", e));
                    }
                }
            }
            SessionEvent::RemoteTrack(track) => {
                let live = {
                    let slot = self.slot.lock().await;
                    slot.current
                        .as_ref()
                        .map_or(false, |s| s.call_id == call_id && !s.state.is_terminal())
                };
                if live {
                    self.emit(CallEvent::RemoteTrack {
                        call_id: call_id.to_owned(),
                        track,
                    });
                }
            }
            SessionEvent::StateChanged(state) => self.media_state_changed(call_id, state).await,
        }
    }

    async fn media_state_changed(&self, call_id: &str, state: ConnectionState) {
        let mut slot = self.slot.lock().await;
        let matches = slot
            .current
            .as_ref()
            .map_or(false, |s| s.call_id == call_id);
        if !matches {
            return;
        }
        match state {
            ConnectionState::Connected => {
                let session = slot.current.as_mut().unwrap();
                if session.was_connected {
                    self.emit(CallEvent::ConnectionRecovered {
                        call_id: call_id.to_owned(),
                    });
                }
                session.was_connected = true;
            }
            ConnectionState::Disconnected => {
                self.emit(CallEvent::ConnectionProblem {
                    call_id: call_id.to_owned(),
                });
            }
            ConnectionState::Failed => {
                // grace-период истёк, TURN-фолбэка нет: звонок закончился
                warn(&format!(
                    "Call {}: {}",
                    call_id,
                    CallError::ConnectivityFailed
                ));
                let session = slot.current.take().unwrap();
                let update = match (session.state, session.connected_at) {
                    (CallState::Active, Some(at)) => {
                        CallUpdate::finished(Utc::now(), at.elapsed().as_secs() as i64)
                    }
                    _ => CallUpdate::status(CallStatus::Ended),
                };
                let notify = Signal::EndCall {
                    call_id: call_id.to_owned(),
                };
                self.finish_call(session, EndReason::Failed, Some(notify), update)
                    .await;
            }
            _ => {}
        }
    }

    /// Медиа не поднялась: откатываем переход и уведомляем пира,
    /// чтобы он не звонил в пустоту
    async fn abort_setup(&self, call_id: &str, generation: u64, err: &CallError) {
        warn(&format!("Media setup failed for call {}: {}", call_id, err));
        let mut slot = self.slot.lock().await;
        let matches = slot
            .current
            .as_ref()
            .map_or(false, |s| s.call_id == call_id && s.generation == generation);
        if !matches {
            return;
        }
        let session = slot.current.take().unwrap();
        let notify = if session.role == CallRole::Receiver && session.state.is_ringing() {
            Signal::RejectCall {
                call_id: call_id.to_owned(),
            }
        } else {
            Signal::EndCall {
                call_id: call_id.to_owned(),
            }
        };
        self.finish_call(
            session,
            EndReason::Failed,
            Some(notify),
            CallUpdate::status(CallStatus::Ended),
        )
        .await;
    }

    async fn apply_offer_and_answer(
        &self,
        media: &Arc<MediaSession>,
        remote: &str,
        payload: crate::peer::types::SdpPayload,
    ) -> Result<(), CallError> {
        media.set_remote_description(payload.sdp).await?;
        let answer = media.create_answer().await?;
        let encoded = encode_sdp(&answer)?;
        self.signaling
            .send(
                remote,
                Signal::WebrtcAnswer {
                    to: remote.to_owned(),
                    answer: encoded,
                },
            )
            .await
    }

    /// Терминальный переход. Порядок жёсткий: освобождаем медиа,
    /// уведомляем пира, и только потом пишем в бэкенд
    async fn finish_call(
        &self,
        mut session: CallSession,
        reason: EndReason,
        notify: Option<Signal>,
        update: CallUpdate,
    ) {
        log(&format!("Call {} finished: {:?}", session.call_id, reason));
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        if let Some(media) = session.media.take() {
            media.teardown().await;
        }
        if let Some(signal) = notify {
            if let Err(e) = self
                .signaling
                .send(&session.remote_user_id, signal)
                .await
            {
                warn(&format!("Failed to notify peer about call end: {}", e));
            }
        }
        self.write_update(&session.call_id, update).await;
        self.emit(CallEvent::CallEnded {
            call_id: session.call_id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::peer::media::NullDevices;
    use crate::peer::types::IceCandidate;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockSignaling {
        sent: StdMutex<Vec<(String, Signal)>>,
    }

    #[async_trait]
    impl SignalingChannel for MockSignaling {
        async fn send(&self, to: &str, signal: Signal) -> Result<(), CallError> {
            self.sent.lock().unwrap().push((to.to_owned(), signal));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        records: StdMutex<HashMap<String, CallRecord>>,
        updates: StdMutex<Vec<(String, CallUpdate)>>,
        fail_inserts: AtomicUsize,
    }

    #[async_trait]
    impl CallStore for MockStore {
        async fn insert_call(&self, record: &CallRecord) -> Result<(), BackendError> {
            if self.fail_inserts.load(Ordering::SeqCst) > 0 {
                self.fail_inserts.fetch_sub(1, Ordering::SeqCst);
                return Err(BackendError("insert refused".into()));
            }
            self.records
                .lock()
                .unwrap()
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<(), BackendError> {
            {
                let mut records = self.records.lock().unwrap();
                if let Some(record) = records.get_mut(call_id) {
                    if let Some(status) = update.status {
                        record.status = status;
                    }
                    if update.started_at.is_some() {
                        record.started_at = update.started_at;
                    }
                    if update.ended_at.is_some() {
                        record.ended_at = update.ended_at;
                    }
                    if update.duration.is_some() {
                        record.duration = update.duration;
                    }
                }
            }
            self.updates.lock().unwrap().push((call_id.to_owned(), update));
            Ok(())
        }
    }

    fn test_config() -> CallConfig {
        CallConfig {
            // host-кандидатов в тестах достаточно
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    fn controller_with(
        user: &str,
        cfg: CallConfig,
    ) -> (CallController, Arc<MockSignaling>, Arc<MockStore>) {
        let signaling = Arc::new(MockSignaling::default());
        let store = Arc::new(MockStore::default());
        let controller = CallController::new(
            user,
            signaling.clone(),
            store.clone(),
            Arc::new(NullDevices),
            cfg,
        );
        (controller, signaling, store)
    }

    fn candidate(call_id: &str, port: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 UDP 2122260223 192.0.2.1 {} typ host", port),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            call_id: call_id.to_owned(),
        }
    }

    #[tokio::test]
    async fn place_call_inserts_record_and_signals() {
        let (controller, signaling, store) = controller_with("alice", test_config());
        let mut events = controller.subscribe();

        let call_id = controller
            .place_call("bob", CallKind::Voice, Some("chat1"))
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::OutgoingRinging);

        let record = store.records.lock().unwrap().get(&call_id).cloned().unwrap();
        assert_eq!(record.status, CallStatus::Ringing);
        assert_eq!(record.initiator_id, "alice");
        assert_eq!(record.chat_id.as_deref(), Some("chat1"));

        let sent = signaling.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "bob");
        assert!(matches!(sent[0].1, Signal::InitiateCall { .. }));

        assert!(matches!(
            events.try_recv().unwrap(),
            CallEvent::OutgoingCall { .. }
        ));
    }

    #[tokio::test]
    async fn second_place_call_fails_without_side_effects() {
        let (controller, signaling, store) = controller_with("alice", test_config());
        controller
            .place_call("bob", CallKind::Voice, None)
            .await
            .unwrap();

        let result = controller.place_call("carol", CallKind::Video, None).await;
        assert!(matches!(result, Err(CallError::AlreadyInCall)));
        assert_eq!(store.records.lock().unwrap().len(), 1);
        assert_eq!(signaling.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incoming_ring_times_out_to_missed_exactly_once() {
        let cfg = CallConfig {
            ring_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (controller, signaling, store) = controller_with("bob", cfg);
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Voice,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::IncomingRinging);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.state().await, CallState::Idle);

        let updates = store.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, Some(CallStatus::Missed));
        // пропущенный звонок не шлёт сигналов
        assert!(signaling.sent.lock().unwrap().is_empty());

        // локальное принятие после таймаута отвергается
        assert!(matches!(
            controller.accept_call().await,
            Err(CallError::InvalidSessionState(_))
        ));
    }

    #[tokio::test]
    async fn stale_accept_after_timeout_never_goes_active() {
        let cfg = CallConfig {
            ring_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (controller, signaling, store) = controller_with("alice", cfg);
        let call_id = controller
            .place_call("bob", CallKind::Voice, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.state().await, CallState::Idle);
        let record = store.records.lock().unwrap().get(&call_id).cloned().unwrap();
        assert_eq!(record.status, CallStatus::Missed);

        controller
            .handle_signal(
                "bob",
                Signal::AcceptCall {
                    call_id: call_id.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::Idle);
        // запоздавшему принятию отвечаем end_call, чтобы пир не завис
        let sent = signaling.sent.lock().unwrap().clone();
        assert!(matches!(sent.last().unwrap().1, Signal::EndCall { .. }));
    }

    #[tokio::test]
    async fn accept_call_goes_active_and_signals() {
        let (controller, signaling, store) = controller_with("bob", test_config());
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Voice,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();

        controller.accept_call().await.unwrap();
        assert_eq!(controller.state().await, CallState::Active);

        let sent = signaling.sent.lock().unwrap().clone();
        assert!(sent
            .iter()
            .any(|(to, s)| to == "alice" && matches!(s, Signal::AcceptCall { .. })));

        let updates = store.updates.lock().unwrap().clone();
        let activated = updates.iter().find(|(id, _)| id == "c1").unwrap();
        assert_eq!(activated.1.status, Some(CallStatus::Active));
        assert!(activated.1.started_at.is_some());
    }

    #[tokio::test]
    async fn accept_without_incoming_call_fails() {
        let (controller, _, _) = controller_with("bob", test_config());
        assert!(matches!(
            controller.accept_call().await,
            Err(CallError::InvalidSessionState(_))
        ));
    }

    #[tokio::test]
    async fn reject_call_notifies_peer_and_clears() {
        let (controller, signaling, store) = controller_with("bob", test_config());
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Video,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();

        controller.reject_call().await.unwrap();
        assert_eq!(controller.state().await, CallState::Idle);

        let sent = signaling.sent.lock().unwrap().clone();
        assert!(matches!(sent.last().unwrap().1, Signal::RejectCall { .. }));
        let updates = store.updates.lock().unwrap().clone();
        assert_eq!(updates.last().unwrap().1.status, Some(CallStatus::Ended));
    }

    #[tokio::test]
    async fn busy_receiver_rejects_second_incoming_call() {
        let (controller, signaling, _) = controller_with("bob", test_config());
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Voice,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();
        controller
            .handle_signal(
                "carol",
                Signal::InitiateCall {
                    call_id: "c2".into(),
                    kind: CallKind::Voice,
                    from: "carol".into(),
                },
            )
            .await
            .unwrap();

        // первый звонок не пострадал
        let snapshot = controller.snapshot().await.unwrap();
        assert_eq!(snapshot.call_id, "c1");
        assert_eq!(snapshot.state, CallState::IncomingRinging);

        let sent = signaling.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|(to, s)| {
            to == "carol" && matches!(s, Signal::RejectCall { call_id } if call_id == "c2")
        }));
    }

    #[tokio::test]
    async fn stale_ice_candidate_is_discarded_silently() {
        let (controller, signaling, _) = controller_with("bob", test_config());
        let result = controller
            .handle_signal(
                "alice",
                Signal::WebrtcIceCandidate {
                    to: "bob".into(),
                    candidate: candidate("ghost", 1000),
                },
            )
            .await;
        assert!(result.is_ok());
        assert!(signaling.sent.lock().unwrap().is_empty());
        assert_eq!(controller.state().await, CallState::Idle);
    }

    #[tokio::test]
    async fn backend_failures_do_not_block_call_placement() {
        let (controller, signaling, store) = controller_with("alice", test_config());
        store.fail_inserts.store(2, Ordering::SeqCst);
        let mut events = controller.subscribe();

        controller
            .place_call("bob", CallKind::Voice, None)
            .await
            .unwrap();
        assert_eq!(controller.state().await, CallState::OutgoingRinging);
        assert_eq!(signaling.sent.lock().unwrap().len(), 1);
        assert!(store.records.lock().unwrap().is_empty());

        let mut saw_warning = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::BackendWarning { .. }) {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn single_insert_failure_recovers_via_retry() {
        let (controller, _, store) = controller_with("alice", test_config());
        store.fail_inserts.store(1, Ordering::SeqCst);
        let mut events = controller.subscribe();

        let call_id = controller
            .place_call("bob", CallKind::Voice, None)
            .await
            .unwrap();
        assert!(store.records.lock().unwrap().contains_key(&call_id));

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, CallEvent::BackendWarning { .. }));
        }
    }

    #[tokio::test]
    async fn end_call_during_outgoing_ring_cancels() {
        let (controller, signaling, store) = controller_with("alice", test_config());
        let call_id = controller
            .place_call("bob", CallKind::Voice, None)
            .await
            .unwrap();

        controller.end_call().await.unwrap();
        assert_eq!(controller.state().await, CallState::Idle);

        let sent = signaling.sent.lock().unwrap().clone();
        assert!(matches!(sent.last().unwrap().1, Signal::EndCall { .. }));
        let record = store.records.lock().unwrap().get(&call_id).cloned().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert_eq!(record.duration, None);
    }

    /// Устройства, к которым нет доступа
    struct DeniedDevices;

    #[async_trait]
    impl crate::peer::media::MediaDevices for DeniedDevices {
        async fn open_audio(&self) -> Result<crate::peer::media::LocalTrack, CallError> {
            Err(CallError::PermissionDenied)
        }

        async fn open_video(&self) -> Result<crate::peer::media::LocalTrack, CallError> {
            Err(CallError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn media_failure_during_accept_rejects_peer_and_clears() {
        let signaling = Arc::new(MockSignaling::default());
        let store = Arc::new(MockStore::default());
        let controller = CallController::new(
            "bob",
            signaling.clone(),
            store.clone(),
            Arc::new(DeniedDevices),
            test_config(),
        );
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Voice,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();

        let result = controller.accept_call().await;
        assert!(matches!(result, Err(CallError::PermissionDenied)));
        // переход отменён, пир предупреждён, слот свободен
        assert_eq!(controller.state().await, CallState::Idle);
        let sent = signaling.sent.lock().unwrap().clone();
        assert!(sent
            .iter()
            .any(|(to, s)| to == "alice" && matches!(s, Signal::RejectCall { .. })));
        let updates = store.updates.lock().unwrap().clone();
        assert_eq!(updates.last().unwrap().1.status, Some(CallStatus::Ended));
    }

    #[tokio::test]
    async fn ice_overflow_tears_the_call_down() {
        let cfg = CallConfig {
            ice_queue_cap: 3,
            ..test_config()
        };
        let (controller, signaling, store) = controller_with("bob", cfg);
        controller
            .handle_signal(
                "alice",
                Signal::InitiateCall {
                    call_id: "c1".into(),
                    kind: CallKind::Voice,
                    from: "alice".into(),
                },
            )
            .await
            .unwrap();
        controller.accept_call().await.unwrap();

        for port in [1, 2, 3] {
            controller
                .handle_signal(
                    "alice",
                    Signal::WebrtcIceCandidate {
                        to: "bob".into(),
                        candidate: candidate("c1", port),
                    },
                )
                .await
                .unwrap();
        }
        let result = controller
            .handle_signal(
                "alice",
                Signal::WebrtcIceCandidate {
                    to: "bob".into(),
                    candidate: candidate("c1", 4),
                },
            )
            .await;
        assert!(matches!(result, Err(CallError::SignalingOverflow(3))));
        assert_eq!(controller.state().await, CallState::Idle);

        let sent = signaling.sent.lock().unwrap().clone();
        assert!(matches!(sent.last().unwrap().1, Signal::EndCall { .. }));
        let updates = store.updates.lock().unwrap().clone();
        assert_eq!(updates.last().unwrap().1.status, Some(CallStatus::Ended));
    }
}
