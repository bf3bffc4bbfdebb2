//! Машина состояний одной попытки звонка с одним собеседником.
//!
//! Сессия владеет транспортом, локальными и удалёнными дорожками и
//! таймером ожидания ответа. После каждого `.await` продолжение проверяет,
//! что сессию не закрыли: закрыть её могут в любой момент.

use crate::config::BroadcastConfig;
use crate::error::{Result, SessionError};
use crate::events::{CallEvent, EventBus};
use crate::logger::dump_candidate;
use crate::media::{MediaDevices, MediaRequest, MediaSession, MediaTrack, TrackKind, TrackSet};
use crate::peer::connection::{Transport, TransportEvent, TransportFactory, TransportState};
use crate::peer::state::{Role, SessionState, Teardown};
use crate::peer::types::{IceCandidate, PeerId, RelayPayload, SessionDescription};
use crate::signaling::SignalingChannel;
use crate::utils::random_id;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Убирает сессию из registry, если там всё ещё это поколение
pub type RetireFn = Box<dyn Fn(PeerId, u64) -> bool + Send + Sync>;

/// Общие зависимости всех сессий одного registry
pub struct SessionContext {
    pub config: BroadcastConfig,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<SignalingChannel>,
    pub events: EventBus,
    pub retire: RetireFn,
}

/// Исходящие сообщения сессии в порядке генерации
struct Outbox {
    tx: Option<mpsc::UnboundedSender<RelayPayload>>,
    description_sent: bool,
    /// кандидаты, собранные до отправки offer/answer
    held: Vec<IceCandidate>,
}

pub struct PeerSession {
    peer: PeerId,
    generation: u64,
    ctx: Arc<SessionContext>,
    this: Weak<PeerSession>,
    closed: AtomicBool,
    state: Mutex<SessionState>,
    request: Mutex<Option<MediaRequest>>,
    negotiation_id: Mutex<Option<String>>,
    media: MediaSession,
    remote_tracks: Mutex<TrackSet>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    offer_timer: Mutex<Option<JoinHandle<()>>>,
    outbox: Mutex<Outbox>,
}

impl PeerSession {
    pub fn new(peer: PeerId, generation: u64, ctx: Arc<SessionContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|this| PeerSession {
            peer,
            generation,
            media: MediaSession::new(ctx.devices.clone()),
            ctx,
            this: this.clone(),
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            request: Mutex::new(None),
            negotiation_id: Mutex::new(None),
            remote_tracks: Mutex::new(TrackSet::default()),
            transport: Mutex::new(None),
            offer_timer: Mutex::new(None),
            outbox: Mutex::new(Outbox {
                tx: Some(tx),
                description_sent: false,
                held: Vec::new(),
            }),
        });
        session.spawn_outbox(rx);
        debug!("Created session for peer {} (generation {})", peer, generation);
        session
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn request(&self) -> Option<MediaRequest> {
        *self.request.lock()
    }

    pub fn negotiation_id(&self) -> Option<String> {
        self.negotiation_id.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn has_transport(&self) -> bool {
        self.transport.lock().is_some()
    }

    pub fn local_tracks(&self) -> TrackSet {
        self.media.tracks()
    }

    pub fn remote_tracks(&self) -> TrackSet {
        self.remote_tracks.lock().clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    fn begin(&self, role: Role) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Idle {
            return Err(SessionError::StaleMessage(format!(
                "session with peer {} is already {}",
                self.peer, *state
            )));
        }
        *state = SessionState::Negotiating(role);
        Ok(())
    }

    fn check_negotiation_id(&self, id: Option<&str>) -> Result<()> {
        match (id, self.negotiation_id.lock().as_deref()) {
            (Some(theirs), Some(ours)) if theirs != ours => Err(SessionError::StaleMessage(
                format!("negotiation {} is not current ({})", theirs, ours),
            )),
            _ => Ok(()),
        }
    }

    // ========== CALLER ==========

    /// IDLE → NEGOTIATING(caller): захват медиа, offer, таймер ответа
    pub async fn open_call(&self, request: MediaRequest) -> Result<()> {
        self.begin(Role::Caller)?;
        let id = random_id();
        *self.request.lock() = Some(request);
        *self.negotiation_id.lock() = Some(id.clone());
        info!("Calling peer {} with {:?} (negotiation {})", self.peer, request, id);

        match self.negotiate_as_caller(request, &id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn negotiate_as_caller(&self, request: MediaRequest, id: &str) -> Result<()> {
        let tracks = self.media.acquire(&request).await?;
        self.ensure_live()?;
        self.emit_local(&tracks);

        let transport = self.open_transport().await?;
        transport.add_tracks(&tracks).await?;
        self.ensure_live()?;

        let offer = transport.create_offer().await?;
        self.ensure_live()?;
        transport.set_local_description(offer.clone()).await?;
        self.ensure_live()?;

        self.arm_offer_timeout();
        self.queue_description(RelayPayload::call(offer, Some(request), id));
        Ok(())
    }

    /// NEGOTIATING(caller) → CONNECTED
    pub async fn receive_answer(&self, desc: SessionDescription, id: Option<&str>) -> Result<()> {
        let state = self.state();
        if state != SessionState::Negotiating(Role::Caller) {
            return Err(SessionError::StaleMessage(format!(
                "answer while {}",
                state
            )));
        }
        self.check_negotiation_id(id)?;
        self.cancel_offer_timeout();

        let transport = self.current_transport().ok_or(SessionError::Closed)?;
        if let Err(e) = transport.set_remote_description(desc).await {
            self.fail(&e).await;
            return Err(e);
        }
        self.ensure_live()?;
        self.set_state(SessionState::Connected);
        info!("Peer {} answered the call", self.peer);
        Ok(())
    }

    // ========== CALLEE ==========

    /// IDLE → NEGOTIATING(callee): применяем offer, захватываем медиа, answer
    pub async fn receive_offer(
        &self,
        desc: SessionDescription,
        remote: MediaRequest,
        id: Option<String>,
    ) -> Result<()> {
        self.begin(Role::Callee)?;
        let request = remote.merged_with(&self.ctx.config.local_media);
        let id = id.unwrap_or_else(random_id);
        *self.request.lock() = Some(request);
        *self.negotiation_id.lock() = Some(id.clone());
        info!(
            "Incoming call from peer {} asking {:?}, answering with {:?}",
            self.peer, remote, request
        );

        match self.negotiate_as_callee(desc, request, &id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn negotiate_as_callee(
        &self,
        desc: SessionDescription,
        request: MediaRequest,
        id: &str,
    ) -> Result<()> {
        let transport = self.open_transport().await?;
        transport.set_remote_description(desc).await?;
        self.ensure_live()?;

        // без своих устройств всё равно принимаем медиа собеседника
        let tracks = match self.media.acquire(&request).await {
            Ok(tracks) => tracks,
            Err(SessionError::MediaUnavailable(reason)) => {
                warn!("Answering peer {} without local media: {}", self.peer, reason);
                self.ctx.events.emit(CallEvent::MediaUnavailable {
                    peer: self.peer,
                    reason,
                });
                TrackSet::default()
            }
            Err(e) => return Err(e),
        };
        self.ensure_live()?;
        self.emit_local(&tracks);
        transport.add_tracks(&tracks).await?;
        self.ensure_live()?;

        let answer = transport.create_answer().await?;
        self.ensure_live()?;
        transport.set_local_description(answer.clone()).await?;
        self.ensure_live()?;

        self.queue_description(RelayPayload::call(answer, None, id));
        Ok(())
    }

    // ========== BOTH SIDES ==========

    /// Кандидат применяется только к живому транспорту; раньше времени не копим
    pub async fn receive_candidate(&self, candidate: &IceCandidate, id: Option<&str>) -> Result<()> {
        self.check_negotiation_id(id)?;
        self.cancel_offer_timeout();

        let Some(transport) = self.current_transport() else {
            return Err(SessionError::StaleMessage(
                "candidate arrived before the transport".into(),
            ));
        };
        dump_candidate("REMOTE", candidate);
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from peer {}: {}", self.peer, e);
        }
        Ok(())
    }

    pub async fn receive_disconnect(&self, id: Option<&str>) -> Result<()> {
        self.check_negotiation_id(id)?;
        self.teardown(Teardown::Remote).await;
        Ok(())
    }

    /// Закрытие сессии: всё или ничего, повторный вызов ничего не делает
    pub async fn teardown(&self, reason: Teardown) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closed);
        info!(
            "Closing session with peer {} (generation {}) from {}: {:?}",
            self.peer, self.generation, previous, reason
        );

        self.cancel_offer_timeout();
        self.outbox.lock().tx = None;
        self.media.release();
        self.remote_tracks.lock().take().stop_all();
        let removed = (self.ctx.retire)(self.peer, self.generation);

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport for peer {}: {}", self.peer, e);
            }
        }
        self.notify_closed(reason, removed).await;
    }

    /// Отбой, пришедший пока сессию меняли на новую.
    ///
    /// Живая сессия просто закрывается. Уже снятая с учёта сообщает
    /// собеседнику и UI то, что промолчала при тихом закрытии.
    pub async fn announce_hangup(&self) {
        if self.is_live() {
            self.teardown(Teardown::Local).await;
            return;
        }
        info!("Hangup for peer {} arrived during renegotiation", self.peer);
        self.notify_closed(Teardown::Local, true).await;
    }

    async fn notify_closed(&self, reason: Teardown, removed: bool) {
        if reason.notifies_relay() {
            let id = self.negotiation_id();
            if let Err(e) = self
                .ctx
                .signaling
                .send(self.peer, RelayPayload::disconnect(id.as_deref()))
                .await
            {
                warn!("Failed to notify relay about disconnect from {}: {}", self.peer, e);
            }
        }

        if reason.notifies_ui() {
            self.ctx
                .events
                .emit(CallEvent::CallDisconnected { peer: self.peer });
            if removed {
                self.ctx.events.emit(CallEvent::Disconnect { peer: self.peer });
            }
        }
    }

    /// Ошибка в цепочке согласования закрывает сессию целиком
    async fn fail(&self, e: &SessionError) {
        if e.is_teardown() || !self.is_live() {
            debug!("Negotiation with peer {} abandoned: {}", self.peer, e);
            return;
        }
        warn!("Negotiation with peer {} failed: {}", self.peer, e);
        if let SessionError::MediaUnavailable(reason) = e {
            self.ctx.events.emit(CallEvent::MediaUnavailable {
                peer: self.peer,
                reason: reason.clone(),
            });
        }
        let reason = match e {
            SessionError::RelayUnavailable(_) => Teardown::RelayFailed,
            SessionError::TransportFailure(_) => Teardown::TransportFailed,
            _ => Teardown::NegotiationFailed,
        };
        self.teardown(reason).await;
    }

    fn spawn_teardown(&self, reason: Teardown) {
        if let Some(session) = self.this.upgrade() {
            tokio::spawn(async move {
                session.teardown(reason).await;
            });
        }
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if state.is_live() && *state != next {
            debug!("Peer {}: {} -> {}", self.peer, *state, next);
            *state = next;
        }
    }

    fn emit_local(&self, tracks: &TrackSet) {
        for kind in [TrackKind::Video, TrackKind::Audio, TrackKind::Screen] {
            if tracks.has(kind) {
                self.ctx.events.emit(CallEvent::LocalStream {
                    peer: self.peer,
                    kind,
                    tracks: tracks.of_kind(kind),
                });
            }
        }
    }

    // ========== TRANSPORT ==========

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    /// Не больше одного транспорта на сессию
    async fn open_transport(&self) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.current_transport() {
            return Ok(transport);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.ctx.transports.open(tx).await?;

        let stored = {
            let mut slot = self.transport.lock();
            // проверка под той же блокировкой, что и take() в teardown
            if self.is_live() {
                *slot = Some(transport.clone());
                true
            } else {
                false
            }
        };
        if !stored {
            let _ = transport.close().await;
            return Err(SessionError::Closed);
        }
        self.spawn_event_pump(rx);
        Ok(transport)
    }

    fn spawn_event_pump(&self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = this.upgrade() else {
                    break;
                };
                if !session.is_live() {
                    break;
                }
                session.on_transport_event(event);
            }
        });
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => self.queue_candidate(candidate),
            TransportEvent::RemoteTrack(track) => self.on_remote_track(track),
            TransportEvent::StateChanged(TransportState::Connected) => {
                self.cancel_offer_timeout();
                if matches!(self.state(), SessionState::Negotiating(_)) {
                    self.set_state(SessionState::Connected);
                }
                info!("Transport to peer {} connected", self.peer);
            }
            TransportEvent::StateChanged(state) if state.is_fatal() => {
                warn!("Transport to peer {} is {:?}", self.peer, state);
                self.spawn_teardown(Teardown::TransportFailed);
            }
            TransportEvent::StateChanged(state) => {
                debug!("Transport to peer {} is {:?}", self.peer, state);
            }
        }
    }

    fn on_remote_track(&self, track: Arc<dyn MediaTrack>) {
        let kind = track.kind();
        let tracks = {
            let mut remote = self.remote_tracks.lock();
            if !self.is_live() {
                drop(remote);
                track.stop();
                return;
            }
            remote.push(track);
            remote.of_kind(kind)
        };
        self.ctx.events.emit(CallEvent::RemoteStream {
            peer: self.peer,
            kind,
            tracks,
        });
    }

    // ========== OFFER TIMEOUT ==========

    fn arm_offer_timeout(&self) {
        let this = self.this.clone();
        let timeout = self.ctx.config.offer_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = this.upgrade() {
                info!("Peer {}: {} ({:?})", session.peer, SessionError::OfferTimeout, timeout);
                // отдельной задачей: teardown отменяет этот таймер
                session.spawn_teardown(Teardown::OfferTimeout);
            }
        });
        if let Some(previous) = self.offer_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_offer_timeout(&self) {
        if let Some(handle) = self.offer_timer.lock().take() {
            debug!("Offer timeout for peer {} cancelled", self.peer);
            handle.abort();
        }
    }

    // ========== OUTBOX ==========

    fn queue_description(&self, payload: RelayPayload) {
        let mut outbox = self.outbox.lock();
        let Some(tx) = outbox.tx.clone() else {
            return;
        };
        let _ = tx.send(payload);
        outbox.description_sent = true;
        let id = self.negotiation_id();
        for candidate in outbox.held.drain(..) {
            let _ = tx.send(RelayPayload::candidate(candidate, id.as_deref().unwrap_or_default()));
        }
    }

    fn queue_candidate(&self, candidate: IceCandidate) {
        let mut outbox = self.outbox.lock();
        if !outbox.description_sent {
            outbox.held.push(candidate);
            return;
        }
        if let Some(tx) = &outbox.tx {
            let id = self.negotiation_id();
            let _ = tx.send(RelayPayload::candidate(candidate, id.as_deref().unwrap_or_default()));
        }
    }

    fn spawn_outbox(&self, mut rx: mpsc::UnboundedReceiver<RelayPayload>) {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(session) = this.upgrade() else {
                    break;
                };
                if !session.is_live() {
                    debug!(
                        "Dropping queued {} for closed session with peer {}",
                        payload.kind_str(),
                        session.peer
                    );
                    break;
                }
                if let Err(e) = session.ctx.signaling.send(session.peer, payload).await {
                    warn!("Relay refused message for peer {}: {}", session.peer, e);
                    session.spawn_teardown(Teardown::RelayFailed);
                    break;
                }
            }
        });
    }
}
