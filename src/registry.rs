//! Реестр сессий: не больше одной живой сессии на собеседника,
//! маршрутизация входящей сигнализации и команды UI.

use crate::config::BroadcastConfig;
use crate::error::{Result, SessionError};
use crate::events::{CallEvent, EventBus, EventKind, SubscriptionId};
use crate::media::{LocalDevices, MediaDevices, MediaRequest};
use crate::peer::connection::{RtcTransportFactory, TransportFactory};
use crate::peer::session::{PeerSession, RetireFn, SessionContext};
use crate::peer::state::{Role, SessionState, Teardown};
use crate::peer::types::{MessageKind, PeerId, SignalingMessage};
use crate::signaling::{Notification, NotificationFeed, Relay, SignalingChannel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Очередь переходов одного собеседника
#[derive(Default)]
struct PeerLane {
    turn: tokio::sync::Mutex<()>,
    /// растёт при каждом close_call
    hangups: AtomicU64,
}

type Lane = Arc<PeerLane>;

/// Пачка сообщений одного собеседника для его обработчика
struct Job {
    messages: Vec<SignalingMessage>,
    done: oneshot::Sender<()>,
}

/// Обработчик входящих сообщений одного собеседника
struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    /// сообщения старше этой позиции шины отменены disconnect'ом
    cutoff: Arc<AtomicU64>,
}

struct RegistryInner {
    ctx: Arc<SessionContext>,
    sessions: Mutex<HashMap<PeerId, Arc<PeerSession>>>,
    lanes: Mutex<HashMap<PeerId, Lane>>,
    workers: Mutex<HashMap<PeerId, Worker>>,
    next_generation: AtomicU64,
}

impl RegistryInner {
    /// Снимает сессию с учёта, если там всё ещё это поколение
    fn retire(&self, peer: PeerId, generation: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&peer) {
                Some(current) if current.generation() == generation => {
                    sessions.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        self.prune_lane(peer);
        removed
    }

    /// Очередь без сессии и без владельцев больше не нужна
    fn prune_lane(&self, peer: PeerId) {
        let sessions = self.sessions.lock();
        if sessions.contains_key(&peer) {
            return;
        }
        let mut lanes = self.lanes.lock();
        if lanes.get(&peer).is_some_and(|lane| Arc::strong_count(lane) == 1) {
            lanes.remove(&peer);
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        config: BroadcastConfig,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        relay: Arc<dyn Relay>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Session registry ready (topic {}, offer timeout {:?})",
            config.topic,
            config.offer_timeout()
        );
        let inner = Arc::new_cyclic(|registry: &std::sync::Weak<RegistryInner>| {
            let registry = registry.clone();
            let retire: RetireFn = Box::new(move |peer: PeerId, generation: u64| {
                registry
                    .upgrade()
                    .is_some_and(|inner| inner.retire(peer, generation))
            });
            RegistryInner {
                ctx: Arc::new(SessionContext {
                    signaling: Arc::new(SignalingChannel::new(relay, config.topic.clone())),
                    config,
                    devices,
                    transports,
                    events: EventBus::new(),
                    retire,
                }),
                sessions: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }
        });
        Ok(Self { inner })
    }

    /// Registry поверх webrtc-rs и устройств из конфигурации
    pub fn with_webrtc(config: BroadcastConfig, relay: Arc<dyn Relay>) -> Result<Self> {
        let devices = Arc::new(LocalDevices::new(config.devices));
        let transports = Arc::new(RtcTransportFactory::new(config.ice_servers.clone())?);
        Self::new(config, devices, transports, relay)
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.ctx.config
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.inner.ctx.signaling
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.ctx.events
    }

    pub fn subscribe<F>(&self, kind: EventKind, peer: Option<PeerId>, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.ctx.events.subscribe(kind, peer, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.ctx.events.unsubscribe(id)
    }

    pub fn session(&self, peer: PeerId) -> Option<Arc<PeerSession>> {
        self.inner.sessions.lock().get(&peer).cloned()
    }

    pub fn session_state(&self, peer: PeerId) -> Option<SessionState> {
        self.session(peer).map(|s| s.state())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.sessions.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Нет ни сессий, ни очередей, ни обработчиков сигнализации
    pub fn is_idle(&self) -> bool {
        let no_sessions = self.inner.sessions.lock().is_empty();
        let no_lanes = self.inner.lanes.lock().is_empty();
        no_sessions && no_lanes && self.inner.workers.lock().is_empty()
    }

    fn lane(&self, peer: PeerId) -> Lane {
        self.inner.lanes.lock().entry(peer).or_default().clone()
    }

    fn create_session(&self, peer: PeerId) -> Arc<PeerSession> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = PeerSession::new(peer, generation, self.inner.ctx.clone());
        let previous = self.inner.sessions.lock().insert(peer, session.clone());
        if let Some(previous) = previous.filter(|p| p.is_live()) {
            warn!(
                "Session generation {} for peer {} was still registered",
                previous.generation(),
                peer
            );
            tokio::spawn(async move {
                previous.teardown(Teardown::Superseded).await;
            });
        }
        session
    }

    // ========== UI COMMANDS ==========

    /// Звонок собеседнику; пустой запрос медиа равносилен [`close_call`].
    ///
    /// [`close_call`]: SessionRegistry::close_call
    pub async fn open_call(&self, peer: PeerId, request: MediaRequest) -> Result<()> {
        if !request.wants_media() {
            info!("open_call to peer {} without media, closing instead", peer);
            self.close_call(peer).await;
            return Ok(());
        }

        let lane = self.lane(peer);
        let hangups = lane.hangups.load(Ordering::SeqCst);
        let result = self.open_on_lane(peer, request, &lane, hangups).await;
        drop(lane);
        self.inner.prune_lane(peer);
        result
    }

    async fn open_on_lane(
        &self,
        peer: PeerId,
        request: MediaRequest,
        lane: &PeerLane,
        hangups: u64,
    ) -> Result<()> {
        let hung_up = || lane.hangups.load(Ordering::SeqCst) != hangups;
        let _turn = lane.turn.lock().await;
        if hung_up() {
            debug!("Call to peer {} was hung up before it started", peer);
            return Ok(());
        }

        if let Some(existing) = self.session(peer).filter(|s| s.is_live()) {
            if existing.request() == Some(request) {
                debug!("Call to peer {} with {:?} is already in progress", peer, request);
                return Ok(());
            }
            info!("Renegotiating with peer {}: {:?}", peer, request);
            // старый транспорт закрыт до того, как откроется новый
            existing.teardown(Teardown::Superseded).await;
            if hung_up() {
                existing.announce_hangup().await;
                return Ok(());
            }
        }

        let session = self.create_session(peer);
        if hung_up() {
            session.teardown(Teardown::Local).await;
            return Ok(());
        }
        match session.open_call(request).await {
            Err(e) if e.is_teardown() => {
                debug!("Call to peer {} was closed while opening", peer);
                Ok(())
            }
            other => other,
        }
    }

    /// Завершает звонок; повторный вызов и неизвестный собеседник - не ошибка.
    ///
    /// Очередь собеседника не занимается: закрытие прерывает идущий захват
    /// медиа, а звонок, ждущий очереди, уже не начнётся.
    pub async fn close_call(&self, peer: PeerId) {
        let lane = self.lane(peer);
        lane.hangups.fetch_add(1, Ordering::SeqCst);
        match self.session(peer) {
            Some(session) => session.teardown(Teardown::Local).await,
            None => debug!("close_call: no session with peer {}", peer),
        }
        drop(lane);
        self.inner.prune_lane(peer);
    }

    /// Закрывает все сессии
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<PeerSession>> =
            self.inner.sessions.lock().values().cloned().collect();
        info!("Shutting down {} sessions", sessions.len());
        for session in sessions {
            session.teardown(Teardown::Shutdown).await;
        }
    }

    // ========== INBOUND SIGNALING ==========

    /// Читает шину до её закрытия
    pub async fn run<F: NotificationFeed>(&self, mut feed: F) {
        while let Some(batch) = feed.next_batch().await {
            // шина не ждёт согласования ни с одним собеседником
            drop(self.route(batch));
        }
        info!("Notification feed closed");
    }

    /// Одна пачка уведомлений шины; возвращается, когда все сообщения применены
    pub async fn dispatch(&self, batch: Vec<Notification>) {
        for delivered in self.route(batch) {
            let _ = delivered.await;
        }
    }

    /// Раздаёт пачку обработчикам собеседников, не дожидаясь результата.
    ///
    /// Сообщения одного собеседника применяются по порядку в его очереди.
    /// Disconnect идёт в обход очереди: он прерывает идущее согласование
    /// и отменяет ещё не применённые сообщения старше себя. Каждый
    /// возвращённый receiver срабатывает, когда сообщения собеседника
    /// применены. Вызывать внутри tokio runtime.
    pub fn route(&self, batch: Vec<Notification>) -> Vec<oneshot::Receiver<()>> {
        self.inner
            .ctx
            .signaling
            .normalize(batch)
            .into_iter()
            .map(|(peer, messages)| {
                let (done, delivered) = oneshot::channel();
                if messages.iter().any(SignalingMessage::is_disconnect) {
                    self.interrupt(peer, messages, done);
                } else {
                    self.enqueue(peer, Job { messages, done });
                }
                delivered
            })
            .collect()
    }

    fn interrupt(&self, peer: PeerId, messages: Vec<SignalingMessage>, done: oneshot::Sender<()>) {
        let newest = messages.iter().map(|m| m.seq).max().unwrap_or_default();
        if let Some(worker) = self.inner.workers.lock().get(&peer) {
            worker.cutoff.fetch_max(newest, Ordering::SeqCst);
        }
        let registry = self.clone();
        tokio::spawn(async move {
            for msg in messages {
                registry.deliver(msg, None).await;
            }
            let _ = done.send(());
        });
    }

    fn enqueue(&self, peer: PeerId, job: Job) {
        let mut workers = self.inner.workers.lock();
        let worker = workers
            .entry(peer)
            .or_insert_with(|| self.spawn_worker(peer));
        if worker.tx.send(job).is_err() {
            warn!("Signaling worker for peer {} is gone", peer);
            workers.remove(&peer);
        }
    }

    /// Обработчик живёт, пока у собеседника есть очередь сообщений
    fn spawn_worker(&self, peer: PeerId) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let cutoff = Arc::new(AtomicU64::new(0));
        let registry = self.clone();
        let skip_before = cutoff.clone();
        tokio::spawn(async move {
            debug!("Signaling worker for peer {} started", peer);
            while let Some(job) = rx.recv().await {
                registry.process(peer, job, &skip_before).await;
                let idle = {
                    let mut workers = registry.inner.workers.lock();
                    let idle = rx.is_empty();
                    if idle {
                        workers.remove(&peer);
                    }
                    idle
                };
                if idle {
                    break;
                }
            }
            debug!("Signaling worker for peer {} stopped", peer);
        });
        Worker { tx, cutoff }
    }

    async fn process(&self, peer: PeerId, job: Job, cutoff: &AtomicU64) {
        let Job { messages, done } = job;
        let lane = self.lane(peer);
        {
            let _turn = lane.turn.lock().await;
            for msg in messages {
                if msg.seq < cutoff.load(Ordering::SeqCst) {
                    debug!("Dropped {} from peer {}: peer disconnected", msg.kind_str(), peer);
                    continue;
                }
                self.deliver(msg, Some(cutoff)).await;
            }
        }
        drop(lane);
        self.inner.prune_lane(peer);
        let _ = done.send(());
    }

    async fn deliver(&self, msg: SignalingMessage, cutoff: Option<&AtomicU64>) {
        let peer = msg.peer;
        let seq = msg.seq;
        let kind = msg.kind_str();
        self.inner.ctx.signaling.publish(&msg);
        let current = self.session(peer).filter(|s| s.is_live());
        let cancelled = || cutoff.is_some_and(|c| c.load(Ordering::SeqCst) > seq);

        let result = match msg.kind {
            MessageKind::Offer { desc, media, id } => {
                if let Some(existing) = current {
                    info!(
                        "New offer from peer {} supersedes session in {}",
                        peer,
                        existing.state()
                    );
                    existing.teardown(Teardown::Superseded).await;
                }
                if cancelled() {
                    Err(SessionError::StaleMessage("peer disconnected".into()))
                } else {
                    let session = self.create_session(peer);
                    // disconnect мог не застать новую сессию в registry
                    if cancelled() {
                        session.teardown(Teardown::Remote).await;
                        Err(SessionError::StaleMessage("peer disconnected".into()))
                    } else {
                        session.receive_offer(desc, media, id).await
                    }
                }
            }
            MessageKind::Answer { desc, id } => match current {
                Some(s) if s.state() == SessionState::Negotiating(Role::Caller) => {
                    s.receive_answer(desc, id.as_deref()).await
                }
                _ => Err(SessionError::StaleMessage("no call waiting for an answer".into())),
            },
            MessageKind::Candidate { candidate, id } => match current {
                Some(s) => s.receive_candidate(&candidate, id.as_deref()).await,
                None => Err(SessionError::StaleMessage("no session".into())),
            },
            MessageKind::Disconnect { id } => match current {
                Some(s) => s.receive_disconnect(id.as_deref()).await,
                None => Err(SessionError::StaleMessage("no session".into())),
            },
        };

        match result {
            Ok(()) => {}
            Err(SessionError::StaleMessage(why)) => {
                debug!("Dropped {} from peer {}: {}", kind, peer, why)
            }
            Err(e) if e.is_teardown() => debug!("{} from peer {} interrupted: {}", kind, peer, e),
            Err(e) => warn!("Failed to handle {} from peer {}: {}", kind, peer, e),
        }
    }
}
