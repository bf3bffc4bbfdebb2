#![allow(dead_code)]

use async_trait::async_trait;
use broadcast_lib::error::{Result, SessionError};
use broadcast_lib::events::{CallEvent, EventKind};
use broadcast_lib::media::{CaptureTrack, MediaDevices, MediaRequest, MediaTrack, TrackKind, TrackSet};
use broadcast_lib::peer::{
    IceCandidate, PeerId, RelayPayload, SdpType, SessionDescription, Transport, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};
use broadcast_lib::signaling::{Notification, Relay};
use broadcast_lib::utils::random_id;
use broadcast_lib::{BroadcastConfig, SessionRegistry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

// ========== TRANSPORT ==========

pub struct FakeTransport {
    pub n: usize,
    events: TransportEvents,
    factory: Arc<FactoryStats>,
    closed: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    pub tracks: Mutex<TrackSet>,
    pub candidates: Mutex<Vec<IceCandidate>>,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Событие от транспорта, как будто его прислал webrtc
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn connect(&self) {
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
    }

    pub fn fail(&self) {
        self.emit(TransportEvent::StateChanged(TransportState::Failed));
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn add_tracks(&self, tracks: &TrackSet) -> Result<()> {
        self.record(format!("add_tracks:{}", tracks.len()));
        self.tracks.lock().extend(tracks);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer-{}", self.n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("answer-{}", self.n)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", desc.sdp));
        // сбор кандидатов начинается сразу после set_local
        self.emit(TransportEvent::LocalCandidate(candidate(self.n as u32)));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", desc.sdp));
        if desc.sdp.starts_with("broken") {
            return Err(SessionError::TransportFailure("bad sdp".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.record("add_ice_candidate");
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record("close");
            self.factory.live.fetch_sub(1, Ordering::SeqCst);
            let delay = self.factory.close_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FactoryStats {
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    /// сколько длится close() после отметки о закрытии
    pub close_delay_ms: AtomicU64,
}

#[derive(Default)]
pub struct FakeFactory {
    stats: Arc<FactoryStats>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn opened(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.stats.max_live.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport opened")
    }

    pub fn nth(&self, n: usize) -> Arc<FakeTransport> {
        self.transports.lock()[n].clone()
    }

    pub fn slow_close(&self, delay: Duration) {
        self.stats
            .close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn open(&self, events: TransportEvents) -> Result<Arc<dyn Transport>> {
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);
        let mut transports = self.transports.lock();
        let transport = Arc::new(FakeTransport {
            n: transports.len(),
            events,
            factory: self.stats.clone(),
            closed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            tracks: Mutex::new(TrackSet::default()),
            candidates: Mutex::new(Vec::new()),
        });
        transports.push(transport.clone());
        Ok(transport)
    }
}

// ========== DEVICES ==========

#[derive(Default)]
pub struct FakeDevices {
    pub unavailable: AtomicBool,
    pub entered: Notify,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub opened: Mutex<Vec<Arc<dyn MediaTrack>>>,
}

impl FakeDevices {
    /// Следующий захват ждёт, пока не отпустят возвращённый sender
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub fn all_stopped(&self) -> bool {
        self.opened.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(&self, request: &MediaRequest) -> Result<Vec<Arc<dyn MediaTrack>>> {
        self.entered.notify_one();
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionError::MediaUnavailable("permission denied".into()));
        }
        let tracks: Vec<Arc<dyn MediaTrack>> = request
            .kinds()
            .into_iter()
            .map(|kind| Arc::new(CaptureTrack::remote(random_id(), kind)) as Arc<dyn MediaTrack>)
            .collect();
        self.opened.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

// ========== RELAY ==========

#[derive(Default)]
pub struct RecordingRelay {
    pub sent: Mutex<Vec<(PeerId, RelayPayload)>>,
    pub refuse: AtomicBool,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<(PeerId, RelayPayload)> {
        self.sent.lock().clone()
    }

    /// Виды отправленных сообщений: offer / answer / candidate / disconnect
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, p)| p.kind_str()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn last_call_id(&self) -> Option<String> {
        self.sent.lock().iter().rev().find_map(|(_, p)| match p {
            RelayPayload::Call { id, .. } => id.clone(),
            _ => None,
        })
    }
}

#[async_trait]
impl Relay for RecordingRelay {
    async fn send(&self, peer: PeerId, payload: RelayPayload) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::RelayUnavailable("503".into()));
        }
        self.sent.lock().push((peer, payload));
        Ok(())
    }
}

// ========== EVENTS ==========

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<(EventKind, PeerId)>>>);

impl EventLog {
    pub fn attach(registry: &SessionRegistry) -> Self {
        let log = EventLog::default();
        for kind in [
            EventKind::LocalVideo,
            EventKind::LocalAudio,
            EventKind::LocalScreen,
            EventKind::RemoteVideo,
            EventKind::RemoteAudio,
            EventKind::RemoteScreen,
            EventKind::CallDisconnected,
            EventKind::Disconnect,
            EventKind::MediaUnavailable,
        ] {
            let log = log.clone();
            registry.subscribe(kind, None, move |event: &CallEvent| {
                log.0.lock().push((event.kind(), event.peer()));
            });
        }
        log
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.0.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.0.lock().iter().map(|(k, _)| *k).collect()
    }
}

// ========== FIXTURE ==========

pub struct Fixture {
    pub registry: SessionRegistry,
    pub factory: Arc<FakeFactory>,
    pub devices: Arc<FakeDevices>,
    pub relay: Arc<RecordingRelay>,
    pub events: EventLog,
    next_note: AtomicU64,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(BroadcastConfig::default())
    }

    pub fn with_config(config: BroadcastConfig) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let devices = Arc::new(FakeDevices::default());
        let relay = Arc::new(RecordingRelay::default());
        let registry =
            SessionRegistry::new(config, devices.clone(), factory.clone(), relay.clone())
                .expect("valid config");
        let events = EventLog::attach(&registry);
        Self {
            registry,
            factory,
            devices,
            relay,
            events,
            next_note: AtomicU64::new(1),
        }
    }

    pub fn note(&self, body: serde_json::Value) -> Notification {
        Notification {
            id: self.next_note.fetch_add(1, Ordering::SeqCst),
            topic: "broadcast".into(),
            body: body.to_string(),
        }
    }

    pub fn offer(&self, peer: u64, sdp: &str, id: &str) -> Notification {
        self.note(serde_json::json!({
            "type": "call",
            "desc": {"type": "offer", "sdp": sdp},
            "mediaConfig": {"audio": true, "video": true},
            "id": id,
            "partner_id": peer,
        }))
    }

    pub fn answer(&self, peer: u64, sdp: &str, id: &str) -> Notification {
        self.note(serde_json::json!({
            "type": "call",
            "desc": {"type": "answer", "sdp": sdp},
            "id": id,
            "partner_id": peer,
        }))
    }

    pub fn candidate(&self, peer: u64, id: &str) -> Notification {
        self.note(serde_json::json!({
            "type": "candidate",
            "candidate": candidate(7),
            "id": id,
            "partner_id": peer,
        }))
    }

    pub fn disconnect(&self, peer: u64) -> Notification {
        self.note(serde_json::json!({"type": "disconnect", "partner_id": peer}))
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn offer_sdp(payload: &RelayPayload) -> Option<&str> {
    match payload {
        RelayPayload::Call { desc, .. } if desc.sdp_type == SdpType::Offer => Some(&desc.sdp),
        _ => None,
    }
}

/// Ждёт условия, отдавая управление фоновым задачам сессий
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

pub fn remote_track(kind: TrackKind) -> Arc<dyn MediaTrack> {
    Arc::new(CaptureTrack::remote(random_id(), kind))
}
