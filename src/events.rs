//! Типизированные события для UI: появились дорожки, звонок завершён.

use crate::media::{TrackKind, TrackSet};
use crate::peer::types::PeerId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LocalVideo,
    LocalAudio,
    LocalScreen,
    RemoteVideo,
    RemoteAudio,
    RemoteScreen,
    CallDisconnected,
    Disconnect,
    MediaUnavailable,
}

impl EventKind {
    pub fn local(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => EventKind::LocalAudio,
            TrackKind::Video => EventKind::LocalVideo,
            TrackKind::Screen => EventKind::LocalScreen,
        }
    }

    pub fn remote(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => EventKind::RemoteAudio,
            TrackKind::Video => EventKind::RemoteVideo,
            TrackKind::Screen => EventKind::RemoteScreen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LocalVideo => "local_video",
            EventKind::LocalAudio => "local_audio",
            EventKind::LocalScreen => "local_screen",
            EventKind::RemoteVideo => "remote_video",
            EventKind::RemoteAudio => "remote_audio",
            EventKind::RemoteScreen => "remote_screen",
            EventKind::CallDisconnected => "call_disconnected",
            EventKind::Disconnect => "disconnect",
            EventKind::MediaUnavailable => "media_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    LocalStream {
        peer: PeerId,
        kind: TrackKind,
        tracks: TrackSet,
    },
    RemoteStream {
        peer: PeerId,
        kind: TrackKind,
        tracks: TrackSet,
    },
    /// сессия завершена (ровно один раз за жизнь сессии)
    CallDisconnected { peer: PeerId },
    /// registry удалил сессию
    Disconnect { peer: PeerId },
    MediaUnavailable { peer: PeerId, reason: String },
}

impl CallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CallEvent::LocalStream { kind, .. } => EventKind::local(*kind),
            CallEvent::RemoteStream { kind, .. } => EventKind::remote(*kind),
            CallEvent::CallDisconnected { .. } => EventKind::CallDisconnected,
            CallEvent::Disconnect { .. } => EventKind::Disconnect,
            CallEvent::MediaUnavailable { .. } => EventKind::MediaUnavailable,
        }
    }

    pub fn peer(&self) -> PeerId {
        match self {
            CallEvent::LocalStream { peer, .. }
            | CallEvent::RemoteStream { peer, .. }
            | CallEvent::CallDisconnected { peer }
            | CallEvent::Disconnect { peer }
            | CallEvent::MediaUnavailable { peer, .. } => *peer,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    peer: Option<PeerId>,
    handler: EventHandler,
}

/// Подписки UI на события звонков
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `peer == None` - события от всех собеседников
    pub fn subscribe<F>(&self, kind: EventKind, peer: Option<PeerId>, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push(Subscription {
            id,
            kind,
            peer,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn emit(&self, event: CallEvent) {
        let kind = event.kind();
        let peer = event.peer();
        // обработчики вызываются без удержания блокировки
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind == kind && s.peer.map_or(true, |p| p == peer))
            .map(|s| s.handler.clone())
            .collect();
        debug!(
            "Emitting {} for peer {} to {} handlers",
            kind.as_str(),
            peer,
            handlers.len()
        );
        for handler in handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn filters_by_kind_and_peer() {
        let bus = EventBus::new();
        let any_peer = Arc::new(AtomicUsize::new(0));
        let only_three = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::CallDisconnected, None, {
            let c = any_peer.clone();
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.subscribe(EventKind::CallDisconnected, Some(PeerId(3)), {
            let c = only_three.clone();
            move |e| {
                assert_eq!(e.peer(), PeerId(3));
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(CallEvent::CallDisconnected { peer: PeerId(3) });
        bus.emit(CallEvent::CallDisconnected { peer: PeerId(4) });
        bus.emit(CallEvent::Disconnect { peer: PeerId(3) });

        assert_eq!(any_peer.load(Ordering::SeqCst), 2);
        assert_eq!(only_three.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(EventKind::LocalAudio, None, {
            let c = count.clone();
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        let event = CallEvent::LocalStream {
            peer: PeerId(1),
            kind: TrackKind::Audio,
            tracks: TrackSet::default(),
        };
        bus.emit(event.clone());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(event);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_from_inside() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(EventKind::Disconnect, None, move |_| {
            inner.subscribe(EventKind::Disconnect, None, |_| {});
        });
        bus.emit(CallEvent::Disconnect { peer: PeerId(9) });
        assert_eq!(bus.subscriptions.lock().len(), 2);
    }
}
