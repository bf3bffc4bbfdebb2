//! Канал сигнализации: отправка через relay, разбор и нормализация
//! уведомлений шины, поток входящих сообщений по собеседнику.

use crate::error::{Result, SessionError};
use crate::peer::types::{PeerId, RelayPayload, SignalingMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Одна запись из опрашиваемой шины
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// позиция в шине, растёт монотонно
    pub id: u64,
    pub topic: String,
    pub body: String,
}

/// Источник пачек уведомлений (long polling)
#[async_trait]
pub trait NotificationFeed: Send {
    /// `None` - шина закрыта
    async fn next_batch(&mut self) -> Option<Vec<Notification>>;
}

/// Внешний relay (`/broadcast/call`, `/broadcast/disconnect`)
#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, peer: PeerId, payload: RelayPayload) -> Result<()>;
}

const SUBSCRIBER_BUFFER: usize = 256;

pub struct SignalingChannel {
    relay: Arc<dyn Relay>,
    topic: String,
    inbound: broadcast::Sender<SignalingMessage>,
    last_seen: Mutex<Option<u64>>,
}

impl SignalingChannel {
    pub fn new(relay: Arc<dyn Relay>, topic: impl Into<String>) -> Self {
        let (inbound, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            relay,
            topic: topic.into(),
            inbound,
            last_seen: Mutex::new(None),
        }
    }

    pub async fn send(&self, peer: PeerId, payload: RelayPayload) -> Result<()> {
        debug!("Sending {} to peer {}", payload.kind_str(), peer);
        self.relay.send(peer, payload).await.map_err(|e| match e {
            SessionError::RelayUnavailable(_) => e,
            other => SessionError::RelayUnavailable(other.to_string()),
        })
    }

    /// Разбор уведомления; чужие топики и мусор отбрасываются
    pub fn parse(&self, notification: &Notification) -> Option<SignalingMessage> {
        if notification.topic != self.topic {
            return None;
        }
        match SignalingMessage::parse(notification.id, &notification.body) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Dropping notification {}: {}", notification.id, e);
                None
            }
        }
    }

    /// Пачка уведомлений → сообщения по собеседникам в порядке получения.
    ///
    /// Уже виденные позиции шины отбрасываются как дубли, внутри пачки
    /// каждого собеседника применяется [`collapse`].
    pub fn normalize(&self, batch: Vec<Notification>) -> Vec<(PeerId, Vec<SignalingMessage>)> {
        let mut last_seen = self.last_seen.lock();
        let floor = *last_seen;
        let mut seen = HashSet::new();
        let mut messages = Vec::with_capacity(batch.len());

        for notification in &batch {
            if floor.is_some_and(|f| notification.id <= f) || !seen.insert(notification.id) {
                debug!("Duplicate notification {} suppressed", notification.id);
                continue;
            }
            *last_seen = Some(last_seen.map_or(notification.id, |l| l.max(notification.id)));
            if let Some(msg) = self.parse(notification) {
                messages.push(msg);
            }
        }
        drop(last_seen);

        partition_by_peer(messages)
            .into_iter()
            .map(|(peer, msgs)| (peer, collapse(msgs)))
            .collect()
    }

    /// Сообщение доставлено сессии - отдаём его слушателям
    pub fn publish(&self, msg: &SignalingMessage) {
        // нет слушателей - не ошибка
        let _ = self.inbound.send(msg.clone());
    }

    /// Ленивый бесконечный поток сообщений одного собеседника.
    ///
    /// Каждый вызов - новый слушатель, начинающий с текущей позиции.
    pub fn subscribe(&self, peer: PeerId) -> impl Stream<Item = SignalingMessage> + Send + Unpin {
        BroadcastStream::new(self.inbound.subscribe()).filter_map(move |item| match item {
            Ok(msg) if msg.peer == peer => Some(msg),
            Ok(_) => None,
            Err(e) => {
                warn!("Signaling subscriber for peer {} lagged: {}", peer, e);
                None
            }
        })
    }
}

/// Разбивка по собеседникам, порядок внутри каждого сохраняется
pub fn partition_by_peer(messages: Vec<SignalingMessage>) -> Vec<(PeerId, Vec<SignalingMessage>)> {
    let mut groups: Vec<(PeerId, Vec<SignalingMessage>)> = Vec::new();
    for msg in messages {
        match groups.iter().position(|(peer, _)| *peer == msg.peer) {
            Some(i) => groups[i].1.push(msg),
            None => groups.push((msg.peer, vec![msg])),
        }
    }
    groups
}

/// Сжатие пачки одного собеседника.
///
/// Всё до последнего offer устарело. Disconnect без более нового offer
/// поглощает всё, что пришло вместе с ним.
pub fn collapse(mut messages: Vec<SignalingMessage>) -> Vec<SignalingMessage> {
    let last_offer = messages.iter().rposition(|m| m.is_offer());
    let last_disconnect = messages.iter().rposition(|m| m.is_disconnect());

    let kept = match (last_offer, last_disconnect) {
        (None, Some(d)) => vec![messages.swap_remove(d)],
        (Some(o), Some(d)) if o < d => vec![messages.swap_remove(d)],
        (Some(o), _) => messages.split_off(o),
        (None, None) => return messages,
    };
    if let Some(first) = kept.first() {
        debug!(
            "Collapsed signaling batch for peer {} to {} messages starting at {}",
            first.peer,
            kept.len(),
            first.kind_str()
        );
    }
    kept
}
