//! Шина уведомлений в памяти процесса: relay и long polling без бэкенда.
//!
//! Канал шины - пара (topic, получатель). Новый `call` или `disconnect`
//! от отправителя удаляет его ещё не прочитанные сообщения этому же
//! получателю, как это делает бэкенд. Сообщение хранится, пока его не
//! прочитали все слушатели получателя.

use crate::error::Result;
use crate::peer::types::{PeerId, RelayPayload};
use crate::signaling::{Notification, NotificationFeed, Relay};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

struct Entry {
    id: u64,
    sender: PeerId,
    recipient: PeerId,
    body: String,
}

#[derive(Default)]
struct BusState {
    last_id: u64,
    entries: Vec<Entry>,
    /// слушатель → (получатель, последняя прочитанная позиция)
    cursors: HashMap<u64, (PeerId, u64)>,
    next_listener: u64,
    closed: bool,
}

impl BusState {
    fn prune(&mut self) {
        let BusState {
            entries, cursors, ..
        } = self;
        let before = entries.len();
        entries.retain(|e| {
            cursors
                .values()
                .any(|(recipient, last)| *recipient == e.recipient && *last < e.id)
        });
        let read = before - entries.len();
        if read > 0 {
            debug!("Bus forgot {} delivered messages", read);
        }
    }
}

#[derive(Clone)]
pub struct MemoryBus {
    topic: String,
    state: Arc<Mutex<BusState>>,
    posted: Arc<Notify>,
}

impl MemoryBus {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Arc::new(Mutex::new(BusState::default())),
            posted: Arc::new(Notify::new()),
        }
    }

    /// Relay, подписывающий сообщения как `sender`
    pub fn relay_for(&self, sender: PeerId) -> BusRelay {
        BusRelay {
            bus: self.clone(),
            sender,
        }
    }

    /// Слушатель сообщений для `recipient`, начиная с текущего конца шины
    pub fn listen(&self, recipient: PeerId) -> BusListener {
        let (id, last) = {
            let mut state = self.state.lock();
            state.next_listener += 1;
            let id = state.next_listener;
            let last = state.last_id;
            state.cursors.insert(id, (recipient, last));
            (id, last)
        };
        BusListener {
            bus: self.clone(),
            id,
            recipient,
            last,
        }
    }

    /// Все слушатели получают `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.posted.notify_waiters();
    }

    /// Сколько сообщений ждут получателя после позиции `after`
    pub fn pending(&self, recipient: PeerId, after: u64) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.recipient == recipient && e.id > after)
            .count()
    }

    fn post(&self, sender: PeerId, recipient: PeerId, payload: &RelayPayload) -> Result<u64> {
        let mut value = serde_json::to_value(payload)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("partner_id".into(), sender.0.into());
        }
        let body = serde_json::to_string(&value)?;

        let id = {
            let mut state = self.state.lock();
            if matches!(
                payload,
                RelayPayload::Call { .. } | RelayPayload::Disconnect { .. }
            ) {
                let before = state.entries.len();
                state
                    .entries
                    .retain(|e| !(e.sender == sender && e.recipient == recipient));
                let dropped = before - state.entries.len();
                if dropped > 0 {
                    debug!(
                        "Bus dropped {} queued messages from {} to {}",
                        dropped, sender, recipient
                    );
                }
            }
            state.last_id += 1;
            let id = state.last_id;
            state.entries.push(Entry {
                id,
                sender,
                recipient,
                body,
            });
            state.prune();
            id
        };
        self.posted.notify_waiters();
        Ok(id)
    }
}

pub struct BusRelay {
    bus: MemoryBus,
    sender: PeerId,
}

#[async_trait]
impl Relay for BusRelay {
    async fn send(&self, peer: PeerId, payload: RelayPayload) -> Result<()> {
        let id = self.bus.post(self.sender, peer, &payload)?;
        debug!(
            "Bus #{}: {} from {} to {}",
            id,
            payload.kind_str(),
            self.sender,
            peer
        );
        Ok(())
    }
}

pub struct BusListener {
    bus: MemoryBus,
    id: u64,
    recipient: PeerId,
    /// последняя прочитанная позиция
    last: u64,
}

impl BusListener {
    pub fn cursor(&self) -> u64 {
        self.last
    }
}

#[async_trait]
impl NotificationFeed for BusListener {
    async fn next_batch(&mut self) -> Option<Vec<Notification>> {
        loop {
            let posted = self.bus.posted.notified();
            tokio::pin!(posted);
            // подписка до проверки, чтобы не пропустить notify_waiters
            posted.as_mut().enable();
            {
                let mut state = self.bus.state.lock();
                if state.closed {
                    return None;
                }
                let batch: Vec<Notification> = state
                    .entries
                    .iter()
                    .filter(|e| e.recipient == self.recipient && e.id > self.last)
                    .map(|e| Notification {
                        id: e.id,
                        topic: self.bus.topic.clone(),
                        body: e.body.clone(),
                    })
                    .collect();
                if let Some(newest) = batch.last() {
                    self.last = newest.id;
                    state.cursors.insert(self.id, (self.recipient, self.last));
                    state.prune();
                    return Some(batch);
                }
            }
            posted.await;
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        let mut state = self.bus.state.lock();
        state.cursors.remove(&self.id);
        state.prune();
    }
}
