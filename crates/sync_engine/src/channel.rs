use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::Value;
use shared::protocol::{PresencePayload, ServerFrame, Topic, TopicFilter, TopicKey};
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::{PushTransport, TransportSignal};

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub topic: Topic,
    pub payload: Value,
}

pub type EventHandler = Arc<dyn Fn(RawEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Opened,
    Closed { reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open push channel: {source}")]
    Open { source: anyhow::Error },
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: &'static str,
        source: anyhow::Error,
    },
    #[error("failed to broadcast presence: {source}")]
    Presence { source: anyhow::Error },
}

struct Registration {
    key: TopicKey,
    handler: EventHandler,
}

#[derive(Default)]
struct AdapterState {
    connected: bool,
    next_id: u64,
    registrations: HashMap<u64, Registration>,
}

struct AdapterShared {
    transport: Arc<dyn PushTransport>,
    state: Mutex<AdapterState>,
    lifecycle: broadcast::Sender<ChannelLifecycle>,
}

impl AdapterShared {
    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, topic: Topic, payload: Value) {
        let handlers: Vec<EventHandler> = {
            let state = self.lock();
            state
                .registrations
                .values()
                .filter(|registration| {
                    registration.key.topic == topic
                        && filter_matches(&registration.key.filter, &payload)
                })
                .map(|registration| Arc::clone(&registration.handler))
                .collect()
        };
        if handlers.is_empty() {
            debug!(topic = topic.as_str(), "no subscriber for push event");
        }
        for handler in handlers {
            handler(RawEvent {
                topic,
                payload: payload.clone(),
            });
        }
    }

    fn mark_closed(&self, reason: String) {
        let was_connected = {
            let mut state = self.lock();
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.lifecycle.send(ChannelLifecycle::Closed { reason });
        }
    }
}

/// Releases one subscription. Dropping the handle without calling
/// [`SubscriptionHandle::unsubscribe`] leaves the registration in place until
/// [`EventChannelAdapter::disconnect`].
pub struct SubscriptionHandle {
    id: u64,
    key: TopicKey,
    shared: Arc<AdapterShared>,
}

impl SubscriptionHandle {
    pub async fn unsubscribe(self) {
        let (removed, still_used, connected) = {
            let mut state = self.shared.lock();
            let removed = state.registrations.remove(&self.id).is_some();
            let still_used = state
                .registrations
                .values()
                .any(|registration| registration.key == self.key);
            (removed, still_used, state.connected)
        };
        if !removed || still_used || !connected {
            return;
        }
        if let Err(err) = self.shared.transport.leave(self.key).await {
            warn!(topic = self.key.topic.as_str(), %err, "failed to leave topic");
        }
    }
}

pub struct EventChannelAdapter {
    shared: Arc<AdapterShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannelAdapter {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(AdapterShared {
                transport,
                state: Mutex::new(AdapterState::default()),
                lifecycle,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<ChannelLifecycle> {
        self.shared.lifecycle.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }
        self.reconnect().await
    }

    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        self.ensure_pump();
        self.shared
            .transport
            .open()
            .await
            .map_err(|source| ChannelError::Open { source })?;
        self.resubscribe_all().await?;
        self.shared.lock().connected = true;
        let _ = self.shared.lifecycle.send(ChannelLifecycle::Opened);
        Ok(())
    }

    pub async fn resubscribe_all(&self) -> Result<(), ChannelError> {
        for key in self.registered_keys() {
            self.shared
                .transport
                .join(key)
                .await
                .map_err(|source| ChannelError::Subscribe {
                    topic: key.topic.as_str(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Registers `handler` for events on `key`. While connected the topic is
    /// joined right away; a failed join is reported as a transport close so
    /// reconnection re-subscribes it.
    pub async fn subscribe(&self, key: TopicKey, handler: EventHandler) -> SubscriptionHandle {
        let (id, connected) = {
            let mut state = self.shared.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.registrations.insert(id, Registration { key, handler });
            (id, state.connected)
        };

        if connected {
            if let Err(err) = self.shared.transport.join(key).await {
                warn!(topic = key.topic.as_str(), %err, "topic join failed");
                self.shared
                    .mark_closed(format!("subscribe to {} failed: {err}", key.topic.as_str()));
            }
        }

        SubscriptionHandle {
            id,
            key,
            shared: Arc::clone(&self.shared),
        }
    }

    pub async fn send_presence(
        &self,
        key: TopicKey,
        presence: PresencePayload,
    ) -> Result<(), ChannelError> {
        self.shared
            .transport
            .send_presence(key, presence)
            .await
            .map_err(|source| ChannelError::Presence { source })
    }

    pub async fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            state.registrations.clear();
            state.connected = false;
        }
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
        }
        if let Err(err) = self.shared.transport.close().await {
            warn!(%err, "failed to close push transport");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registrations.len()
    }

    fn registered_keys(&self) -> Vec<TopicKey> {
        let state = self.shared.lock();
        let mut keys: Vec<TopicKey> = Vec::new();
        for registration in state.registrations.values() {
            if !keys.contains(&registration.key) {
                keys.push(registration.key);
            }
        }
        keys
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_pump(&self) {
        let mut pump = self.lock_pump();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let mut signals = shared.transport.signals();
        *pump = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(TransportSignal::Frame(ServerFrame::Event { topic, payload })) => {
                        shared.deliver(topic, payload);
                    }
                    Ok(TransportSignal::Frame(ServerFrame::Error(error))) => {
                        warn!(code = ?error.code, message = %error.message, "push channel error frame");
                    }
                    Ok(TransportSignal::Closed { reason }) => shared.mark_closed(reason),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push event pump lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

/// Matches `filter` against the record in `payload`: the `new` record, else
/// the `old` record, else the payload itself. A payload that carries no value
/// for the filtered field at all (e.g. a delete with only the primary key) is
/// accepted.
pub fn filter_matches(filter: &TopicFilter, payload: &Value) -> bool {
    let (field, expected) = match filter {
        TopicFilter::Room(room_id) => ("room_id", room_id.0),
        TopicFilter::Organization(organization_id) => ("organization_id", organization_id.0),
    };
    let found = [payload.get("new"), payload.get("old"), Some(payload)]
        .into_iter()
        .flatten()
        .find_map(|record| record.get(field).and_then(Value::as_str));
    match found {
        Some(raw) => Uuid::parse_str(raw).is_ok_and(|value| value == expected),
        None => true,
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
