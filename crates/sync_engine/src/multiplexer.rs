use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use shared::{
    domain::{MessageId, OrganizationId, RoomId, UserId},
    protocol::{
        ChangeKind, ChangePayload, Message, PresenceKind, PresencePayload, Room, Topic,
        TopicFilter, TopicKey,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    cache::MessageCache,
    channel::{EventChannelAdapter, EventHandler, RawEvent, SubscriptionHandle},
    connection::ConnectionTransition,
    remote::RemoteStore,
    store::{Action, ConnectionStatus, MergePosition, StateStore},
};

enum WorkItem {
    Event(RawEvent),
    Connection(ConnectionTransition),
}

struct ActiveSubscriptions {
    room_id: RoomId,
    organization_id: OrganizationId,
    handles: Vec<SubscriptionHandle>,
}

pub struct SubscriptionMultiplexer {
    adapter: Arc<EventChannelAdapter>,
    store: Arc<StateStore>,
    cache: Arc<MessageCache>,
    remote: Arc<dyn RemoteStore>,
    typing_ttl: Duration,
    page_size: u32,
    queue: mpsc::UnboundedSender<WorkItem>,
    pending_queue: StdMutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
    active: Mutex<Option<ActiveSubscriptions>>,
    typing_generations: StdMutex<HashMap<(RoomId, UserId), u64>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionMultiplexer {
    pub fn new(
        adapter: Arc<EventChannelAdapter>,
        store: Arc<StateStore>,
        cache: Arc<MessageCache>,
        remote: Arc<dyn RemoteStore>,
        typing_ttl: Duration,
        page_size: u32,
    ) -> Arc<Self> {
        let (queue, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            adapter,
            store,
            cache,
            remote,
            typing_ttl,
            page_size,
            queue,
            pending_queue: StdMutex::new(Some(receiver)),
            active: Mutex::new(None),
            typing_generations: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>, transitions: broadcast::Receiver<ConnectionTransition>) {
        let Some(mut receiver) = lock(&self.pending_queue).take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                let Some(multiplexer) = weak.upgrade() else {
                    break;
                };
                multiplexer.process(item).await;
            }
        });

        let queue = self.queue.clone();
        let forwarder = tokio::spawn(async move {
            let mut transitions = BroadcastStream::new(transitions);
            while let Some(next) = transitions.next().await {
                match next {
                    Ok(transition) => {
                        if queue.send(WorkItem::Connection(transition)).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, "connection transitions lagged"),
                }
            }
        });

        lock(&self.tasks).extend([worker, forwarder]);
    }

    pub async fn activate(&self, room_id: RoomId, organization_id: OrganizationId) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            release(previous).await;
        }

        let keys = [
            TopicKey {
                topic: Topic::MessageChanges,
                filter: TopicFilter::Room(room_id),
            },
            TopicKey {
                topic: Topic::RoomChanges,
                filter: TopicFilter::Organization(organization_id),
            },
            TopicKey {
                topic: Topic::Typing,
                filter: TopicFilter::Room(room_id),
            },
        ];
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            handles.push(self.adapter.subscribe(key, self.enqueue_handler()).await);
        }
        info!(room_id = %room_id, "room subscriptions active");
        *active = Some(ActiveSubscriptions {
            room_id,
            organization_id,
            handles,
        });
    }

    pub async fn deactivate(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            release(previous).await;
        }
    }

    pub async fn active_room(&self) -> Option<(RoomId, OrganizationId)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| (active.room_id, active.organization_id))
    }

    pub async fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.deactivate().await;
    }

    fn enqueue_handler(&self) -> EventHandler {
        let queue = self.queue.clone();
        Arc::new(move |event: RawEvent| {
            if queue.send(WorkItem::Event(event)).is_err() {
                debug!("multiplexer queue closed; dropping event");
            }
        })
    }

    async fn process(self: &Arc<Self>, item: WorkItem) {
        match item {
            WorkItem::Event(event) => {
                let topic = event.topic;
                let result = match topic {
                    Topic::MessageChanges => self.on_message_change(event.payload).await,
                    Topic::RoomChanges => self.on_room_change(event.payload).await,
                    Topic::Typing => self.on_presence(event.payload),
                };
                if let Err(err) = result {
                    warn!(topic = topic.as_str(), error = %format!("{err:#}"), "dropping push event");
                }
            }
            WorkItem::Connection(transition) => self.on_connection(transition).await,
        }
    }

    async fn on_message_change(&self, payload: Value) -> Result<()> {
        let change: ChangePayload =
            serde_json::from_value(payload).context("malformed message change")?;
        match change.event_type {
            ChangeKind::Insert => {
                let message: Message = record(change.new, "new")?;
                let room_id = message.room_id;
                if self.store.snapshot().active_room != Some(room_id) {
                    debug!(room_id = %room_id, "ignoring insert for inactive room");
                    return Ok(());
                }
                let message_id = message.id;
                self.store.dispatch(Action::AppendMessage(message));
                let attachments = self
                    .remote
                    .list_attachments(message_id)
                    .await
                    .with_context(|| format!("list attachments for {message_id}"))?;
                if !attachments.is_empty() {
                    self.store.dispatch(Action::SetAttachments {
                        message_id,
                        attachments,
                    });
                }
                self.refresh_cache(room_id);
            }
            ChangeKind::Update => {
                let message: Message = record(change.new, "new")?;
                let room_id = message.room_id;
                self.store.dispatch(Action::UpdateMessage(message));
                self.refresh_cache(room_id);
            }
            ChangeKind::Delete => {
                let old = change.old.ok_or_else(|| anyhow!("delete without old record"))?;
                let message_id: MessageId = field(&old, "id")?;
                let room_id = match field::<RoomId>(&old, "room_id") {
                    Ok(room_id) => room_id,
                    Err(_) => self
                        .store
                        .snapshot()
                        .active_room
                        .ok_or_else(|| anyhow!("delete for {message_id} without a room"))?,
                };
                self.store.dispatch(Action::RemoveMessage {
                    room_id,
                    message_id,
                });
                self.refresh_cache(room_id);
            }
        }
        Ok(())
    }

    async fn on_room_change(&self, payload: Value) -> Result<()> {
        let change: ChangePayload =
            serde_json::from_value(payload).context("malformed room change")?;
        match change.event_type {
            ChangeKind::Insert | ChangeKind::Update => {
                let room: Room = record(change.new, "new")?;
                let snapshot = self.store.snapshot();
                let is_member = snapshot
                    .local_user
                    .is_some_and(|user_id| room.members.contains(&user_id));
                if is_member || snapshot.room(room.id).is_some() {
                    self.store.dispatch(Action::UpsertRoom(room));
                }
            }
            ChangeKind::Delete => {
                let old = change.old.ok_or_else(|| anyhow!("delete without old record"))?;
                let room_id: RoomId = field(&old, "id")?;
                let was_active = self.store.snapshot().active_room == Some(room_id);
                self.store.dispatch(Action::RemoveRoom(room_id));
                self.cache.remove(room_id);
                if was_active {
                    self.deactivate().await;
                }
            }
        }
        Ok(())
    }

    fn on_presence(self: &Arc<Self>, payload: Value) -> Result<()> {
        let presence: PresencePayload =
            serde_json::from_value(payload).context("malformed presence payload")?;
        if self.store.snapshot().local_user == Some(presence.user_id) {
            return Ok(());
        }
        let key = (presence.room_id, presence.user_id);
        let generation = {
            let mut generations = lock(&self.typing_generations);
            let generation = generations.entry(key).or_default();
            *generation += 1;
            *generation
        };
        match presence.event {
            PresenceKind::Track => {
                self.store.dispatch(Action::AddTypingUser {
                    room_id: presence.room_id,
                    user_id: presence.user_id,
                });
                self.schedule_typing_expiry(key, generation);
            }
            PresenceKind::Untrack => {
                lock(&self.typing_generations).remove(&key);
                self.store.dispatch(Action::RemoveTypingUser {
                    room_id: presence.room_id,
                    user_id: presence.user_id,
                });
            }
        }
        Ok(())
    }

    fn schedule_typing_expiry(self: &Arc<Self>, key: (RoomId, UserId), generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let ttl = self.typing_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(multiplexer) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut generations = lock(&multiplexer.typing_generations);
                if generations.get(&key) == Some(&generation) {
                    generations.remove(&key);
                    true
                } else {
                    false
                }
            };
            if expired {
                multiplexer.store.dispatch(Action::RemoveTypingUser {
                    room_id: key.0,
                    user_id: key.1,
                });
            }
        });
    }

    async fn on_connection(&self, transition: ConnectionTransition) {
        self.store.dispatch(Action::SetConnection(transition.state()));
        let entered = transition.from != transition.to;

        match transition.to {
            ConnectionStatus::Reconnecting | ConnectionStatus::Disconnected => {
                if transition.to == ConnectionStatus::Disconnected {
                    if let Some(error) = &transition.last_error {
                        self.store.dispatch(Action::SetError(Some(error.clone())));
                    }
                }
                if entered {
                    self.apply_cache_fallback();
                }
            }
            ConnectionStatus::Connected => {
                if entered {
                    if let Err(err) = self.catch_up().await {
                        warn!(error = %format!("{err:#}"), "catch-up after reconnect failed");
                    }
                }
            }
        }
    }

    fn apply_cache_fallback(&self) {
        let snapshot = self.store.snapshot();
        let Some(room_id) = snapshot.active_room else {
            return;
        };
        let mut messages = self.cache.get(room_id);
        if messages.is_empty() {
            return;
        }
        for pending in snapshot.room_messages(room_id).iter().filter(|m| m.pending) {
            if messages.iter().all(|cached| cached.id != pending.id) {
                messages.push(pending.clone());
            }
        }
        info!(room_id = %room_id, count = messages.len(), "serving cached messages");
        self.store
            .dispatch(Action::ReplaceMessages { room_id, messages });
    }

    /// Merges what the active room missed while disconnected. Pages back from
    /// the newest message until a page overlaps a confirmed local message or
    /// the room's history runs out.
    async fn catch_up(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        let Some(room_id) = snapshot.active_room else {
            return Ok(());
        };
        let known: HashSet<MessageId> = snapshot
            .room_messages(room_id)
            .iter()
            .filter(|message| !message.pending)
            .map(|message| message.id)
            .collect();

        let mut messages: Vec<Message> = Vec::new();
        let mut before = None;
        loop {
            let page = self
                .remote
                .fetch_messages(room_id, self.page_size, before)
                .await
                .with_context(|| format!("fetch missed messages for {room_id}"))?;
            let full = page.len() >= self.page_size as usize;
            let overlaps = page.iter().any(|message| known.contains(&message.id));
            let oldest = page.first().map(|message| message.created_at);
            messages.splice(0..0, page);
            if known.is_empty() || overlaps || !full {
                break;
            }
            // an oldest timestamp that does not move back would loop forever
            match (oldest, before) {
                (Some(oldest), Some(previous)) if oldest >= previous => break,
                (None, _) => break,
                _ => before = oldest,
            }
        }

        if self.store.snapshot().active_room != Some(room_id) {
            return Ok(());
        }
        info!(room_id = %room_id, count = messages.len(), "merging messages after reconnect");
        self.store.dispatch(Action::MergeMessages {
            room_id,
            messages,
            position: MergePosition::Newer,
        });
        self.refresh_cache(room_id);
        Ok(())
    }

    fn refresh_cache(&self, room_id: RoomId) {
        let snapshot = self.store.snapshot();
        if snapshot.messages.contains_key(&room_id) {
            self.cache
                .set(room_id, snapshot.room_messages(room_id).to_vec());
        }
    }
}

async fn release(active: ActiveSubscriptions) {
    debug!(room_id = %active.room_id, "releasing room subscriptions");
    for handle in active.handles {
        handle.unsubscribe().await;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record<T: serde::de::DeserializeOwned>(value: Option<Value>, name: &str) -> Result<T> {
    let value = value.ok_or_else(|| anyhow!("change without {name} record"))?;
    serde_json::from_value(value).with_context(|| format!("malformed {name} record"))
}

fn field<T: serde::de::DeserializeOwned>(record: &Value, name: &str) -> Result<T> {
    let value = record
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("record has no {name}"))?;
    serde_json::from_value(value).with_context(|| format!("malformed {name}"))
}

#[cfg(test)]
#[path = "tests/multiplexer_tests.rs"]
mod tests;
