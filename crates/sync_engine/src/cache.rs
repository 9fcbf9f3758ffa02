use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use shared::{domain::RoomId, protocol::Message};
use tracing::debug;

/// Last synchronized message list per room. Evicts the least recently
/// touched room once the optional bound is exceeded.
pub struct MessageCache {
    max_rooms: Option<usize>,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    rooms: HashMap<RoomId, Vec<Message>>,
    recency: VecDeque<RoomId>,
}

impl CacheInner {
    fn touch(&mut self, room_id: RoomId) {
        if let Some(position) = self.recency.iter().position(|id| *id == room_id) {
            self.recency.remove(position);
        }
        self.recency.push_back(room_id);
    }
}

impl MessageCache {
    pub fn new(max_rooms: Option<usize>) -> Self {
        Self {
            max_rooms: max_rooms.map(|bound| bound.max(1)),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn get(&self, room_id: RoomId) -> Vec<Message> {
        let mut inner = self.lock();
        let Some(messages) = inner.rooms.get(&room_id).cloned() else {
            return Vec::new();
        };
        inner.touch(room_id);
        messages
    }

    pub fn set(&self, room_id: RoomId, messages: Vec<Message>) {
        let mut inner = self.lock();
        // Optimistic entries are never a valid fallback.
        let confirmed: Vec<Message> = messages.into_iter().filter(|m| !m.pending).collect();
        inner.rooms.insert(room_id, confirmed);
        inner.touch(room_id);

        if let Some(bound) = self.max_rooms {
            while inner.rooms.len() > bound {
                let Some(evicted) = inner.recency.pop_front() else {
                    break;
                };
                inner.rooms.remove(&evicted);
                debug!(room_id = %evicted, "evicted room from message cache");
            }
        }
    }

    pub fn remove(&self, room_id: RoomId) {
        let mut inner = self.lock();
        inner.rooms.remove(&room_id);
        inner.recency.retain(|id| *id != room_id);
    }

    pub fn len(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        // A poisoned cache only ever holds plain data; keep serving it.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
