use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{Attachment, Message, Room, RoomMember},
};
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    pub has_more: bool,
    pub in_flight: bool,
    pub oldest: Option<DateTime<Utc>>,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            has_more: true,
            in_flight: false,
            oldest: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePosition {
    /// An older page: unseen messages go in front, in the order given.
    Older,
    /// A newer batch: known ids are replaced in place, unseen ones appended.
    Newer,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    pub local_user: Option<UserId>,
    pub rooms: Vec<Room>,
    pub messages: HashMap<RoomId, Vec<Message>>,
    pub members: HashMap<RoomId, Vec<RoomMember>>,
    pub attachments: HashMap<MessageId, Vec<Attachment>>,
    pub typing: HashMap<RoomId, BTreeSet<UserId>>,
    pub unread: HashMap<RoomId, u32>,
    pub pagination: PaginationCursor,
    pub active_room: Option<RoomId>,
    pub reply_target: Option<MessageId>,
    pub connection: ConnectionState,
    pub loading: bool,
    pub error: Option<String>,
}

impl ChatSnapshot {
    pub fn knows_room(&self, room_id: RoomId) -> bool {
        self.messages.contains_key(&room_id) || self.rooms.iter().any(|room| room.id == room_id)
    }

    pub fn room_messages(&self, room_id: RoomId) -> &[Message] {
        self.messages
            .get(&room_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn active_messages(&self) -> &[Message] {
        self.active_room
            .map(|room_id| self.room_messages(room_id))
            .unwrap_or_default()
    }

    pub fn find_message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|messages| messages.iter())
            .find(|message| message.id == message_id)
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.iter().find(|room| room.id == room_id)
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    SetLocalUser(UserId),
    SetActiveRoom(Option<RoomId>),
    ReplaceRooms(Vec<Room>),
    UpsertRoom(Room),
    RemoveRoom(RoomId),
    ReplaceMessages {
        room_id: RoomId,
        messages: Vec<Message>,
    },
    AppendMessage(Message),
    UpdateMessage(Message),
    RemoveMessage {
        room_id: RoomId,
        message_id: MessageId,
    },
    RestoreMessage {
        index: usize,
        message: Message,
    },
    MergeMessages {
        room_id: RoomId,
        messages: Vec<Message>,
        position: MergePosition,
    },
    AddTypingUser {
        room_id: RoomId,
        user_id: UserId,
    },
    RemoveTypingUser {
        room_id: RoomId,
        user_id: UserId,
    },
    SetConnection(ConnectionState),
    SetUnreadCount {
        room_id: RoomId,
        count: u32,
    },
    SetAttachments {
        message_id: MessageId,
        attachments: Vec<Attachment>,
    },
    SetMembers {
        room_id: RoomId,
        members: Vec<RoomMember>,
    },
    SetPagination {
        room_id: RoomId,
        cursor: PaginationCursor,
    },
    SetReplyTarget(Option<MessageId>),
    SetLoading(bool),
    SetError(Option<String>),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetLocalUser(_) => "set_local_user",
            Self::SetActiveRoom(_) => "set_active_room",
            Self::ReplaceRooms(_) => "replace_rooms",
            Self::UpsertRoom(_) => "upsert_room",
            Self::RemoveRoom(_) => "remove_room",
            Self::ReplaceMessages { .. } => "replace_messages",
            Self::AppendMessage(_) => "append_message",
            Self::UpdateMessage(_) => "update_message",
            Self::RemoveMessage { .. } => "remove_message",
            Self::RestoreMessage { .. } => "restore_message",
            Self::MergeMessages { .. } => "merge_messages",
            Self::AddTypingUser { .. } => "add_typing_user",
            Self::RemoveTypingUser { .. } => "remove_typing_user",
            Self::SetConnection(_) => "set_connection",
            Self::SetUnreadCount { .. } => "set_unread_count",
            Self::SetAttachments { .. } => "set_attachments",
            Self::SetMembers { .. } => "set_members",
            Self::SetPagination { .. } => "set_pagination",
            Self::SetReplyTarget(_) => "set_reply_target",
            Self::SetLoading(_) => "set_loading",
            Self::SetError(_) => "set_error",
        }
    }
}

/// Pure state transition. `state` is never modified; the returned snapshot
/// shares nothing mutable with it.
pub fn reduce(state: &ChatSnapshot, action: Action) -> ChatSnapshot {
    let mut next = state.clone();
    match action {
        Action::SetLocalUser(user_id) => {
            next.local_user = Some(user_id);
            for typers in next.typing.values_mut() {
                typers.remove(&user_id);
            }
        }
        Action::SetActiveRoom(room_id) => {
            if next.active_room != room_id {
                next.pagination = PaginationCursor::default();
                next.reply_target = None;
            }
            next.active_room = room_id;
            if let Some(room_id) = room_id {
                next.messages.entry(room_id).or_default();
            }
        }
        Action::ReplaceRooms(rooms) => {
            next.rooms = rooms;
        }
        Action::UpsertRoom(room) => {
            match next.rooms.iter_mut().find(|existing| existing.id == room.id) {
                Some(existing) => *existing = room,
                None => next.rooms.push(room),
            }
        }
        Action::RemoveRoom(room_id) => {
            if !state.knows_room(room_id) {
                return next;
            }
            next.rooms.retain(|room| room.id != room_id);
            if let Some(removed) = next.messages.remove(&room_id) {
                for message in removed {
                    next.attachments.remove(&message.id);
                }
            }
            next.members.remove(&room_id);
            next.typing.remove(&room_id);
            next.unread.remove(&room_id);
            if next.active_room == Some(room_id) {
                next.active_room = None;
                next.pagination = PaginationCursor::default();
                next.reply_target = None;
            }
        }
        Action::ReplaceMessages { room_id, messages } => {
            if !state.knows_room(room_id) {
                return next;
            }
            next.messages.insert(room_id, messages);
        }
        Action::AppendMessage(message) => {
            if !state.knows_room(message.room_id) {
                return next;
            }
            let list = next.messages.entry(message.room_id).or_default();
            match list.iter_mut().find(|existing| existing.id == message.id) {
                Some(existing) => *existing = message,
                None => list.push(message),
            }
        }
        Action::UpdateMessage(message) => {
            if let Some(existing) = next
                .messages
                .get_mut(&message.room_id)
                .and_then(|list| list.iter_mut().find(|existing| existing.id == message.id))
            {
                *existing = message;
            }
        }
        Action::RemoveMessage {
            room_id,
            message_id,
        } => {
            let Some(list) = next.messages.get_mut(&room_id) else {
                return next;
            };
            let before = list.len();
            list.retain(|message| message.id != message_id);
            if list.len() != before {
                next.attachments.remove(&message_id);
                if next.reply_target == Some(message_id) {
                    next.reply_target = None;
                }
            }
        }
        Action::RestoreMessage { index, message } => {
            let Some(list) = next.messages.get_mut(&message.room_id) else {
                return next;
            };
            if list.iter().all(|existing| existing.id != message.id) {
                let index = index.min(list.len());
                list.insert(index, message);
            }
        }
        Action::MergeMessages {
            room_id,
            messages,
            position,
        } => {
            if !state.knows_room(room_id) {
                return next;
            }
            let list = next.messages.entry(room_id).or_default();
            merge_into(list, messages, position);
        }
        Action::AddTypingUser { room_id, user_id } => {
            if !state.knows_room(room_id) || state.local_user == Some(user_id) {
                return next;
            }
            next.typing.entry(room_id).or_default().insert(user_id);
        }
        Action::RemoveTypingUser { room_id, user_id } => {
            if let Some(typers) = next.typing.get_mut(&room_id) {
                typers.remove(&user_id);
                if typers.is_empty() {
                    next.typing.remove(&room_id);
                }
            }
        }
        Action::SetConnection(connection) => {
            next.connection = connection;
        }
        Action::SetUnreadCount { room_id, count } => {
            if !state.knows_room(room_id) {
                return next;
            }
            next.unread.insert(room_id, count);
        }
        Action::SetAttachments {
            message_id,
            attachments,
        } => {
            if state.find_message(message_id).is_none() {
                return next;
            }
            next.attachments.insert(message_id, attachments);
        }
        Action::SetMembers { room_id, members } => {
            if !state.knows_room(room_id) {
                return next;
            }
            next.members.insert(room_id, members);
        }
        Action::SetPagination { room_id, cursor } => {
            if next.active_room == Some(room_id) {
                next.pagination = cursor;
            }
        }
        Action::SetReplyTarget(target) => {
            next.reply_target = match target {
                Some(message_id) if state.find_message(message_id).is_none() => state.reply_target,
                other => other,
            };
        }
        Action::SetLoading(loading) => {
            next.loading = loading;
        }
        Action::SetError(error) => {
            next.error = error;
        }
    }
    next
}

fn merge_into(list: &mut Vec<Message>, incoming: Vec<Message>, position: MergePosition) {
    let mut unseen = Vec::new();
    for message in incoming {
        match list.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None if unseen.iter().any(|seen: &Message| seen.id == message.id) => {}
            None => unseen.push(message),
        }
    }
    match position {
        MergePosition::Older => {
            unseen.append(list);
            *list = unseen;
        }
        MergePosition::Newer => list.append(&mut unseen),
    }
}

pub struct StateStore {
    tx: watch::Sender<Arc<ChatSnapshot>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ChatSnapshot::default()));
        Self { tx }
    }

    pub fn snapshot(&self) -> Arc<ChatSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ChatSnapshot>> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, action: Action) {
        trace!(action = action.name(), "dispatch");
        self.tx.send_modify(|state| {
            let next = reduce(state, action);
            *state = Arc::new(next);
        });
    }

    /// Marks the active room's pagination as in flight and returns the room
    /// with its oldest loaded timestamp. `None` when no fetch is allowed.
    pub fn begin_pagination(&self) -> Option<(RoomId, Option<DateTime<Utc>>)> {
        let mut started = None;
        self.tx.send_if_modified(|state| {
            let Some(room_id) = state.active_room else {
                return false;
            };
            if !state.pagination.has_more || state.pagination.in_flight {
                return false;
            }
            let oldest = state.pagination.oldest;
            let cursor = PaginationCursor {
                has_more: true,
                in_flight: true,
                oldest,
            };
            let next = reduce(state, Action::SetPagination { room_id, cursor });
            *state = Arc::new(next);
            started = Some((room_id, oldest));
            true
        });
        started
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
