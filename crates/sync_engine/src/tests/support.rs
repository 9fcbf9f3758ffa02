use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use shared::{
    domain::{
        AttachmentId, MemberRole, MessageId, MessageKind, OrganizationId, Role, RoomId, RoomKind,
        UserId,
    },
    error::{ApiException, ErrorCode},
    protocol::{
        Attachment, Message, MessagePatch, NewAttachment, NewMembership, NewMessage, NewRoom,
        PresencePayload, Room, RoomMember, ServerFrame, StoredFile, Topic, TopicKey, UnreadCount,
        UserProfile,
    },
};
use tokio::sync::broadcast;

use crate::{
    remote::RemoteStore,
    store::{ChatSnapshot, StateStore},
    transport::{PushTransport, TransportSignal},
};

static CLOCK: AtomicI64 = AtomicI64::new(0);

/// Strictly increasing timestamps so ordering by creation time is stable.
pub fn next_timestamp() -> DateTime<Utc> {
    let tick = CLOCK.fetch_add(1, Ordering::SeqCst);
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid base timestamp")
        + chrono::Duration::seconds(tick)
}

pub fn sample_message(room_id: RoomId, body: &str) -> Message {
    let at = next_timestamp();
    Message {
        id: MessageId::new(),
        room_id,
        organization_id: OrganizationId::new(),
        author_id: UserId::new(),
        body: body.to_string(),
        kind: MessageKind::Text,
        parent_id: None,
        edited: false,
        created_at: at,
        updated_at: at,
        pending: false,
    }
}

pub fn sample_room(organization_id: OrganizationId) -> Room {
    let at = next_timestamp();
    Room {
        id: RoomId::new(),
        organization_id,
        name: "Night shift".to_string(),
        kind: RoomKind::Group,
        created_by: UserId::new(),
        is_private: false,
        members: Vec::new(),
        created_at: at,
        updated_at: at,
    }
}

pub fn sample_profile(organization_id: OrganizationId, role: Role) -> UserProfile {
    UserProfile {
        user_id: UserId::new(),
        organization_id,
        display_name: format!("{role:?}"),
        role,
    }
}

pub fn change_payload(event_type: &str, new: Option<Value>, old: Option<Value>) -> Value {
    let mut payload = json!({ "event_type": event_type });
    if let Some(new) = new {
        payload["new"] = new;
    }
    if let Some(old) = old {
        payload["old"] = old;
    }
    payload
}

/// Waits until `predicate` holds for the store's snapshot.
pub async fn wait_for<F>(store: &StateStore, predicate: F) -> Arc<ChatSnapshot>
where
    F: Fn(&ChatSnapshot) -> bool,
{
    let mut rx = store.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            rx.changed().await.expect("store dropped");
        }
    })
    .await
    .expect("condition not reached in time")
}

#[derive(Default)]
pub struct FakeTransportState {
    pub open: bool,
    pub open_calls: u32,
    pub fail_open: bool,
    pub open_delay: Option<Duration>,
    pub fail_join: bool,
    pub joined: Vec<TopicKey>,
    pub left: Vec<TopicKey>,
    pub presence: Vec<PresencePayload>,
}

pub struct FakeTransport {
    signals: broadcast::Sender<TransportSignal>,
    state: Mutex<FakeTransportState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(256);
        Arc::new(Self {
            signals,
            state: Mutex::new(FakeTransportState::default()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeTransportState> {
        self.state.lock().expect("fake transport state")
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn push(&self, topic: Topic, payload: Value) {
        let _ = self
            .signals
            .send(TransportSignal::Frame(ServerFrame::Event { topic, payload }));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.state().open = false;
        let _ = self.signals.send(TransportSignal::Closed {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn open(&self) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.open_calls += 1;
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_open {
            return Err(anyhow!("connection refused"));
        }
        state.open = true;
        Ok(())
    }

    async fn join(&self, key: TopicKey) -> Result<()> {
        let mut state = self.state();
        if state.fail_join || !state.open {
            return Err(anyhow!("join rejected"));
        }
        state.joined.push(key);
        Ok(())
    }

    async fn leave(&self, key: TopicKey) -> Result<()> {
        self.state().left.push(key);
        Ok(())
    }

    async fn send_presence(&self, _key: TopicKey, presence: PresencePayload) -> Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(anyhow!("push channel is not connected"));
        }
        state.presence.push(presence);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state().open = false;
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}

#[derive(Default)]
pub struct FakeRemoteState {
    pub profile: Option<UserProfile>,
    pub profiles: Vec<UserProfile>,
    pub rooms: Vec<Room>,
    pub messages: Vec<Message>,
    pub members: Vec<RoomMember>,
    pub attachments: Vec<Attachment>,
    pub files: HashMap<String, Vec<u8>>,
    pub unread: Vec<UnreadCount>,
    pub fail: HashSet<&'static str>,
    pub calls: Vec<&'static str>,
    pub fetch_delay: Option<Duration>,
}

pub struct FakeRemote {
    state: Mutex<FakeRemoteState>,
}

impl FakeRemote {
    pub fn new(profile: UserProfile) -> Arc<Self> {
        let state = FakeRemoteState {
            profiles: vec![profile.clone()],
            profile: Some(profile),
            ..FakeRemoteState::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeRemoteState> {
        self.state.lock().expect("fake remote state")
    }

    pub fn fail(&self, operation: &'static str) {
        self.state().fail.insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.state().fail.remove(operation);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    /// Adds a room the profile user belongs to, with the given messages.
    pub fn seed_room(&self, room: &Room, messages: &[Message]) {
        let mut state = self.state();
        state.rooms.push(room.clone());
        state.messages.extend(messages.iter().cloned());
    }

    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, FakeRemoteState>> {
        let mut state = self.state();
        state.calls.push(operation);
        if state.fail.contains(operation) {
            return Err(anyhow!("{operation} failed"));
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn current_user(&self) -> Result<UserProfile> {
        let state = self.enter("current_user")?;
        state.profile.clone().ok_or_else(|| anyhow!("not signed in"))
    }

    async fn list_rooms(
        &self,
        organization_id: OrganizationId,
        _user_id: UserId,
    ) -> Result<Vec<Room>> {
        let state = self.enter("list_rooms")?;
        Ok(state
            .rooms
            .iter()
            .filter(|room| room.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Room> {
        let state = self.enter("fetch_room")?;
        state
            .rooms
            .iter()
            .find(|room| room.id == room_id)
            .cloned()
            .ok_or_else(|| ApiException::new(ErrorCode::NotFound, "room not found").into())
    }

    async fn create_room(&self, room: NewRoom) -> Result<Room> {
        let mut state = self.enter("create_room")?;
        let at = next_timestamp();
        let created = Room {
            id: RoomId::new(),
            organization_id: room.organization_id,
            name: room.name,
            kind: room.kind,
            created_by: room.created_by,
            is_private: room.is_private,
            members: Vec::new(),
            created_at: at,
            updated_at: at,
        };
        state.rooms.push(created.clone());
        Ok(created)
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let delay = {
            let state = self.enter("fetch_messages")?;
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.room_id == room_id)
            .filter(|message| before.map_or(true, |before| message.created_at < before))
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.created_at);
        let skip = messages.len().saturating_sub(limit as usize);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let mut state = self.enter("insert_message")?;
        let at = next_timestamp();
        let stored = Message {
            id: message.id,
            room_id: message.room_id,
            organization_id: message.organization_id,
            author_id: message.author_id,
            body: message.body,
            kind: message.kind,
            parent_id: message.parent_id,
            edited: false,
            created_at: at,
            updated_at: at,
            pending: false,
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn update_message(&self, message_id: MessageId, patch: MessagePatch) -> Result<Message> {
        let mut state = self.enter("update_message")?;
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| anyhow!("message not found"))?;
        message.body = patch.body;
        message.edited = patch.edited;
        message.updated_at = next_timestamp();
        Ok(message.clone())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let mut state = self.enter("delete_message")?;
        state.messages.retain(|message| message.id != message_id);
        Ok(())
    }

    async fn insert_membership(&self, membership: NewMembership) -> Result<RoomMember> {
        let mut state = self.enter("insert_membership")?;
        if state
            .members
            .iter()
            .any(|m| m.room_id == membership.room_id && m.user_id == membership.user_id)
        {
            return Err(ApiException::new(ErrorCode::Conflict, "already a member").into());
        }
        let at = next_timestamp();
        let member = RoomMember {
            room_id: membership.room_id,
            user_id: membership.user_id,
            role: membership.role,
            created_at: at,
            updated_at: at,
        };
        state.members.push(member.clone());
        Ok(member)
    }

    async fn delete_membership(&self, room_id: RoomId, user_id: UserId) -> Result<()> {
        let mut state = self.enter("delete_membership")?;
        state
            .members
            .retain(|m| !(m.room_id == room_id && m.user_id == user_id));
        Ok(())
    }

    async fn list_members(&self, room_id: RoomId) -> Result<Vec<RoomMember>> {
        let state = self.enter("list_members")?;
        Ok(state
            .members
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn list_profiles(
        &self,
        organization_id: OrganizationId,
        user_ids: &[UserId],
    ) -> Result<Vec<UserProfile>> {
        let state = self.enter("list_profiles")?;
        Ok(state
            .profiles
            .iter()
            .filter(|p| p.organization_id == organization_id && user_ids.contains(&p.user_id))
            .cloned()
            .collect())
    }

    async fn upload_file(&self, path: &str, bytes: Vec<u8>, _mime_type: &str) -> Result<StoredFile> {
        let mut state = self.enter("upload_file")?;
        state.files.insert(path.to_string(), bytes);
        Ok(StoredFile {
            path: path.to_string(),
            public_url: format!("https://files.test/{path}"),
        })
    }

    async fn remove_files(&self, paths: &[String]) -> Result<()> {
        let mut state = self.enter("remove_files")?;
        for path in paths {
            state.files.remove(path);
        }
        Ok(())
    }

    async fn insert_attachment(&self, attachment: NewAttachment) -> Result<Attachment> {
        let mut state = self.enter("insert_attachment")?;
        let at = next_timestamp();
        let stored = Attachment {
            id: AttachmentId::new(),
            message_id: attachment.message_id,
            url: attachment.url,
            storage_path: attachment.storage_path,
            media_class: attachment.media_class,
            mime_type: attachment.mime_type,
            filename: attachment.filename,
            size_bytes: attachment.size_bytes,
            created_at: at,
            updated_at: at,
        };
        state.attachments.push(stored.clone());
        Ok(stored)
    }

    async fn list_attachments(&self, message_id: MessageId) -> Result<Vec<Attachment>> {
        let state = self.enter("list_attachments")?;
        Ok(state
            .attachments
            .iter()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn delete_attachments(&self, message_id: MessageId) -> Result<()> {
        let mut state = self.enter("delete_attachments")?;
        state.attachments.retain(|a| a.message_id != message_id);
        Ok(())
    }

    async fn unread_counts(&self, _user_id: UserId) -> Result<Vec<UnreadCount>> {
        let state = self.enter("unread_counts")?;
        Ok(state.unread.clone())
    }
}

pub fn membership(room_id: RoomId, user_id: UserId) -> RoomMember {
    let at = next_timestamp();
    RoomMember {
        room_id,
        user_id,
        role: MemberRole::Member,
        created_at: at,
        updated_at: at,
    }
}
