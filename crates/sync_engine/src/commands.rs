use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use shared::{
    domain::{MediaClass, MemberRole, MessageId, MessageKind, Role, RoomId, RoomKind, UserId},
    protocol::{
        Attachment, Message, MessagePatch, NewAttachment, NewMembership, NewMessage, NewRoom,
        PresenceKind, PresencePayload, Room, Topic, TopicFilter, TopicKey, UserProfile,
    },
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::MessageCache,
    channel::{ChannelError, EventChannelAdapter},
    multiplexer::SubscriptionMultiplexer,
    remote::{is_conflict, RemoteStore},
    store::{Action, MergePosition, PaginationCursor, StateStore},
};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no active room")]
    NoActiveRoom,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{filename} is {size} bytes, larger than the {limit} byte limit")]
    AttachmentTooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },
    #[error("not allowed: {0}")]
    Forbidden(String),
    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("attaching {filename} to message {message_id} failed: {source}")]
    Attachment {
        message_id: MessageId,
        filename: String,
        source: anyhow::Error,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

fn remote_error(operation: &'static str) -> impl FnOnce(anyhow::Error) -> CommandError {
    move |source| CommandError::Remote { operation, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomCreationPolicy {
    pub creator_role: Role,
    pub member_role: Role,
}

impl Default for RoomCreationPolicy {
    fn default() -> Self {
        Self {
            creator_role: Role::Manager,
            member_role: Role::Employee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    pub max_attachment_bytes: u64,
    pub page_size: u32,
    /// Remove uploaded files and the message itself when attaching fails.
    pub cleanup_on_attachment_failure: bool,
    pub room_policy: RoomCreationPolicy,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            max_attachment_bytes: 10 * 1024 * 1024,
            page_size: 50,
            cleanup_on_attachment_failure: false,
            room_policy: RoomCreationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Uploading,
    Uploaded,
    Saved,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub index: usize,
    pub total: usize,
    pub filename: String,
    pub bytes_total: u64,
    pub stage: UploadStage,
}

pub type ProgressCallback = dyn Fn(UploadProgress) + Send + Sync;

#[derive(Debug, Clone)]
pub struct CreateRoomRequest {
    pub name: String,
    pub kind: RoomKind,
    pub is_private: bool,
    pub member_ids: Vec<UserId>,
}

pub struct CommandPipeline {
    store: Arc<StateStore>,
    cache: Arc<MessageCache>,
    remote: Arc<dyn RemoteStore>,
    adapter: Arc<EventChannelAdapter>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    options: CommandOptions,
    auth: Mutex<Option<UserProfile>>,
}

impl CommandPipeline {
    pub fn new(
        store: Arc<StateStore>,
        cache: Arc<MessageCache>,
        remote: Arc<dyn RemoteStore>,
        adapter: Arc<EventChannelAdapter>,
        multiplexer: Arc<SubscriptionMultiplexer>,
        options: CommandOptions,
    ) -> Self {
        Self {
            store,
            cache,
            remote,
            adapter,
            multiplexer,
            options,
            auth: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    pub async fn auth_context(&self) -> Result<UserProfile, CommandError> {
        let mut auth = self.auth.lock().await;
        if let Some(profile) = auth.as_ref() {
            return Ok(profile.clone());
        }
        let profile = self
            .remote
            .current_user()
            .await
            .map_err(remote_error("current_user"))?;
        self.store.dispatch(Action::SetLocalUser(profile.user_id));
        *auth = Some(profile.clone());
        Ok(profile)
    }

    pub async fn send_message(
        &self,
        body: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, CommandError> {
        self.send_message_with_progress(body, files, &|_: UploadProgress| {})
            .await
    }

    pub async fn send_message_with_progress(
        &self,
        body: &str,
        files: Vec<OutgoingFile>,
        progress: &ProgressCallback,
    ) -> Result<Message, CommandError> {
        let body = body.trim();
        if body.is_empty() && files.is_empty() {
            return Err(CommandError::Validation(
                "a message needs text or at least one file".into(),
            ));
        }
        for file in &files {
            let size = file.bytes.len() as u64;
            if size > self.options.max_attachment_bytes {
                return Err(CommandError::AttachmentTooLarge {
                    filename: file.filename.clone(),
                    size,
                    limit: self.options.max_attachment_bytes,
                });
            }
        }
        let snapshot = self.store.snapshot();
        let room_id = snapshot.active_room.ok_or(CommandError::NoActiveRoom)?;
        let profile = self.auth_context().await?;

        let kind = match files.first() {
            Some(file) if body.is_empty() => MediaClass::from_mime(&file.mime_type).message_kind(),
            _ => MessageKind::Text,
        };
        let now = Utc::now();
        let optimistic = Message {
            id: MessageId::new(),
            room_id,
            organization_id: profile.organization_id,
            author_id: profile.user_id,
            body: body.to_string(),
            kind,
            parent_id: snapshot.reply_target,
            edited: false,
            created_at: now,
            updated_at: now,
            pending: true,
        };
        let message_id = optimistic.id;
        self.store.dispatch(Action::AppendMessage(optimistic.clone()));

        let inserted = self
            .remote
            .insert_message(NewMessage {
                id: message_id,
                room_id,
                organization_id: optimistic.organization_id,
                author_id: optimistic.author_id,
                body: optimistic.body.clone(),
                kind,
                parent_id: optimistic.parent_id,
            })
            .await;
        let confirmed = match inserted {
            Ok(message) => message,
            Err(source) => {
                warn!(room_id = %room_id, message_id = %message_id, error = %source, "send failed; rolling back");
                self.store.dispatch(Action::RemoveMessage {
                    room_id,
                    message_id,
                });
                return Err(CommandError::Remote {
                    operation: "insert_message",
                    source,
                });
            }
        };
        self.store.dispatch(Action::AppendMessage(confirmed.clone()));
        if snapshot.reply_target.is_some() {
            self.store.dispatch(Action::SetReplyTarget(None));
        }
        self.remember(room_id);
        info!(room_id = %room_id, message_id = %message_id, files = files.len(), "message sent");

        if !files.is_empty() {
            self.attach_files(&profile, &confirmed, files, progress)
                .await?;
        }
        Ok(confirmed)
    }

    async fn attach_files(
        &self,
        profile: &UserProfile,
        message: &Message,
        files: Vec<OutgoingFile>,
        progress: &ProgressCallback,
    ) -> Result<(), CommandError> {
        let total = files.len();
        let mut stored_paths: Vec<String> = Vec::new();
        let mut attachments: Vec<Attachment> = Vec::new();

        for (index, file) in files.into_iter().enumerate() {
            let report = |stage| {
                progress(UploadProgress {
                    index,
                    total,
                    filename: file.filename.clone(),
                    bytes_total: file.bytes.len() as u64,
                    stage,
                })
            };
            report(UploadStage::Uploading);

            let path = storage_path(profile.user_id, message.id, index, &file.filename);
            let size_bytes = file.bytes.len() as u64;
            let outcome = async {
                let stored = self
                    .remote
                    .upload_file(&path, file.bytes.clone(), &file.mime_type)
                    .await
                    .context("upload failed")?;
                stored_paths.push(stored.path.clone());
                report(UploadStage::Uploaded);
                self.remote
                    .insert_attachment(NewAttachment {
                        message_id: message.id,
                        url: stored.public_url,
                        storage_path: stored.path,
                        media_class: MediaClass::from_mime(&file.mime_type),
                        mime_type: file.mime_type.clone(),
                        filename: file.filename.clone(),
                        size_bytes,
                    })
                    .await
                    .context("saving attachment record failed")
            }
            .await;

            match outcome {
                Ok(attachment) => {
                    report(UploadStage::Saved);
                    attachments.push(attachment);
                }
                Err(source) => {
                    report(UploadStage::Failed);
                    warn!(message_id = %message.id, filename = %file.filename, error = %format!("{source:#}"), "attachment failed");
                    self.after_attachment_failure(message, &stored_paths, attachments)
                        .await;
                    return Err(CommandError::Attachment {
                        message_id: message.id,
                        filename: file.filename,
                        source,
                    });
                }
            }
        }

        self.store.dispatch(Action::SetAttachments {
            message_id: message.id,
            attachments,
        });
        Ok(())
    }

    async fn after_attachment_failure(
        &self,
        message: &Message,
        stored_paths: &[String],
        saved: Vec<Attachment>,
    ) {
        if !self.options.cleanup_on_attachment_failure {
            if !saved.is_empty() {
                self.store.dispatch(Action::SetAttachments {
                    message_id: message.id,
                    attachments: saved,
                });
            }
            return;
        }

        if let Err(err) = self.remote.remove_files(stored_paths).await {
            warn!(message_id = %message.id, %err, "cleanup: removing uploaded files failed");
        }
        if !saved.is_empty() {
            if let Err(err) = self.remote.delete_attachments(message.id).await {
                warn!(message_id = %message.id, %err, "cleanup: deleting attachment rows failed");
            }
        }
        if let Err(err) = self.remote.delete_message(message.id).await {
            warn!(message_id = %message.id, %err, "cleanup: deleting message failed");
        }
        self.store.dispatch(Action::RemoveMessage {
            room_id: message.room_id,
            message_id: message.id,
        });
        self.remember(message.room_id);
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
    ) -> Result<Message, CommandError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(CommandError::Validation("message body is empty".into()));
        }
        let profile = self.auth_context().await?;
        let previous = self.known_message(message_id)?;
        if previous.author_id != profile.user_id {
            return Err(CommandError::Forbidden(
                "only the author can edit a message".into(),
            ));
        }
        if previous.pending {
            return Err(CommandError::Validation("message is still sending".into()));
        }

        let mut optimistic = previous.clone();
        optimistic.body = body.to_string();
        optimistic.edited = true;
        optimistic.updated_at = Utc::now();
        self.store.dispatch(Action::UpdateMessage(optimistic));

        let patch = MessagePatch {
            body: body.to_string(),
            edited: true,
        };
        match self.remote.update_message(message_id, patch).await {
            Ok(updated) => {
                self.store.dispatch(Action::UpdateMessage(updated.clone()));
                self.remember(updated.room_id);
                Ok(updated)
            }
            Err(source) => {
                warn!(message_id = %message_id, error = %source, "edit failed; restoring");
                self.store.dispatch(Action::UpdateMessage(previous));
                Err(CommandError::Remote {
                    operation: "update_message",
                    source,
                })
            }
        }
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), CommandError> {
        let profile = self.auth_context().await?;
        let snapshot = self.store.snapshot();
        let message = self.known_message(message_id)?;
        let elevated = matches!(profile.role, Role::Admin | Role::Manager);
        if message.author_id != profile.user_id && !elevated {
            return Err(CommandError::Forbidden(
                "only the author or a manager can delete a message".into(),
            ));
        }
        if message.pending {
            return Err(CommandError::Validation("message is still sending".into()));
        }
        let room_id = message.room_id;
        let index = snapshot
            .room_messages(room_id)
            .iter()
            .position(|m| m.id == message_id)
            .unwrap_or_default();
        let previous_attachments = snapshot.attachments.get(&message_id).cloned();

        self.store.dispatch(Action::RemoveMessage {
            room_id,
            message_id,
        });

        let outcome: anyhow::Result<()> = async {
            let attachments = self
                .remote
                .list_attachments(message_id)
                .await
                .context("listing attachments")?;
            if !attachments.is_empty() {
                let paths: Vec<String> = attachments
                    .iter()
                    .map(|attachment| attachment.storage_path.clone())
                    .collect();
                self.remote
                    .remove_files(&paths)
                    .await
                    .context("removing stored files")?;
                self.remote
                    .delete_attachments(message_id)
                    .await
                    .context("deleting attachment rows")?;
            }
            self.remote
                .delete_message(message_id)
                .await
                .context("deleting message row")
        }
        .await;

        match outcome {
            Ok(()) => {
                self.remember(room_id);
                info!(room_id = %room_id, message_id = %message_id, "message deleted");
                Ok(())
            }
            Err(source) => {
                warn!(message_id = %message_id, error = %format!("{source:#}"), "delete failed; restoring");
                self.store
                    .dispatch(Action::RestoreMessage { index, message });
                if let Some(attachments) = previous_attachments {
                    self.store.dispatch(Action::SetAttachments {
                        message_id,
                        attachments,
                    });
                }
                Err(CommandError::Remote {
                    operation: "delete_message",
                    source,
                })
            }
        }
    }

    /// Joins the room remotely and makes it the active room. Nothing changes
    /// locally unless every remote step succeeds.
    pub async fn join_room(&self, room_id: RoomId) -> Result<Room, CommandError> {
        let profile = self.auth_context().await?;
        self.store.dispatch(Action::SetLoading(true));
        self.store.dispatch(Action::SetError(None));
        let result = self.join_room_inner(&profile, room_id).await;
        self.store.dispatch(Action::SetLoading(false));
        if let Err(err) = &result {
            warn!(room_id = %room_id, error = %err, "join failed");
            self.store.dispatch(Action::SetError(Some(err.to_string())));
        }
        result
    }

    async fn join_room_inner(
        &self,
        profile: &UserProfile,
        room_id: RoomId,
    ) -> Result<Room, CommandError> {
        let mut room = self
            .remote
            .fetch_room(room_id)
            .await
            .map_err(remote_error("fetch_room"))?;
        if room.organization_id != profile.organization_id {
            return Err(CommandError::Forbidden(
                "room belongs to another organization".into(),
            ));
        }

        let membership = NewMembership {
            room_id,
            user_id: profile.user_id,
            role: MemberRole::Member,
        };
        match self.remote.insert_membership(membership).await {
            Ok(_) => {}
            Err(err) if is_conflict(&err) => {
                debug!(room_id = %room_id, "already a member");
            }
            Err(source) => {
                return Err(CommandError::Remote {
                    operation: "insert_membership",
                    source,
                })
            }
        }

        let page_size = self.options.page_size;
        let messages = self
            .remote
            .fetch_messages(room_id, page_size, None)
            .await
            .map_err(remote_error("fetch_messages"))?;
        let members = self
            .remote
            .list_members(room_id)
            .await
            .map_err(remote_error("list_members"))?;

        if !room.members.contains(&profile.user_id) {
            room.members.push(profile.user_id);
        }
        let cursor = PaginationCursor {
            has_more: messages.len() >= page_size as usize,
            in_flight: false,
            oldest: messages.first().map(|message| message.created_at),
        };
        self.store.dispatch(Action::UpsertRoom(room.clone()));
        self.store.dispatch(Action::SetActiveRoom(Some(room_id)));
        self.store.dispatch(Action::ReplaceMessages {
            room_id,
            messages: messages.clone(),
        });
        self.store
            .dispatch(Action::SetMembers { room_id, members });
        self.store
            .dispatch(Action::SetPagination { room_id, cursor });
        self.store
            .dispatch(Action::SetUnreadCount { room_id, count: 0 });
        self.cache.set(room_id, messages);
        self.multiplexer
            .activate(room_id, room.organization_id)
            .await;
        info!(room_id = %room_id, "joined room");
        Ok(room)
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), CommandError> {
        let profile = self.auth_context().await?;
        self.remote
            .delete_membership(room_id, profile.user_id)
            .await
            .map_err(remote_error("delete_membership"))?;
        if self.store.snapshot().active_room == Some(room_id) {
            self.multiplexer.deactivate().await;
        }
        self.store.dispatch(Action::RemoveRoom(room_id));
        self.cache.remove(room_id);
        info!(room_id = %room_id, "left room");
        Ok(())
    }

    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, CommandError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(CommandError::Validation("room name is empty".into()));
        }
        let profile = self.auth_context().await?;
        let policy = self.options.room_policy;
        if profile.role != policy.creator_role {
            return Err(CommandError::Forbidden(format!(
                "creating rooms requires the {:?} role",
                policy.creator_role
            )));
        }

        let mut targets: Vec<UserId> = Vec::new();
        for user_id in request.member_ids {
            if user_id != profile.user_id && !targets.contains(&user_id) {
                targets.push(user_id);
            }
        }
        if request.kind == RoomKind::Direct && targets.len() != 1 {
            return Err(CommandError::Validation(
                "a direct room needs exactly one other member".into(),
            ));
        }
        if !targets.is_empty() {
            let profiles = self
                .remote
                .list_profiles(profile.organization_id, &targets)
                .await
                .map_err(remote_error("list_profiles"))?;
            for user_id in &targets {
                let Some(target) = profiles.iter().find(|p| p.user_id == *user_id) else {
                    return Err(CommandError::Forbidden(format!(
                        "user {user_id} is not in this organization"
                    )));
                };
                if target.role != policy.member_role {
                    return Err(CommandError::Forbidden(format!(
                        "{} does not hold the {:?} role",
                        target.display_name, policy.member_role
                    )));
                }
            }
        }

        let mut room = self
            .remote
            .create_room(NewRoom {
                organization_id: profile.organization_id,
                name: name.to_string(),
                kind: request.kind,
                created_by: profile.user_id,
                is_private: request.is_private,
            })
            .await
            .map_err(remote_error("create_room"))?;

        let memberships = std::iter::once((profile.user_id, MemberRole::Owner))
            .chain(targets.iter().map(|user_id| (*user_id, MemberRole::Member)));
        for (user_id, role) in memberships {
            let membership = NewMembership {
                room_id: room.id,
                user_id,
                role,
            };
            match self.remote.insert_membership(membership).await {
                Ok(_) => {}
                Err(err) if is_conflict(&err) => {}
                Err(source) => {
                    return Err(CommandError::Remote {
                        operation: "insert_membership",
                        source,
                    })
                }
            }
            if !room.members.contains(&user_id) {
                room.members.push(user_id);
            }
        }

        self.store.dispatch(Action::UpsertRoom(room.clone()));
        info!(room_id = %room.id, members = room.members.len(), "room created");
        Ok(room)
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), CommandError> {
        let room_id = self
            .store
            .snapshot()
            .active_room
            .ok_or(CommandError::NoActiveRoom)?;
        let profile = self.auth_context().await?;
        let key = TopicKey {
            topic: Topic::Typing,
            filter: TopicFilter::Room(room_id),
        };
        let presence = PresencePayload {
            event: if typing {
                PresenceKind::Track
            } else {
                PresenceKind::Untrack
            },
            room_id,
            user_id: profile.user_id,
        };
        self.adapter.send_presence(key, presence).await?;
        Ok(())
    }

    /// Loads the page before the oldest loaded message. Returns how many
    /// messages arrived; zero when nothing was fetched.
    pub async fn load_older_messages(&self) -> Result<usize, CommandError> {
        let Some((room_id, oldest)) = self.store.begin_pagination() else {
            return Ok(0);
        };
        let page_size = self.options.page_size;
        let fetched = self.remote.fetch_messages(room_id, page_size, oldest).await;

        let snapshot = self.store.snapshot();
        if snapshot.active_room != Some(room_id) {
            debug!(room_id = %room_id, "discarding page for a room that is no longer active");
            return Ok(0);
        }

        match fetched {
            Ok(messages) => {
                let count = messages.len();
                let cursor = PaginationCursor {
                    has_more: count >= page_size as usize,
                    in_flight: false,
                    oldest: messages.first().map(|m| m.created_at).or(oldest),
                };
                self.store.dispatch(Action::MergeMessages {
                    room_id,
                    messages,
                    position: MergePosition::Older,
                });
                self.store
                    .dispatch(Action::SetPagination { room_id, cursor });
                self.remember(room_id);
                debug!(room_id = %room_id, count, "loaded older messages");
                Ok(count)
            }
            Err(source) => {
                let cursor = PaginationCursor {
                    in_flight: false,
                    ..snapshot.pagination.clone()
                };
                self.store
                    .dispatch(Action::SetPagination { room_id, cursor });
                Err(CommandError::Remote {
                    operation: "fetch_messages",
                    source,
                })
            }
        }
    }

    pub async fn fetch_attachments(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Attachment>, CommandError> {
        let attachments = self
            .remote
            .list_attachments(message_id)
            .await
            .map_err(remote_error("list_attachments"))?;
        self.store.dispatch(Action::SetAttachments {
            message_id,
            attachments: attachments.clone(),
        });
        Ok(attachments)
    }

    pub fn set_reply_target(&self, target: Option<MessageId>) -> Result<(), CommandError> {
        if let Some(message_id) = target {
            self.known_message(message_id)?;
        }
        self.store.dispatch(Action::SetReplyTarget(target));
        Ok(())
    }

    pub async fn refresh_rooms(&self) -> Result<Vec<Room>, CommandError> {
        let profile = self.auth_context().await?;
        let rooms = self
            .remote
            .list_rooms(profile.organization_id, profile.user_id)
            .await
            .map_err(remote_error("list_rooms"))?;
        self.store.dispatch(Action::ReplaceRooms(rooms.clone()));
        Ok(rooms)
    }

    pub async fn refresh_unread_counts(&self) -> Result<(), CommandError> {
        let profile = self.auth_context().await?;
        let counts = self
            .remote
            .unread_counts(profile.user_id)
            .await
            .map_err(remote_error("unread_counts"))?;
        for unread in counts {
            self.store.dispatch(Action::SetUnreadCount {
                room_id: unread.room_id,
                count: unread.count,
            });
        }
        Ok(())
    }

    fn known_message(&self, message_id: MessageId) -> Result<Message, CommandError> {
        self.store
            .snapshot()
            .find_message(message_id)
            .cloned()
            .ok_or_else(|| CommandError::Validation(format!("unknown message {message_id}")))
    }

    fn remember(&self, room_id: RoomId) {
        let snapshot = self.store.snapshot();
        if snapshot.messages.contains_key(&room_id) {
            self.cache
                .set(room_id, snapshot.room_messages(room_id).to_vec());
        }
    }
}

fn storage_path(user_id: UserId, message_id: MessageId, index: usize, filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{user_id}/{message_id}/{index}-{safe}")
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
