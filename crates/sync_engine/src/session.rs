use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{MessageId, RoomId},
    protocol::{Attachment, Message, Room, UserProfile},
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    cache::MessageCache,
    channel::{ChannelError, EventChannelAdapter},
    commands::{
        CommandError, CommandPipeline, CreateRoomRequest, OutgoingFile, ProgressCallback,
    },
    connection::ReconnectionController,
    multiplexer::SubscriptionMultiplexer,
    remote::{HttpRemoteStore, RemoteStore},
    settings::SyncSettings,
    store::{Action, ChatSnapshot, ConnectionState, StateStore},
    transport::{PushTransport, WsPushTransport},
};

pub struct ChatSession {
    store: Arc<StateStore>,
    cache: Arc<MessageCache>,
    controller: Arc<ReconnectionController>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    commands: CommandPipeline,
}

impl ChatSession {
    pub fn new(
        settings: &SyncSettings,
        remote: Arc<dyn RemoteStore>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let store = Arc::new(StateStore::new());
        let cache = Arc::new(MessageCache::new(settings.cache_bound()));
        let adapter = Arc::new(EventChannelAdapter::new(transport));
        let controller =
            ReconnectionController::new(Arc::clone(&adapter), settings.reconnect_config());
        let options = settings.command_options();
        let multiplexer = SubscriptionMultiplexer::new(
            Arc::clone(&adapter),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&remote),
            settings.typing_ttl(),
            options.page_size,
        );
        let commands = CommandPipeline::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            remote,
            adapter,
            Arc::clone(&multiplexer),
            options,
        );
        Self {
            store,
            cache,
            controller,
            multiplexer,
            commands,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        let remote = HttpRemoteStore::new(
            settings.remote_url.clone(),
            settings.access_token.clone(),
            settings.request_timeout(),
        )?;
        let transport = WsPushTransport::new(settings.push_url(), settings.access_token.clone());
        Ok(Self::new(settings, Arc::new(remote), Arc::new(transport)))
    }

    /// Resolves the signed-in user, then connects the push channel. A failed
    /// connect is returned and recorded in the snapshot; it is not retried.
    pub async fn start(&self) -> Result<UserProfile, CommandError> {
        let profile = self.commands.auth_context().await?;
        self.multiplexer.start(self.controller.subscribe());
        self.controller.start().await?;
        if let Err(err) = self.commands.refresh_rooms().await {
            warn!(%err, "initial room list unavailable");
        }
        if let Err(err) = self.commands.refresh_unread_counts().await {
            warn!(%err, "initial unread counts unavailable");
        }
        info!(user_id = %profile.user_id, "chat session started");
        Ok(profile)
    }

    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
        self.controller.shutdown().await;
        self.store
            .dispatch(Action::SetConnection(ConnectionState::default()));
        info!("chat session stopped");
    }

    pub fn snapshot(&self) -> Arc<ChatSnapshot> {
        self.store.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ChatSnapshot>> {
        self.store.watch()
    }

    pub fn dispatch(&self, action: Action) {
        self.store.dispatch(action);
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.controller.connection_state().await
    }

    pub async fn reconnect_now(&self) -> Result<(), ChannelError> {
        self.controller.reconnect_now().await
    }

    pub async fn send_message(
        &self,
        body: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Message, CommandError> {
        self.commands.send_message(body, files).await
    }

    pub async fn send_message_with_progress(
        &self,
        body: &str,
        files: Vec<OutgoingFile>,
        progress: &ProgressCallback,
    ) -> Result<Message, CommandError> {
        self.commands
            .send_message_with_progress(body, files, progress)
            .await
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
    ) -> Result<Message, CommandError> {
        self.commands.edit_message(message_id, body).await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), CommandError> {
        self.commands.delete_message(message_id).await
    }

    pub async fn join_room(&self, room_id: RoomId) -> Result<Room, CommandError> {
        self.commands.join_room(room_id).await
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), CommandError> {
        self.commands.leave_room(room_id).await
    }

    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, CommandError> {
        self.commands.create_room(request).await
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), CommandError> {
        self.commands.set_typing(typing).await
    }

    pub fn set_reply_target(&self, target: Option<MessageId>) -> Result<(), CommandError> {
        self.commands.set_reply_target(target)
    }

    pub async fn load_older_messages(&self) -> Result<usize, CommandError> {
        self.commands.load_older_messages().await
    }

    pub async fn fetch_attachments(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Attachment>, CommandError> {
        self.commands.fetch_attachments(message_id).await
    }

    pub async fn refresh_rooms(&self) -> Result<Vec<Room>, CommandError> {
        self.commands.refresh_rooms().await
    }

    pub async fn refresh_unread_counts(&self) -> Result<(), CommandError> {
        self.commands.refresh_unread_counts().await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
