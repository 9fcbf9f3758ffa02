pub mod cache;
pub mod channel;
pub mod commands;
pub mod connection;
pub mod multiplexer;
pub mod remote;
pub mod session;
pub mod settings;
pub mod store;
pub mod transport;

pub use cache::MessageCache;
pub use channel::{
    ChannelError, ChannelLifecycle, EventChannelAdapter, RawEvent, SubscriptionHandle,
};
pub use commands::{
    CommandError, CommandOptions, CommandPipeline, CreateRoomRequest, OutgoingFile,
    RoomCreationPolicy, UploadProgress, UploadStage,
};
pub use connection::{
    BackoffPolicy, ConnectionTransition, ReconnectConfig, ReconnectionController,
};
pub use multiplexer::SubscriptionMultiplexer;
pub use remote::{HttpRemoteStore, RemoteStore};
pub use session::ChatSession;
pub use settings::{load_settings, load_settings_from, SettingsError, SyncSettings};
pub use store::{Action, ChatSnapshot, ConnectionState, ConnectionStatus, StateStore};
pub use transport::{MissingPushTransport, PushTransport, WsPushTransport};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
