mod error;
pub mod services;
pub mod state;

pub use error::{ChatlineError, Result};
pub use services::chat_types::{
    Author, CacheEvent, Connectivity, DeliveryStatus, Draft, GeoPoint, Message, MessageBody,
    MessageOrigin, Reaction, Snapshot, SyncSignal, WireMessage,
};
pub use services::{
    AppConfig, ConfigService, FileStorage, LocalStorage, LoopbackBackend, MemoryStorage,
    MessageSyncCache, RemoteBackend, SyncSession, SyncSettings,
};
pub use state::SyncContext;

/// Install the `env_logger` backend. `RUST_LOG` wins over `level`.
/// Safe to call more than once.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}
