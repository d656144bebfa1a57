// Service layer - trait-based seams for the backend and local storage

pub mod chat_backend;
pub mod chat_delivery_queue;
pub mod chat_listeners;
pub mod chat_message_store;
pub mod chat_persistence;
pub mod chat_service;
pub mod chat_session;
pub mod chat_types;
pub mod config;

pub use chat_backend::{FeedStream, LoopbackBackend, RemoteBackend};
pub use chat_listeners::Unsubscribe;
pub use chat_persistence::{FileStorage, LocalStorage, MemoryStorage};
pub use chat_service::{ConnectivityChange, MessageSyncCache, SendOutcome};
pub use chat_session::SyncSession;
pub use config::{AppConfig, ConfigService, SyncSettings};
