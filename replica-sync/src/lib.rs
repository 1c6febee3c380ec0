//! # replica-sync: Replicated observable key-value stores
//!
//! Keeps named, schema-less values consistent across processes. Values live
//! in observable stores; a relay mirrors two stores without echo loops; the
//! directory protocol lets peers create and retire values at runtime over a
//! topic-scoped pub/sub transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄────────────────► │ SyncServer   │
//! │ (Transport)  │    Binary Proto    │              │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Directory    │                    │ Hub          │
//! │ (per topic)  │                    │ TopicRoom    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Observable   │                    │ Observable   │
//! │ Store        │                    │ Store        │
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! In-process peers skip the socket: [`hub::LocalTransport`] plugs a
//! [`directory::Directory`] straight into a shared [`hub::Hub`].
//!
//! ## Modules
//!
//! - [`scheduler`]: FIFO queue of completion-signalled tasks
//! - [`store`]: Observable key-value store with optional debounce
//! - [`origin`]: Origin-tagged values and named stores
//! - [`relay`]: Two-way mirror between named stores
//! - [`envelope`]: Active/passive envelopes and reserved sentinels
//! - [`transport`]: Topic channel abstraction
//! - [`directory`]: Dynamic set of named observables per topic
//! - [`hub`]: Server-side topic state and in-process transport
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod scheduler;
pub mod store;
pub mod origin;
pub mod relay;
pub mod envelope;
pub mod transport;
pub mod directory;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use scheduler::{Done, Scheduler};
pub use store::{ObservableStore, SubscriptionId};
pub use origin::{NamedStore, Tagged};
pub use relay::Relay;
pub use envelope::{Envelope, Mode, DIRECTORY_ID, IMMORTAL_PREFIX, POISON_PILL};
pub use transport::{
    ChannelListener, ChannelRegistry, ConnectionEvent, ListenerId, Push, PushAction, Transport,
    TransportError,
};
pub use directory::{Directory, DirectoryConfig, DirectoryError, ObserverId, Snapshot};
pub use hub::{Hub, HubConfig, HubStats, LocalTransport};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient};
