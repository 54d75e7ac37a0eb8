//! Client side of the gateway: connection lifecycle, local presence view,
//! typing indicators and session propagation between instances.

pub mod config;
pub mod error;
pub mod manager;
pub mod notifier;
pub mod read_model;
pub mod storage;
pub mod transport;
pub mod typing;

pub use config::ClientConfig;
pub use error::ConnectError;
pub use manager::{ConnectionManager, ConnectionState};
pub use notifier::{CrossInstanceNotifier, SessionRecord, SESSION_KEY};
pub use read_model::ReadModel;
pub use storage::{FileStorage, MemoryStorage, SharedStorage, StorageChange, StorageError};
pub use transport::{Connector, Session, WsConnector};
pub use typing::{EventSink, TypingTracker};
