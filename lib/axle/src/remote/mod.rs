//! Instance-level sharing: one remote server per provided service instance,
//! deduplicated process-wide by the remote server manager.

pub mod manager;
pub mod server;

pub use self::manager::RemoteServerManager;
pub use self::server::RemoteServer;
