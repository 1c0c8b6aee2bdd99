//! Transparent rich presence IPC proxy.
//!
//! Sits on the service's well-known socket path, relays every byte between
//! clients and the real service (when one is running), and records the latest
//! `SET_ACTIVITY` presence per client process id in a [`PresenceStore`] that
//! other threads can query.

pub mod config;
pub mod connection;
pub mod error;
pub mod hijack;
pub mod presence;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use hijack::{socket_alive, SocketPaths};
pub use presence::{PresenceEntry, PresenceStore};
pub use proxy::{shutdown_channel, ProxyState, ShutdownHandle, ShutdownSignal};
