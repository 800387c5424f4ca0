//! An authenticated, encrypted, connection-multiplexing TCP tunnel.
//!
//! A client accepts local connections and forwards them, multiplexed over
//! a small pool of long-lived encrypted tunnels, to named backend
//! services reachable only from the server.

pub mod authenticator;
pub mod buffer_pool;
pub mod client;
pub mod client_hub;
pub mod config;
pub mod crypto;
pub mod error;
pub mod filters;
pub mod hub;
pub mod id_allocator;
pub mod link;
pub mod packet;
pub mod pool;
pub mod server;
pub mod server_hub;
pub mod status;
pub mod tunnel;

pub use error::Error;
