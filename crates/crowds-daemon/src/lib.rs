//! crowds-daemon library: the networked side of the overlay.
//!
//! The binary is a thin shell over these modules, which are also what the
//! integration tests drive.

pub mod config;
pub mod console;
pub mod directory;
pub mod forwarder;
pub mod server;
pub mod session;
pub mod transport;

// Re-export key types for convenience
pub use config::{BlenderConfig, Cli, ConfigError, JondoConfig, NodeConfig};
pub use directory::Directory;
pub use forwarder::{Forwarder, JoinError};
pub use server::{ConnectionHandler, MessageHandler, Server, ShutdownHandle};
pub use session::{ForwarderEvent, Session, VoteError};
pub use transport::{LineConnection, TransportError};
