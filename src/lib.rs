pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod transfer;
pub mod types;

pub use config::ServerConfig;
pub use error::RelayError;
pub use message::Message;
pub use protocol::MessageCodec;
pub use server::{Ports, Server, ServerState};
