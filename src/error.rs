use thiserror::Error;

use crate::protocol::CodecError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("upload of {size} bytes exceeds the {max}-byte limit")]
    UploadTooLarge { size: u64, max: u64 },

    #[error("no connection arrived on the {0} port in time")]
    AcceptTimeout(&'static str),

    #[error("server is shutting down")]
    ShuttingDown,
}
