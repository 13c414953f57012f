use thiserror::Error;

/// Errors surfaced by the store and its wire plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed RESP on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command could not be executed
    #[error("command error: {0}")]
    Command(String),

    /// A range argument outside the collection bounds
    #[error("index out of range: [{start}, {stop}) against size {size}")]
    IndexOutOfRange { start: i64, stop: i64, size: i64 },

    /// Bad or unreadable configuration
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
