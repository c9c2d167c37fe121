use thiserror::Error;

/// Errors from setting up or using a transmitter or receiver.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket creation, bind, group join or send failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid universe {0} (must be 1-63999)")]
    InvalidUniverse(u16),

    /// The transmitter was closed and no longer owns a socket
    #[error("transmitter closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, NetError>;
