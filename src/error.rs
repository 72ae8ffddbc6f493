//! Error types for oprpc.

use std::fmt;

/// Error type for transport operations.
#[derive(Debug)]
pub enum Error {
    /// A message grew past the per-message packet budget.
    MessageTooLarge { size: usize, max: usize },
    /// A packet payload is too short to hold the expected header.
    BufferTooSmall { required: usize, available: usize },
    /// A packet carried an opcode this transport does not recognize.
    InvalidOpcode(u8),
    /// An address string or raw address could not be resolved by the driver.
    InvalidAddress(String),
    /// The message header region is not available (first packet missing).
    MissingHeader,
    /// The operation is only valid on server ops.
    NotServerOp,
    /// The op has no inbound message bound to it.
    NoInboundMessage,
    /// The driver failed to carry out a send or receive.
    Driver(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::BufferTooSmall { required, available } => {
                write!(
                    f,
                    "Buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::InvalidOpcode(op) => write!(f, "Invalid opcode: {:#x}", op),
            Error::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
            Error::MissingHeader => write!(f, "Message header region is not available"),
            Error::NotServerOp => write!(f, "Operation is only valid on server ops"),
            Error::NoInboundMessage => write!(f, "Op has no inbound message"),
            Error::Driver(msg) => write!(f, "Driver error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
