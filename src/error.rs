use std::io;
use thiserror::Error;

/// Result type for engine and file-handle operations
pub type Result<T> = std::result::Result<T, Error>;

const EAGAIN: i32 = 11;
const EINVAL: i32 = 22;
const ESPIPE: i32 = 29;
const EIO: i32 = 5;

/// Errors reported by the bus driver collaborator
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("unsupported bus frequency: {0} Hz")]
    UnsupportedFrequency(u32),
    #[error("unsupported frame format: {bits} bits, mode {mode}")]
    UnsupportedFormat { bits: u8, mode: u8 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No data (or no room) right now and the handle is non-blocking
    #[error("operation would block")]
    WouldBlock,
    /// The handle is a stream device, positions are meaningless
    #[error("stream device is not seekable")]
    NotSeekable,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl Error {
    /// Negative POSIX error code, as a file-handle layer would report it.
    pub fn errno(&self) -> i32 {
        match self {
            Error::WouldBlock => -EAGAIN,
            Error::NotSeekable => -ESPIPE,
            Error::InvalidConfig(_) => -EINVAL,
            Error::Bus(_) => -EIO,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::NotSeekable => io::ErrorKind::Unsupported,
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::Bus(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
