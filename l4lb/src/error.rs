use thiserror::Error;

use crate::config::RealServer;

pub type Result<T> = std::result::Result<T, Error>;

/// Fieldless classification of [`Error`], for callers that only branch on
/// what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoBackends,
    TooManyBackends,
    DuplicateBackend,
    InvalidTableSize,
    TableTooSmall,
    AssignmentFailed,
    UnroutableFlow,
    MalformedFlowKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no backends configured")]
    NoBackends,
    #[error("{count} backends exceeds the maximum of {max}")]
    TooManyBackends { count: usize, max: usize },
    #[error("backend {0} is listed more than once")]
    DuplicateBackend(RealServer),
    #[error("lookup table size {0} is not a prime in 2..=1048592")]
    InvalidTableSize(u32),
    #[error("lookup table of {table_size} slots cannot hold {backends} backends")]
    TableTooSmall { backends: usize, table_size: u32 },
    #[error("backend {backend} exhausted its permutation with {filled}/{table_size} slots filled")]
    AssignmentFailed {
        backend: RealServer,
        filled: usize,
        table_size: u32,
    },
    #[error("no backend available for flow")]
    UnroutableFlow,
    #[error("malformed flow key: {0}")]
    MalformedFlowKey(&'static str),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoBackends => ErrorKind::NoBackends,
            Error::TooManyBackends { .. } => ErrorKind::TooManyBackends,
            Error::DuplicateBackend(_) => ErrorKind::DuplicateBackend,
            Error::InvalidTableSize(_) => ErrorKind::InvalidTableSize,
            Error::TableTooSmall { .. } => ErrorKind::TableTooSmall,
            Error::AssignmentFailed { .. } => ErrorKind::AssignmentFailed,
            Error::UnroutableFlow => ErrorKind::UnroutableFlow,
            Error::MalformedFlowKey(_) => ErrorKind::MalformedFlowKey,
        }
    }

    /// Packet-path errors mean "pass the packet through unmodified". Every
    /// other kind rejects a whole generation.
    pub fn is_packet_path(&self) -> bool {
        matches!(self, Error::UnroutableFlow | Error::MalformedFlowKey(_))
    }
}
