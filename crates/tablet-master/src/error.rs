//! Error types of the tablet control plane
//!
//! Validation and resource errors are returned synchronously to the caller and
//! guarantee that no state was mutated. Stale notifications are never errors;
//! they are logged and dropped by the notification handlers.

/// Tablet manager error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request (bad range, bad pivots, bad counts)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// An object is not in the state the request requires
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Unknown id or path
    #[error("No such {kind} {id}")]
    NoSuchObject { kind: &'static str, id: String },
    /// Object with the same identity already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Not enough healthy resources to serve the request
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// Configured limit would be exceeded
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
}

impl Error {
    pub fn no_such(kind: &'static str, id: impl ToString) -> Self {
        Error::NoSuchObject {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
