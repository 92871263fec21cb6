use thiserror::Error;

use crate::store::StoreError;

/// Failure kinds surfaced to callers of the catalog API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidRange,
    Unauthenticated,
    NotFound,
    OutOfRange,
    AlreadyExists,
    Internal,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ListingError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidRange(_) => ErrorKind::InvalidRange,
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::OutOfRange(_) => ErrorKind::OutOfRange,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(m)
            | Self::InvalidRange(m)
            | Self::Unauthenticated(m)
            | Self::NotFound(m)
            | Self::OutOfRange(m)
            | Self::AlreadyExists(m)
            | Self::Internal(m) => m,
        }
    }
}

impl From<bson::de::Error> for ListingError {
    fn from(e: bson::de::Error) -> Self {
        Self::Internal(format!("bson decode: {e}"))
    }
}

impl From<bson::ser::Error> for ListingError {
    fn from(e: bson::ser::Error) -> Self {
        Self::Internal(format!("bson encode: {e}"))
    }
}

impl From<serde_json::Error> for ListingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serde json: {e}"))
    }
}

impl From<StoreError> for ListingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ResumePointLost(m) | StoreError::StartTimeOutOfRange(m) => {
                Self::OutOfRange(m)
            }
            StoreError::InvalidResumeToken(m) => Self::InvalidArgument(m),
            StoreError::DuplicateKey(m) => Self::AlreadyExists(m),
            StoreError::Timeout(m) | StoreError::Backend(m) => Self::Internal(m),
        }
    }
}
