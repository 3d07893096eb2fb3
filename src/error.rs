//! Cache error types

use std::error::Error as StdError;
use std::sync::Arc;

use redis::RedisError;

/// Boxed error returned by origin fetch functions and stores.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared error handed to every waiter of a coalesced fetch.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Cache-related errors
///
/// Cloneable so that a single fetch result can be fanned out to every
/// coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The origin fetch function failed. Displayed verbatim.
    #[error("{0}")]
    Origin(SharedError),

    #[error("Distributed store error: {0}")]
    Store(SharedError),

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("Fetch was cancelled or panicked")]
    Cancelled,

    #[error("Not found")]
    NotFound,

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Wrap an origin error.
    pub fn origin<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Origin(Arc::from(err.into()))
    }

    /// The error the origin fetch function returned, if this is an origin failure.
    ///
    /// Use `downcast_ref` on the result to recover the caller's own type.
    pub fn origin_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Origin(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, Self::Origin(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        Self::Store(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}
