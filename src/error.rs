//! Errors reported while configuring an [`AddrCache`](crate::AddrCache).

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when constructing a cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested capacity or concurrency level was zero.
    #[error("capacity {capacity} and concurrency {concurrency} must be > 0")]
    InvalidConfiguration { capacity: u32, concurrency: u32 },
}
