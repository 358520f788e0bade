//! Error types and result handling for pg-logical-cdc.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_logical_cdc::{Error, Result};
//!
//! fn start_twice() -> Result<()> {
//!     Err(Error::Lifecycle("replication already started".to_string()))
//! }
//!
//! match start_twice() {
//!     Ok(()) => println!("Started"),
//!     Err(Error::Lifecycle(msg)) => eprintln!("Lifecycle error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-logical-cdc operations.
///
/// Fatal variants (`Protocol`, `Replication`, `Io`, `Postgres`) are only
/// returned after the owning engine has closed its connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or option validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error from a SQL collaborator query.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON error while decoding a wal2json payload or encoding a change.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the replication socket or checkpoint file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed or unusable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Corrupt replication copy-stream (unknown tag, truncated frame).
    ///
    /// The stream is not resynchronised after this error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server refused or aborted replication.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// A wal2json record did not have the expected shape.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// An engine operation was called in the wrong lifecycle state,
    /// e.g. `start()` twice or `stop()` before `start()`.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

/// A convenient Result type alias for pg-logical-cdc operations.
///
/// This is equivalent to `std::result::Result<T, pg_logical_cdc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
