pub mod checkpoint;
pub mod config;
pub mod error;
pub mod polling;
pub mod replicator;
pub mod streaming;

pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use polling::{PollingHandle, PollingOptions, PollingReplication};
pub use postgres::{Change, ChangeKind, CopyBothSocket, Lsn, Operation, PgSqlClient, ReplicationTransport, SqlClient};
pub use replicator::Replicator;
pub use streaming::{StreamingHandle, StreamingOptions, StreamingReplication};
