pub mod buffer;
pub mod connection;
pub mod decoder;
pub mod feedback;
pub mod lsn;
pub mod protocol;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{
    ensure_slot, CopyBothDuplex, CopyBothSocket, CopyChunk, CopyMessage, PgSqlClient, ReplicationTransport,
    SqlClient,
};
pub use decoder::{decode_polling_rows, decode_stream_payload, normalize_changes};
pub use feedback::{FeedbackScheduler, LsnPositions, LsnTracker, StandbyStatusUpdate};
pub use lsn::Lsn;
pub use protocol::{FrameParser, PrimaryKeepalive, ReplicationMessage, XLogData};
pub use types::*;
