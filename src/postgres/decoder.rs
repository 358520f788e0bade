use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use super::lsn::Lsn;
use super::types::{Change, ChangeKind, Operation, RawChange, RawChangeRow, RawTransaction, Row, RowOperation};
use crate::{Error, Result};

/// wal2json `include-timestamp` format, e.g. `2023-11-01 16:00:00.123456+00`.
const WAL2JSON_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Turns raw wal2json records into [`Change`]s, preserving their order.
///
/// Inserts and updates zip `columnnames` with `columnvalues`; deletes zip
/// `oldkeys.keynames` with `oldkeys.keyvalues`. Values are carried through
/// exactly as the plugin encoded them.
pub fn normalize_changes(
    lsn: &str,
    xid: Option<u64>,
    timestamp: DateTime<Utc>,
    records: Vec<RawChange>,
) -> Result<Vec<Change>> {
    records
        .into_iter()
        .map(|raw| {
            Ok(Change {
                lsn: lsn.to_string(),
                xid,
                timestamp,
                operation: normalize_record(raw)?,
            })
        })
        .collect()
}

fn normalize_record(raw: RawChange) -> Result<Operation> {
    match raw.kind {
        ChangeKind::Delete => {
            let keys = raw.oldkeys.as_ref().ok_or_else(|| Error::InvalidMessage {
                message: format!("delete on {}.{} without oldkeys", raw.schema, raw.table),
            })?;
            let parsed = zip_row(&keys.keynames, &keys.keyvalues, &raw, "oldkeys")?;
            Ok(Operation::Delete(row_operation(raw, parsed)))
        }
        ChangeKind::Insert | ChangeKind::Update => {
            let parsed = zip_row(&raw.columnnames, &raw.columnvalues, &raw, "columns")?;
            Ok(Operation::Upsert(row_operation(raw, parsed)))
        }
    }
}

fn row_operation(raw: RawChange, parsed: Row) -> RowOperation {
    RowOperation {
        kind: raw.kind,
        schema: raw.schema.clone(),
        table: raw.table.clone(),
        raw,
        parsed,
    }
}

fn zip_row(names: &[String], values: &[Value], raw: &RawChange, what: &str) -> Result<Row> {
    if names.len() != values.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "{} on {}.{} has {} {what} names but {} values",
                raw.kind,
                raw.schema,
                raw.table,
                names.len(),
                values.len()
            ),
        });
    }

    Ok(names.iter().cloned().zip(values.iter().cloned()).collect())
}

/// Decodes the wal2json payload of one XLogData message.
///
/// The server clock of the message is the change timestamp; the start
/// LSN of the message is the change LSN.
pub fn decode_stream_payload(lsn: Lsn, clock: DateTime<Utc>, payload: &[u8]) -> Result<Vec<Change>> {
    let transaction: RawTransaction = serde_json::from_slice(payload).map_err(|e| Error::InvalidMessage {
        message: format!("wal2json payload at {lsn}: {e}"),
    })?;

    trace!(%lsn, changes = transaction.change.len(), "Decoded wal2json transaction");
    normalize_changes(&lsn.to_string(), transaction.xid, clock, transaction.change)
}

/// Decodes the rows of a `pg_logical_slot_get_changes` call.
pub fn decode_polling_rows(rows: &[RawChangeRow]) -> Result<Vec<Change>> {
    let mut changes = Vec::new();

    for row in rows {
        let transaction: RawTransaction = serde_json::from_str(&row.data).map_err(|e| Error::InvalidMessage {
            message: format!("wal2json row at {}: {e}", row.lsn),
        })?;

        let timestamp = transaction
            .timestamp
            .as_deref()
            .ok_or_else(|| Error::InvalidMessage {
                message: format!("wal2json row at {} has no timestamp", row.lsn),
            })
            .and_then(parse_wal2json_timestamp)?;
        let xid = transaction.xid.or_else(|| row.xid.parse().ok());

        let lsn = Lsn::parse(&row.lsn).to_string();
        changes.extend(normalize_changes(&lsn, xid, timestamp, transaction.change)?);
    }

    if !changes.is_empty() {
        debug!(rows = rows.len(), changes = changes.len(), "Normalized polled rows");
    }
    Ok(changes)
}

pub fn parse_wal2json_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(text, WAL2JSON_TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::InvalidMessage {
            message: format!("invalid wal2json timestamp {text:?}: {e}"),
        })
}
