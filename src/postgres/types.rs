use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Flat column-name to value mapping of one row.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// Old replica-identity key of an updated or deleted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldKeys {
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keytypes: Vec<String>,
    pub keyvalues: Vec<Value>,
}

/// One entry of a wal2json `change` array, exactly as the plugin sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columntypes: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<OldKeys>,
    /// Fields without a typed view (`pk`, `columntypeoids`, `typmod`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One wal2json (format version 1) transaction document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub xid: Option<u64>,
    /// Present when the slot was read with `include-timestamp`.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub change: Vec<RawChange>,
}

/// One row returned by `pg_logical_slot_get_changes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChangeRow {
    pub lsn: String,
    pub xid: String,
    pub data: String,
}

/// A normalized row operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowOperation {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// The untouched plugin record, for callers needing column types.
    pub raw: RawChange,
    pub parsed: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Operation {
    /// Insert or update; `parsed` holds the new column values.
    Upsert(RowOperation),
    /// Delete; `parsed` holds the old key values.
    Delete(RowOperation),
}

impl Operation {
    pub fn row(&self) -> &RowOperation {
        match self {
            Operation::Upsert(row) | Operation::Delete(row) => row,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.row().kind
    }

    pub fn schema(&self) -> &str {
        &self.row().schema
    }

    pub fn table(&self) -> &str {
        &self.row().table
    }

    pub fn parsed(&self) -> &Row {
        &self.row().parsed
    }

    pub fn raw(&self) -> &RawChange {
        &self.row().raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub lsn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
}
