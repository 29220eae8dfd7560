//! Core data types for change capture
//!
//! This module holds the log position type ([`Lsn`]) and its textual helpers,
//! PostgreSQL epoch conversions used by the replication protocol, and the
//! change model shared by the snapshotter, the replication session and the
//! change filter.

use crate::error::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// PostgreSQL constants
/// Seconds from Unix epoch (1970-01-01) to PostgreSQL epoch (2000-01-01)
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;
/// Invalid/zero LSN pointer
pub const INVALID_XLOG_REC_PTR: u64 = 0;

/// Write-Ahead Log Record Pointer (64-bit LSN)
pub type XLogRecPtr = u64;
/// Object ID (32-bit)
pub type Oid = u32;
/// PostgreSQL Timestamp (microseconds since 2000-01-01)
pub type TimestampTz = i64;

/// Pads and aligns a value to the length of a cache line to reduce false sharing.
#[derive(Debug)]
#[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
#[cfg_attr(not(any(target_arch = "x86_64", target_arch = "aarch64")), repr(align(64)))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Convert SystemTime to PostgreSQL timestamp format (microseconds since 2000-01-01)
///
/// Times before the Unix epoch are clamped to it.
///
/// # Example
///
/// ```
/// use pg_capture::system_time_to_postgres_timestamp;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let y2k = UNIX_EPOCH + Duration::from_secs(946_684_800);
/// assert_eq!(system_time_to_postgres_timestamp(y2k), 0);
/// ```
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);

    let unix_micros =
        since_unix.as_secs() as i64 * 1_000_000 + i64::from(since_unix.subsec_micros());

    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert PostgreSQL timestamp (microseconds since 2000-01-01) into `chrono::DateTime<Utc>`.
///
/// Returns `None` when the value is outside chrono's representable range.
pub fn postgres_timestamp_to_chrono(ts: TimestampTz) -> Option<chrono::DateTime<chrono::Utc>> {
    let unix_micros = ts.checked_add(PG_EPOCH_OFFSET_SECS * 1_000_000)?;
    chrono::DateTime::from_timestamp_micros(unix_micros)
}

/// Parse LSN from string format (e.g., "0/12345678")
///
/// PostgreSQL represents an LSN as two 32-bit hexadecimal numbers separated
/// by a slash.
///
/// # Example
///
/// ```
/// use pg_capture::parse_lsn;
///
/// let lsn = parse_lsn("16/B374D848").unwrap();
/// assert_eq!(lsn, 0x16B374D848);
///
/// let lsn = parse_lsn("0/0").unwrap();
/// assert_eq!(lsn, 0);
/// ```
pub fn parse_lsn(lsn_str: &str) -> Result<XLogRecPtr> {
    let (high, low) = lsn_str.trim().split_once('/').ok_or_else(|| {
        CaptureError::config(format!(
            "Invalid LSN format: {lsn_str}. Expected format: high/low"
        ))
    })?;

    let high = u32::from_str_radix(high, 16)
        .map_err(|e| CaptureError::config(format!("Invalid LSN high part: {e}")))?;
    let low = u32::from_str_radix(low, 16)
        .map_err(|e| CaptureError::config(format!("Invalid LSN low part: {e}")))?;

    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Format LSN as string (e.g., "0/12345678")
///
/// # Example
///
/// ```
/// use pg_capture::format_lsn;
///
/// assert_eq!(format_lsn(0x16B374D848), "16/B374D848");
/// assert_eq!(format_lsn(0), "0/0");
/// ```
pub fn format_lsn(lsn: XLogRecPtr) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// LSN (Log Sequence Number) representation
///
/// Totally ordered; the textual form is the canonical `high/low` hex pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(INVALID_XLOG_REC_PTR);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_XLOG_REC_PTR
    }
}

impl std::str::FromStr for Lsn {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        parse_lsn(s).map(Self)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_lsn(self.0))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// Positions travel as "X/X" text, matching what the server prints.
impl Serialize for Lsn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_lsn(self.0))
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_lsn(&text).map(Lsn).map_err(serde::de::Error::custom)
    }
}

/// Snapshot action requested when a logical slot is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Export a snapshot usable by `SET TRANSACTION SNAPSHOT`
    Export,
    /// Do not export a snapshot
    NoExport,
    /// Use the snapshot in the current transaction
    Use,
}

impl SnapshotAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotAction::Export => "export",
            SnapshotAction::NoExport => "nothing",
            SnapshotAction::Use => "use",
        }
    }
}

/// Options for creating replication slots
#[derive(Debug, Clone, Default)]
pub struct ReplicationSlotOptions {
    /// Create a temporary slot that is dropped at the end of the session
    pub temporary: bool,
    /// What to do with the snapshot created together with the slot
    pub snapshot: Option<SnapshotAction>,
}

/// Result of `CREATE_REPLICATION_SLOT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSlot {
    pub slot_name: String,
    /// First position from which the slot streams
    pub consistent_point: Lsn,
    /// Exported snapshot identifier, when one was requested
    pub snapshot_name: Option<String>,
    pub output_plugin: Option<String>,
}

/// Operation kind of a `change` entry
///
/// wal2json also emits entries that are not row changes, such as
/// transactional `pg_logical_emit_message()` output; those decode as
/// [`ChangeKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Other => "other",
        }
    }

    /// `true` for insert, update and delete
    pub fn is_row_change(&self) -> bool {
        !matches!(self, ChangeKind::Other)
    }
}

impl<'de> Deserialize<'de> for ChangeKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(match kind.as_str() {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "delete" => ChangeKind::Delete,
            _ => ChangeKind::Other,
        })
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key columns of the pre-image, as captured by the replica identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OldKeys {
    #[serde(rename = "keynames", default)]
    pub key_names: Vec<String>,
    #[serde(rename = "keytypes", default)]
    pub key_types: Vec<String>,
    #[serde(rename = "keyvalues", default)]
    pub key_values: Vec<serde_json::Value>,
}

/// One row-level change
///
/// Field names on the wire follow the wal2json format-version-1 layout.
/// Values are kept in their wire form; [`crate::convert::TypeConverter`]
/// interprets them using `column_types`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(rename = "columnnames", default)]
    pub column_names: Vec<String>,
    #[serde(rename = "columntypes", default)]
    pub column_types: Vec<String>,
    #[serde(rename = "columnvalues", default)]
    pub column_values: Vec<serde_json::Value>,
    #[serde(rename = "oldkeys", default, skip_serializing_if = "Option::is_none")]
    pub old_keys: Option<OldKeys>,
}

impl ChangeRecord {
    /// Build a synthetic insert, as produced by the snapshotter
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        column_names: Vec<String>,
        column_types: Vec<String>,
        column_values: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            kind: ChangeKind::Insert,
            schema: schema.into(),
            table: table.into(),
            column_names,
            column_types,
            column_values,
            old_keys: None,
        }
    }

    /// `true` when names, types and values line up one to one
    pub fn is_consistent(&self) -> bool {
        self.column_names.len() == self.column_types.len()
            && self.column_names.len() == self.column_values.len()
    }

    /// Old-key value and new value of `column`, when present
    pub fn value(&self, column: &str) -> (Option<&serde_json::Value>, Option<&serde_json::Value>) {
        let new = self
            .column_names
            .iter()
            .position(|name| name == column)
            .and_then(|i| self.column_values.get(i));

        let old = self.old_keys.as_ref().and_then(|keys| {
            keys.key_names
                .iter()
                .position(|name| name == column)
                .and_then(|i| keys.key_values.get(i))
        });

        (old, new)
    }

    /// Qualified `schema.table` name
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// An ordered group of changes sharing one log position
///
/// Snapshot rows carry no position. A batch with a position and no records is
/// a heartbeat: the log moved but nothing relevant happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(rename = "lsn", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Lsn>,
    #[serde(rename = "change", default)]
    pub records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    pub fn new(position: Option<Lsn>, records: Vec<ChangeRecord>) -> Self {
        Self { position, records }
    }

    pub fn heartbeat(position: Lsn) -> Self {
        Self {
            position: Some(position),
            records: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.position.is_some() && self.records.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_lsn() {
        assert_eq!(format_lsn(0), "0/0");
        assert_eq!(format_lsn(0x1_0000_0000), "1/0");
        assert_eq!(format_lsn(0x16B374D848), "16/B374D848");
    }

    #[test]
    fn test_parse_lsn() {
        assert_eq!(parse_lsn("0/0").unwrap(), 0);
        assert_eq!(parse_lsn("16/B374D848").unwrap(), 0x16B374D848);
        assert_eq!(parse_lsn(" 0/1A ").unwrap(), 0x1A);
        assert!(parse_lsn("16B374D848").is_err());
        assert!(parse_lsn("G/0").is_err());
        assert!(parse_lsn("1/2/3").is_err());
        assert!(parse_lsn("100000000/0").is_err());
    }

    #[test]
    fn test_lsn_roundtrip_and_order() {
        let lsn: Lsn = "2/A0".parse().unwrap();
        assert_eq!(lsn.to_string(), "2/A0");
        assert!(lsn > "1/FFFFFFFF".parse().unwrap());
        assert!(!Lsn::INVALID.is_valid());
        assert!(lsn.is_valid());
    }

    #[test]
    fn test_lsn_serde_as_text() {
        let value = serde_json::to_value(Lsn(0x16B374D848)).unwrap();
        assert_eq!(value, json!("16/B374D848"));
        let back: Lsn = serde_json::from_value(value).unwrap();
        assert_eq!(back, Lsn(0x16B374D848));
        assert!(serde_json::from_value::<Lsn>(json!("oops")).is_err());
    }

    #[test]
    fn test_postgres_epoch_conversions() {
        let y2k = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS as u64);
        assert_eq!(system_time_to_postgres_timestamp(y2k), 0);
        assert_eq!(
            system_time_to_postgres_timestamp(UNIX_EPOCH),
            -PG_EPOCH_OFFSET_SECS * 1_000_000
        );

        let dt = postgres_timestamp_to_chrono(1_500_000).unwrap();
        assert_eq!(dt.to_rfc3339(), "2000-01-01T00:00:01.500+00:00");
    }

    #[test]
    fn test_wal2json_record_deserialize() {
        let payload = json!({
            "kind": "update",
            "schema": "public",
            "table": "orders",
            "columnnames": ["id", "status"],
            "columntypes": ["integer", "text"],
            "columnvalues": [5, "shipped"],
            "oldkeys": {"keynames": ["id"], "keytypes": ["integer"], "keyvalues": [5]}
        });

        let record: ChangeRecord = serde_json::from_value(payload).unwrap();
        assert_eq!(record.kind, ChangeKind::Update);
        assert!(record.is_consistent());
        assert_eq!(record.full_table_name(), "public.orders");

        let (old, new) = record.value("status");
        assert_eq!(old, None);
        assert_eq!(new, Some(&json!("shipped")));

        let (old, new) = record.value("id");
        assert_eq!(old, Some(&json!(5)));
        assert_eq!(new, Some(&json!(5)));
    }

    #[test]
    fn test_delete_record_without_columns() {
        let payload = json!({
            "kind": "delete",
            "schema": "public",
            "table": "orders",
            "oldkeys": {"keynames": ["id"], "keytypes": ["integer"], "keyvalues": [5]}
        });

        let record: ChangeRecord = serde_json::from_value(payload).unwrap();
        assert_eq!(record.kind, ChangeKind::Delete);
        assert!(record.column_values.is_empty());
        assert_eq!(record.old_keys.unwrap().key_names, vec!["id"]);
    }

    #[test]
    fn test_non_row_kinds_decode_as_other() {
        let message = json!({
            "kind": "message", "transactional": true, "prefix": "heartbeat", "content": "x"
        });
        let record: ChangeRecord = serde_json::from_value(message).unwrap();
        assert_eq!(record.kind, ChangeKind::Other);
        assert!(!record.kind.is_row_change());
        assert!(record.schema.is_empty() && record.table.is_empty());

        let truncate = json!({"kind": "truncate", "schema": "public", "table": "orders"});
        let record: ChangeRecord = serde_json::from_value(truncate).unwrap();
        assert_eq!(record.kind, ChangeKind::Other);

        assert!(serde_json::from_value::<ChangeRecord>(json!({"kind": 7})).is_err());
    }

    #[test]
    fn test_change_batch_heartbeat() {
        let beat = ChangeBatch::heartbeat(Lsn(42));
        assert!(beat.is_heartbeat());
        assert!(beat.is_empty());

        let snapshot = ChangeBatch::new(
            None,
            vec![ChangeRecord::insert(
                "public",
                "orders",
                vec!["id".into()],
                vec!["int4".into()],
                vec![json!("1")],
            )],
        );
        assert!(!snapshot.is_heartbeat());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_snapshot_action_strings() {
        assert_eq!(SnapshotAction::Export.as_str(), "export");
        assert_eq!(SnapshotAction::NoExport.as_str(), "nothing");
        assert_eq!(SnapshotAction::Use.as_str(), "use");
    }
}
