//! Streaming replication messages and the wal2json payload
//!
//! Once `START_REPLICATION` succeeds the server talks CopyBoth. Each CopyData
//! carries one of:
//!
//! - `w` XLogData: `wal_start (u64) | wal_end (u64) | send_time (i64) | payload`
//! - `k` primary keepalive: `wal_end (u64) | send_time (i64) | reply_requested (u8)`
//!
//! and the client answers with `r` standby status updates:
//! `write (u64) | flush (u64) | apply (u64) | client_time (i64) | reply_requested (u8)`.
//!
//! See <https://www.postgresql.org/docs/current/protocol-replication.html>.
//!
//! The XLogData payload produced by wal2json (format version 1) is a single JSON
//! object per transaction: `{"change": [ ... ]}`.

use crate::buffer::{BufferReader, BufferWriter};
use crate::error::{CaptureError, Result};
use crate::types::{ChangeRecord, TimestampTz, XLogRecPtr};
use bytes::Bytes;
use serde::Deserialize;

/// Message type tags
pub mod message_types {
    pub const XLOG_DATA: u8 = b'w';
    pub const PRIMARY_KEEPALIVE: u8 = b'k';
    pub const STANDBY_STATUS_UPDATE: u8 = b'r';
}

const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
const STANDBY_STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Primary keepalive message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveMessage {
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// XLogData message carrying one decoded transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogDataMessage {
    pub wal_start: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub data: Bytes,
}

impl XLogDataMessage {
    /// Position right after this message's payload
    #[inline]
    pub fn end_position(&self) -> XLogRecPtr {
        self.wal_start.saturating_add(self.data.len() as u64)
    }
}

/// A CopyData message received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData(XLogDataMessage),
    Keepalive(KeepaliveMessage),
    Unknown(u8),
}

/// Parse a primary keepalive message, including its `k` tag
pub fn parse_keepalive_message(data: &[u8]) -> Result<KeepaliveMessage> {
    if data.len() < KEEPALIVE_LEN {
        return Err(CaptureError::protocol(format!(
            "Keepalive message too short: {} bytes",
            data.len()
        )));
    }

    let mut reader = BufferReader::new(data);
    reader.skip_message_type()?;

    Ok(KeepaliveMessage {
        wal_end: reader.read_u64()?,
        send_time: reader.read_i64()?,
        reply_requested: reader.read_u8()? != 0,
    })
}

/// Parse an XLogData message, including its `w` tag
pub fn parse_xlog_data(data: Vec<u8>) -> Result<XLogDataMessage> {
    if data.len() < XLOG_DATA_HEADER_LEN {
        return Err(CaptureError::protocol(format!(
            "WAL message too short: {} bytes",
            data.len()
        )));
    }

    let mut reader = BufferReader::from_vec(data);
    reader.skip_message_type()?;

    let wal_start = reader.read_u64()?;
    let wal_end = reader.read_u64()?;
    let send_time = reader.read_i64()?;

    Ok(XLogDataMessage {
        wal_start,
        wal_end,
        send_time,
        data: reader.read_remaining(),
    })
}

/// Classify and parse one CopyData message
pub fn parse_replication_message(data: Vec<u8>) -> Result<ReplicationMessage> {
    let tag = *data
        .first()
        .ok_or_else(|| CaptureError::protocol("Empty replication message"))?;

    match tag {
        message_types::XLOG_DATA => parse_xlog_data(data).map(ReplicationMessage::XLogData),
        message_types::PRIMARY_KEEPALIVE => {
            parse_keepalive_message(&data).map(ReplicationMessage::Keepalive)
        }
        other => Ok(ReplicationMessage::Unknown(other)),
    }
}

/// Build a standby status update (`r`) message
pub fn build_standby_status_update(
    write_lsn: XLogRecPtr,
    flush_lsn: XLogRecPtr,
    apply_lsn: XLogRecPtr,
    client_time: TimestampTz,
    reply_requested: bool,
) -> Result<Bytes> {
    let mut buffer = BufferWriter::with_capacity(STANDBY_STATUS_UPDATE_LEN);

    buffer.write_u8(message_types::STANDBY_STATUS_UPDATE)?;
    buffer.write_u64(write_lsn)?;
    buffer.write_u64(flush_lsn)?;
    buffer.write_u64(apply_lsn)?;
    buffer.write_i64(client_time)?;
    buffer.write_u8(u8::from(reply_requested))?;

    Ok(buffer.freeze())
}

#[derive(Debug, Deserialize)]
struct Wal2JsonTransaction {
    #[serde(default)]
    change: Vec<ChangeRecord>,
}

/// Decode one wal2json format-version-1 transaction
///
/// An empty payload decodes to no changes. Anything that is not a valid
/// transaction object is a [`CaptureError::Decode`].
pub fn decode_wal2json(payload: &[u8]) -> Result<Vec<ChangeRecord>> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    serde_json::from_slice::<Wal2JsonTransaction>(payload)
        .map(|transaction| transaction.change)
        .map_err(|e| CaptureError::decode(format!("Invalid wal2json payload: {e}")))
}
