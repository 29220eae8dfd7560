//! # PostgreSQL Change Capture
//!
//! Streams row-level changes of selected tables out of PostgreSQL through a
//! logical replication slot decoded by the `wal2json` output plugin, optionally
//! preceded by a consistent snapshot of the tables' current contents.
//!
//! ## Features
//!
//! - Publication and slot management: a missing slot is created with an
//!   exported snapshot, an existing slot resumes from its confirmed position
//! - Consistent initial load paged by primary key and sized from available memory
//! - Allow-list filtering of decoded transactions by schema and table
//! - Consumer-driven acknowledgement: the server only learns about positions
//!   the consumer confirmed
//! - Conversion of wal2json column values into typed [`ColumnValue`]s and
//!   projection onto caller-defined records with [`StructMapper`]
//! - **Truly async, non-blocking I/O** on top of libpq with graceful cancellation
//!
//! ## Protocol Support
//!
//! - <https://www.postgresql.org/docs/current/protocol-replication.html>
//! - <https://github.com/eulerto/wal2json> (format version 1)
//!
//! ## Quick Start
//!
//! ```ignore
//! use pg_capture::{Capture, CaptureConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CaptureConfig::from_file("capture.toml")?;
//!     let capture = Capture::new(config)?;
//!     let handle = capture.handle();
//!
//!     let acker = handle.clone();
//!     capture
//!         .run(move |batch| {
//!             let acker = acker.clone();
//!             async move {
//!                 for record in &batch.records {
//!                     println!("{} {:?}", record.full_table_name(), record.kind);
//!                 }
//!                 if let Some(position) = batch.position {
//!                     acker.acknowledge(position).await?;
//!                 }
//!                 Ok(())
//!             }
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod buffer;
pub mod error;
pub mod types;

// Protocol implementation
pub mod lsn;
pub mod protocol;

// Values and records
pub mod convert;
pub mod mapper;

// Capture pipeline
pub mod capture;
pub mod config;
pub mod filter;
pub mod snapshot;
pub mod stream;

pub mod connection;
pub mod retry;

// Re-export main types for convenience
pub use buffer::{BufferReader, BufferWriter};
pub use error::{CaptureError, Result};
pub use lsn::PositionTracker;

pub use types::{
    // Utility functions
    format_lsn,
    parse_lsn,
    postgres_timestamp_to_chrono,
    system_time_to_postgres_timestamp,
    // Change types
    ChangeBatch,
    ChangeKind,
    ChangeRecord,
    CreatedSlot,
    Lsn,
    OldKeys,
    ReplicationSlotOptions,
    SnapshotAction,
    // Type aliases matching PostgreSQL types
    Oid,
    TimestampTz,
    XLogRecPtr,
    // Constants
    INVALID_XLOG_REC_PTR,
    PG_EPOCH_OFFSET_SECS,
};

pub use protocol::{
    decode_wal2json, message_types, parse_keepalive_message, parse_replication_message,
    KeepaliveMessage, ReplicationMessage, XLogDataMessage,
};

pub use convert::{render_timestamp, ColumnValue, TypeConverter};
pub use mapper::{FieldKind, FieldSetter, FieldSpec, Record, StructMapper};

pub use capture::{Capture, CaptureHandle};
pub use config::{CaptureConfig, TlsVerify};
pub use filter::ChangeFilter;
pub use snapshot::{
    available_memory, compute_batch_size, PgSnapshotSource, SnapshotSource, SnapshotSummary,
    Snapshotter, TablePage, TableStats,
};
pub use stream::{ReplicationSession, SessionHandle, SessionState};

// Re-export tokio_util for CancellationToken
pub use tokio_util::sync::CancellationToken;

// Re-export libpq-specific types
pub use connection::{PgReplicationConnection, PgResult, SystemIdentity};

pub use retry::{ExponentialBackoff, RetryConfig};
