//! Low-level PostgreSQL connection using libpq-sys
//!
//! [`PgReplicationConnection`] wraps one libpq connection. The same type serves
//! the replication connection (`replication=database` in the conninfo) and the
//! regular SQL connection the snapshotter reads through.
//!
//! # Async I/O
//!
//! Once `START_REPLICATION` succeeds, reads go through tokio's `AsyncFd` around
//! libpq's socket:
//!
//! 1. `get_copy_data_async()` first drains libpq's internal buffer (`PQgetCopyData`
//!    in async mode never blocks)
//! 2. If nothing is buffered, it awaits `AsyncFd::readable()`, which yields the task
//! 3. On readiness it calls `PQconsumeInput()` and tries the buffer again
//! 4. If still no complete message, `clear_ready()` re-arms the readiness and the loop repeats
//!
//! Cancellation is checked in the same `select!` as readiness, so a stop request
//! never waits for the next server message.
use crate::error::{CaptureError, Result};
use crate::protocol::build_standby_status_update;
use crate::types::{
    format_lsn, parse_lsn, system_time_to_postgres_timestamp, CreatedSlot, Lsn, Oid,
    ReplicationSlotOptions, XLogRecPtr, INVALID_XLOG_REC_PTR,
};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::time::SystemTime;
use std::{ptr, slice};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Oldest server with publications and logical slots
const MIN_SERVER_VERSION: i32 = 100_000;
/// First server accepting the parenthesized `CREATE_REPLICATION_SLOT` options
const PARENTHESIZED_SLOT_OPTIONS_VERSION: i32 = 150_000;

/// Escape single quotes for use inside a SQL string literal
#[inline]
pub(crate) fn sanitize_sql_string_value(value: &str) -> String {
    value.replace('\'', "''")
}

/// Sanitize a string value and wrap it in single quotes for SQL
#[inline]
pub(crate) fn quote_sql_string_value(value: &str) -> String {
    format!("'{}'", sanitize_sql_string_value(value))
}

/// Quote an identifier (schema, table, slot, publication) for SQL
#[inline]
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Result of attempting to read from libpq's internal buffer
#[derive(Debug)]
enum ReadResult {
    Data(Vec<u8>),
    WouldBlock,
    /// COPY stream has ended gracefully
    CopyDone,
}

/// Row of `IDENTIFY_SYSTEM`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    /// Current WAL flush position of the server
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

/// Safe wrapper around a libpq connection
///
/// # Example
///
/// ```no_run
/// use pg_capture::PgReplicationConnection;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let conn = PgReplicationConnection::connect(
///     "host=localhost user=postgres dbname=shop replication=database"
/// )?;
///
/// let system = conn.identify_system()?;
/// println!("server is at {}", system.xlogpos);
/// # Ok(())
/// # }
/// ```
pub struct PgReplicationConnection {
    conn: *mut PGconn,
    /// Set once the connection entered CopyBoth mode
    is_replication_conn: bool,
    async_fd: Option<AsyncFd<RawFd>>,
}

impl PgReplicationConnection {
    /// Open a connection described by a libpq conninfo string
    ///
    /// Failures are classified so the retry layer can tell them apart:
    /// authentication problems and missing databases are permanent, anything
    /// else (refused, unreachable, timeouts) is transient.
    pub fn connect(conninfo: &str) -> Result<Self> {
        let c_conninfo = CString::new(conninfo).map_err(|e| {
            CaptureError::permanent_connection(format!("Invalid connection string: {e}"))
        })?;

        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(CaptureError::transient_connection(
                "Failed to allocate PostgreSQL connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = unsafe { error_message_of(conn) };
            unsafe { PQfinish(conn) };
            return Err(classify_connect_error(&error_msg));
        }

        let server_version = unsafe { PQserverVersion(conn) };
        if server_version < MIN_SERVER_VERSION {
            unsafe { PQfinish(conn) };
            return Err(CaptureError::permanent_connection(format!(
                "PostgreSQL version {server_version} is not supported. Logical replication requires PostgreSQL 10+"
            )));
        }

        debug!("Connected to PostgreSQL server version: {}", server_version);

        Ok(Self {
            conn,
            is_replication_conn: false,
            async_fd: None,
        })
    }

    /// Execute a SQL or replication command
    ///
    /// Any status other than tuples, command OK or the COPY states is an error.
    pub fn exec(&self, query: &str) -> Result<PgResult> {
        if self.conn.is_null() {
            return Err(CaptureError::protocol("Connection is closed"));
        }

        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(CaptureError::protocol(format!(
                "Query execution failed: {}",
                self.last_error_message()
            )));
        }

        let pg_result = PgResult::new(result);
        let status = pg_result.status();
        debug!("query: {} status: {:?}", query, status);

        if !matches!(
            status,
            ExecStatusType::PGRES_TUPLES_OK
                | ExecStatusType::PGRES_COMMAND_OK
                | ExecStatusType::PGRES_COPY_BOTH
                | ExecStatusType::PGRES_COPY_OUT
        ) {
            let error_msg = pg_result
                .error_message()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(CaptureError::protocol(format!(
                "Query execution failed: {}",
                error_msg.trim_end()
            )));
        }

        Ok(pg_result)
    }

    /// Send IDENTIFY_SYSTEM
    pub fn identify_system(&self) -> Result<SystemIdentity> {
        let result = self.exec("IDENTIFY_SYSTEM")?;

        if result.ntuples() < 1 || result.nfields() < 3 {
            return Err(CaptureError::protocol(
                "IDENTIFY_SYSTEM returned no rows",
            ));
        }

        let system_id = result.get_value(0, 0).unwrap_or_default();
        let timeline = result
            .get_value(0, 1)
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();
        let xlogpos = result
            .get_value(0, 2)
            .ok_or_else(|| CaptureError::protocol("IDENTIFY_SYSTEM returned no xlogpos"))
            .and_then(|pos| parse_lsn(&pos).map_err(|e| CaptureError::protocol(e.to_string())))?;
        let dbname = if result.nfields() > 3 && !result.is_null(0, 3) {
            result.get_value(0, 3)
        } else {
            None
        };

        debug!(
            "System identification: systemid={}, timeline={}, xlogpos={}",
            system_id,
            timeline,
            format_lsn(xlogpos)
        );

        Ok(SystemIdentity {
            system_id,
            timeline,
            xlogpos: Lsn(xlogpos),
            dbname,
        })
    }

    /// Create a logical replication slot
    pub fn create_replication_slot(
        &self,
        slot_name: &str,
        output_plugin: &str,
        options: &ReplicationSlotOptions,
    ) -> Result<CreatedSlot> {
        let mut sql = format!("CREATE_REPLICATION_SLOT {} ", quote_identifier(slot_name));
        if options.temporary {
            sql.push_str("TEMPORARY ");
        }
        sql.push_str("LOGICAL ");
        sql.push_str(output_plugin);

        if let Some(action) = options.snapshot {
            if self.server_version() >= PARENTHESIZED_SLOT_OPTIONS_VERSION {
                sql.push_str(&format!(
                    " (SNAPSHOT {})",
                    quote_sql_string_value(action.as_str())
                ));
            } else {
                let keyword = match action {
                    crate::types::SnapshotAction::Export => "EXPORT_SNAPSHOT",
                    crate::types::SnapshotAction::NoExport => "NOEXPORT_SNAPSHOT",
                    crate::types::SnapshotAction::Use => "USE_SNAPSHOT",
                };
                sql.push(' ');
                sql.push_str(keyword);
            }
        }

        debug!("Creating replication slot: {}", sql);
        let result = self.exec(&sql)?;

        if result.ntuples() < 1 {
            return Err(CaptureError::protocol(
                "CREATE_REPLICATION_SLOT returned no rows",
            ));
        }

        let consistent_point = match result.get_value(0, 1) {
            Some(text) if !text.is_empty() => Lsn(parse_lsn(&text)?),
            _ => Lsn::INVALID,
        };
        let optional = |col: i32| {
            if result.nfields() > col && !result.is_null(0, col) {
                result.get_value(0, col).filter(|v| !v.is_empty())
            } else {
                None
            }
        };

        let created = CreatedSlot {
            slot_name: result
                .get_value(0, 0)
                .unwrap_or_else(|| slot_name.to_string()),
            consistent_point,
            snapshot_name: optional(2),
            output_plugin: optional(3),
        };

        info!(
            "Created replication slot {} at {} (snapshot {:?})",
            created.slot_name, created.consistent_point, created.snapshot_name
        );
        Ok(created)
    }

    /// Drop a replication slot, waiting for it to become inactive when `wait` is set
    pub fn drop_replication_slot(&self, slot_name: &str, wait: bool) -> Result<()> {
        let mut sql = format!("DROP_REPLICATION_SLOT {}", quote_identifier(slot_name));
        if wait {
            sql.push_str(" WAIT");
        }
        self.exec(&sql)?;
        info!("Dropped replication slot {}", slot_name);
        Ok(())
    }

    /// Start logical replication and switch the connection to CopyBoth
    pub fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: XLogRecPtr,
        options: &[(&str, &str)],
    ) -> Result<()> {
        let options_str = options
            .iter()
            .map(|(key, value)| format!("\"{key}\" {}", quote_sql_string_value(value)))
            .collect::<Vec<_>>()
            .join(", ");

        let lsn = if start_lsn == INVALID_XLOG_REC_PTR {
            "0/0".to_string()
        } else {
            format_lsn(start_lsn)
        };

        let mut sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            quote_identifier(slot_name),
            lsn
        );
        if !options_str.is_empty() {
            sql.push_str(&format!(" ({options_str})"));
        }

        debug!("Starting replication: {}", sql);
        self.exec(&sql)?;

        self.is_replication_conn = true;
        self.initialize_async_socket()?;

        info!("Logical replication started on slot {} at {}", slot_name, lsn);
        Ok(())
    }

    /// Send a standby status update
    pub fn send_standby_status_update(
        &self,
        write_lsn: XLogRecPtr,
        flush_lsn: XLogRecPtr,
        apply_lsn: XLogRecPtr,
        reply_requested: bool,
    ) -> Result<()> {
        self.ensure_replication_mode()?;

        let message = build_standby_status_update(
            write_lsn,
            flush_lsn,
            apply_lsn,
            system_time_to_postgres_timestamp(SystemTime::now()),
            reply_requested,
        )?;
        self.put_copy_data_and_flush(&message)?;

        debug!(
            "Sent standby status update: write={}, flush={}, apply={}, reply_requested={}",
            format_lsn(write_lsn),
            format_lsn(flush_lsn),
            format_lsn(apply_lsn),
            reply_requested
        );

        Ok(())
    }

    fn initialize_async_socket(&mut self) -> Result<()> {
        let sock: RawFd = unsafe { PQsocket(self.conn) };
        if sock < 0 {
            return Err(CaptureError::protocol("Invalid PostgreSQL socket"));
        }

        let async_fd = AsyncFd::new(sock)?;
        self.async_fd = Some(async_fd);
        Ok(())
    }

    /// Receive the next CopyData message without blocking the executor
    ///
    /// Returns [`CaptureError::Cancelled`] when the token fires or the server
    /// ends the COPY stream.
    pub async fn get_copy_data_async(
        &mut self,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.ensure_replication_mode()?;

        let async_fd = self
            .async_fd
            .as_ref()
            .ok_or_else(|| CaptureError::protocol("AsyncFd not initialized"))?;

        loop {
            match self.try_read_buffered_data()? {
                ReadResult::Data(data) => return Ok(data),
                ReadResult::CopyDone => {
                    return Err(CaptureError::cancelled("COPY stream ended"));
                }
                ReadResult::WouldBlock => {}
            }

            tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    debug!("Cancellation detected while waiting for replication data");
                    return Err(CaptureError::cancelled("Operation cancelled"));
                }

                guard_result = async_fd.readable() => {
                    let mut guard = guard_result?;

                    let consumed = unsafe { PQconsumeInput(self.conn) };
                    if consumed == 0 {
                        return Err(CaptureError::protocol(format!(
                            "PQconsumeInput failed: {}",
                            self.last_error_message()
                        )));
                    }

                    match self.try_read_buffered_data()? {
                        ReadResult::Data(data) => return Ok(data),
                        ReadResult::CopyDone => {
                            return Err(CaptureError::cancelled("COPY stream ended"));
                        }
                        ReadResult::WouldBlock => guard.clear_ready(),
                    }
                }
            }
        }
    }

    #[inline]
    fn try_read_buffered_data(&self) -> Result<ReadResult> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let result = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match result {
            len if len > 0 => {
                if buffer.is_null() {
                    return Err(CaptureError::protocol(
                        "Received null buffer from PQgetCopyData",
                    ));
                }

                let data =
                    unsafe { slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut c_void) };
                Ok(ReadResult::Data(data))
            }
            0 => Ok(ReadResult::WouldBlock),
            -1 => Ok(ReadResult::CopyDone),
            -2 => Err(CaptureError::protocol(format!(
                "PQgetCopyData failed: {}",
                self.last_error_message()
            ))),
            other => Err(CaptureError::protocol(format!(
                "Unexpected PQgetCopyData result: {other}"
            ))),
        }
    }

    fn last_error_message(&self) -> String {
        unsafe { error_message_of(self.conn) }
    }

    #[inline]
    fn ensure_replication_mode(&self) -> Result<()> {
        if !self.is_replication_conn {
            return Err(CaptureError::protocol(
                "Connection is not in replication mode",
            ));
        }
        Ok(())
    }

    fn put_copy_data_and_flush(&self, data: &[u8]) -> Result<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            return Err(CaptureError::protocol(format!(
                "Failed to send data via COPY protocol: {}",
                self.last_error_message()
            )));
        }

        let flush_result = unsafe { PQflush(self.conn) };
        if flush_result != 0 {
            return Err(CaptureError::protocol(format!(
                "Failed to flush connection: {}",
                self.last_error_message()
            )));
        }

        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        if self.conn.is_null() {
            return false;
        }

        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_OK }
    }

    pub fn is_streaming(&self) -> bool {
        self.is_replication_conn
    }

    pub fn server_version(&self) -> i32 {
        if self.conn.is_null() {
            return 0;
        }
        unsafe { PQserverVersion(self.conn) }
    }

    /// End COPY mode if needed and close the connection; safe to call twice
    pub fn close(&mut self) {
        if self.conn.is_null() {
            return;
        }

        if self.is_replication_conn {
            let result = unsafe { PQputCopyEnd(self.conn, ptr::null()) };
            if result != 1 {
                warn!(
                    "Failed to end COPY mode gracefully: {}",
                    self.last_error_message()
                );
            }
            self.is_replication_conn = false;
        }

        // AsyncFd must deregister before libpq closes the socket
        self.async_fd = None;
        unsafe { PQfinish(self.conn) };
        self.conn = ptr::null_mut();

        debug!("PostgreSQL connection closed");
    }
}

impl Drop for PgReplicationConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// The raw PGconn is only ever used by the task that owns this value
unsafe impl Send for PgReplicationConnection {}

unsafe fn error_message_of(conn: *const PGconn) -> String {
    let error_ptr = PQerrorMessage(conn);
    if error_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(error_ptr)
            .to_string_lossy()
            .trim_end()
            .to_string()
    }
}

fn classify_connect_error(error_msg: &str) -> CaptureError {
    let lower = error_msg.to_lowercase();
    if lower.contains("authentication failed")
        || lower.contains("password")
        || (lower.contains("role") && lower.contains("does not exist"))
        || lower.contains("no pg_hba.conf entry")
    {
        CaptureError::authentication(format!("PostgreSQL authentication failed: {error_msg}"))
    } else if (lower.contains("database") && lower.contains("does not exist"))
        || lower.contains("invalid connection option")
        || lower.contains("invalid sslmode")
        || lower.contains("unsupported")
    {
        CaptureError::permanent_connection(format!(
            "PostgreSQL connection failed (permanent): {error_msg}"
        ))
    } else {
        CaptureError::transient_connection(format!(
            "PostgreSQL connection failed (transient): {error_msg}"
        ))
    }
}

/// Owned query result, cleared on drop
pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    fn new(result: *mut PGresult) -> Self {
        Self { result }
    }

    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    /// Text value of a cell; SQL NULL reads as `Some("")`, check [`Self::is_null`]
    pub fn get_value(&self, row: i32, col: i32) -> Option<String> {
        if row >= self.ntuples() || col >= self.nfields() {
            return None;
        }

        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }

    pub fn is_null(&self, row: i32, col: i32) -> bool {
        if row >= self.ntuples() || col >= self.nfields() {
            return true;
        }
        unsafe { PQgetisnull(self.result, row, col) == 1 }
    }

    pub fn field_name(&self, col: i32) -> Option<String> {
        let name_ptr = unsafe { PQfname(self.result, col) };
        if name_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(name_ptr).to_string_lossy().into_owned()) }
        }
    }

    /// Type OID of a result column
    pub fn field_type(&self, col: i32) -> Oid {
        unsafe { PQftype(self.result, col) }
    }

    pub fn error_message(&self) -> Option<String> {
        let error_ptr = unsafe { PQresultErrorMessage(self.result) };
        if error_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe {
                PQclear(self.result);
            }
        }
    }
}
