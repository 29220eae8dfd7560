//! Logical replication session
//!
//! [`ReplicationSession`] owns the replication connection for one capture run:
//!
//! 1. [`ReplicationSession::open`] recreates the publication for the captured
//!    tables, then reuses the named slot or creates it with an exported snapshot.
//! 2. [`ReplicationSession::start_streaming`] issues `START_REPLICATION` with
//!    wal2json.
//! 3. [`ReplicationSession::read_loop`] decodes transactions, filters them and
//!    hands the retained batches to a callback, keeping the server informed
//!    with standby status updates.
//!
//! Positions are only reported back once the consumer acknowledged them through
//! a [`SessionHandle`], so a restart resumes from the last durably handled
//! transaction.

use crate::config::CaptureConfig;
use crate::connection::{quote_identifier, quote_sql_string_value, PgReplicationConnection};
use crate::error::{CaptureError, Result};
use crate::filter::ChangeFilter;
use crate::lsn::PositionTracker;
use crate::protocol::{decode_wal2json, parse_replication_message, ReplicationMessage};
use crate::retry::connect_with_retry;
use crate::types::{
    format_lsn, parse_lsn, ChangeBatch, Lsn, ReplicationSlotOptions, SnapshotAction,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Output plugin the slot is created with
pub const OUTPUT_PLUGIN: &str = "wal2json";

const ACK_QUEUE_CAPACITY: usize = 16;

/// Lifecycle of a replication session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initializing,
    Snapshotting,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Initializing => "initializing",
            SessionState::Snapshotting => "snapshotting",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Control {
    state: SessionState,
    stopped: bool,
}

/// Request from a handle to send an acknowledging status update
#[derive(Debug)]
struct AckRequest {
    position: Lsn,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    cancel: CancellationToken,
    positions: PositionTracker,
    ack_tx: mpsc::Sender<AckRequest>,
}

/// Cloneable control surface of a session, usable from any task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    fn new(start: Lsn, state: SessionState, ack_tx: mpsc::Sender<AckRequest>) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state,
                    stopped: false,
                }),
                cancel: CancellationToken::new(),
                positions: PositionTracker::starting_at(start.0),
                ack_tx,
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        // A poisoned lock only means another task panicked mid-update of plain data
        self.shared
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Confirm that everything up to `position` has been durably handled
    ///
    /// Stale positions are ignored. While streaming, the read loop sends a
    /// status update with reply requested and this waits for the outcome.
    /// Before streaming begins the position is only recorded; the first status
    /// update carries it.
    pub async fn acknowledge(&self, position: Lsn) -> Result<()> {
        if !self.shared.positions.acknowledge(position.0) {
            return Ok(());
        }

        match self.state() {
            SessionState::Initializing | SessionState::Snapshotting => return Ok(()),
            SessionState::Streaming => {}
            state => {
                return Err(CaptureError::acknowledge(format!(
                    "session is {state}; {position} recorded but not sent"
                )))
            }
        }

        let (reply, response) = oneshot::channel();
        self.shared
            .ack_tx
            .send(AckRequest { position, reply })
            .await
            .map_err(|_| CaptureError::acknowledge("replication session is gone"))?;

        response
            .await
            .map_err(|_| CaptureError::acknowledge("read loop exited before acknowledging"))?
    }

    /// [`Self::acknowledge`] for the textual `X/X` form
    pub async fn acknowledge_str(&self, position: &str) -> Result<()> {
        let position = parse_lsn(position)
            .map_err(|e| CaptureError::acknowledge(format!("invalid position: {e}")))?;
        self.acknowledge(Lsn(position)).await
    }

    /// Ask the session to stop; safe to call any number of times from any task
    pub fn stop(&self) {
        {
            let mut control = self.control();
            if control.stopped {
                return;
            }
            control.stopped = true;
            if !control.state.is_terminal() {
                control.state = SessionState::Stopping;
            }
        }
        info!("Stop requested for replication session");
        self.shared.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.control().stopped
    }

    pub fn state(&self) -> SessionState {
        self.control().state
    }

    pub fn acknowledged_position(&self) -> Lsn {
        Lsn(self.shared.positions.acknowledged())
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.shared.positions
    }

    /// Token cancelled by [`Self::stop`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Move to `next` unless a stop already took over; terminal states always win
    pub(crate) fn transition(&self, next: SessionState) -> SessionState {
        let mut control = self.control();
        let allowed = match next {
            SessionState::Stopped | SessionState::Failed => true,
            _ => !control.stopped && !control.state.is_terminal(),
        };
        if allowed && control.state != next {
            debug!("Session state {} -> {}", control.state, next);
            control.state = next;
        }
        control.state
    }
}

/// What to do with one decoded XLogData message
#[derive(Debug, Clone, PartialEq)]
enum XLogOutcome {
    /// Hand these batches to the consumer
    Deliver(Vec<ChangeBatch>),
    /// Nothing for the consumer; acknowledge this position automatically
    AutoAck(Lsn),
    /// Nothing for the consumer and nothing to acknowledge
    Skip,
}

fn plan_xlog(
    filter: &ChangeFilter,
    positions: &PositionTracker,
    auto_ack: bool,
    end: Lsn,
    payload: &[u8],
) -> Result<XLogOutcome> {
    let records = decode_wal2json(payload)?;
    let batch = ChangeBatch::new(Some(end), records);
    let retained = if batch.is_empty() {
        Vec::new()
    } else {
        filter.filter(&batch)
    };

    if !retained.is_empty() {
        return Ok(XLogOutcome::Deliver(retained));
    }
    // Never jump past a batch the consumer holds but has not confirmed
    if auto_ack && positions.is_caught_up() {
        Ok(XLogOutcome::AutoAck(end))
    } else {
        Ok(XLogOutcome::Skip)
    }
}

/// Where streaming starts for a slot that already exists
fn resume_position(confirmed: Lsn, requested: Option<Lsn>) -> Lsn {
    match requested {
        Some(requested) if requested > confirmed => requested,
        _ => confirmed,
    }
}

fn publication_statements(config: &CaptureConfig) -> (String, String) {
    let publication = quote_identifier(&config.publication_name());
    let tables = config
        .tables
        .iter()
        .map(|table| format!("{}.{}", quote_identifier(&config.schema), quote_identifier(table)))
        .collect::<Vec<_>>()
        .join(", ");

    (
        format!("DROP PUBLICATION IF EXISTS {publication}"),
        format!("CREATE PUBLICATION {publication} FOR TABLE {tables}"),
    )
}

/// Rejections of setup statements are permanent setup errors
fn setup_error(e: CaptureError) -> CaptureError {
    match e {
        CaptureError::Protocol(msg) => CaptureError::ProtocolSetup(msg),
        other => other,
    }
}

enum Wake {
    Cancelled,
    Ack(AckRequest),
    Received(std::result::Result<Result<Vec<u8>>, tokio::time::error::Elapsed>),
}

enum DeliveryWake {
    Cancelled,
    Ack(AckRequest),
    Done(Result<()>),
}

/// One replication session against one slot
pub struct ReplicationSession {
    config: CaptureConfig,
    connection: PgReplicationConnection,
    filter: ChangeFilter,
    handle: SessionHandle,
    ack_rx: mpsc::Receiver<AckRequest>,
    start_position: Lsn,
    snapshot_name: Option<String>,
    freshly_created: bool,
    streaming_started: bool,
}

impl ReplicationSession {
    /// Validate `config`, connect, set up the publication and resolve the slot
    ///
    /// The publication is dropped and recreated on every call, so it always
    /// covers exactly the configured tables. A missing slot is created with an
    /// exported snapshot; an existing slot resumes from its confirmed position,
    /// or from `last_lsn` when that is further ahead.
    pub async fn open(mut config: CaptureConfig) -> Result<Self> {
        config.validate_and_default()?;

        let connection =
            connect_with_retry(&config.retry, &config.replication_conninfo()).await?;
        info!(
            "Connected replication session for slot {} on {}:{}/{}",
            config.slot_name, config.host, config.port, config.database
        );

        let (drop_publication, create_publication) = publication_statements(&config);
        connection.exec(&drop_publication).map_err(setup_error)?;
        info!("Creating publication: {}", create_publication);
        connection.exec(&create_publication).map_err(setup_error)?;

        let system = connection.identify_system().map_err(setup_error)?;
        info!(
            "System identification: systemid={} timeline={} xlogpos={} dbname={:?}",
            system.system_id, system.timeline, system.xlogpos, system.dbname
        );

        let (start_position, snapshot_name, freshly_created) =
            match confirmed_flush_position(&connection, &config.slot_name)? {
                Some(confirmed) => {
                    let start = resume_position(confirmed, config.resume_position()?);
                    info!(
                        "Reusing replication slot {} (confirmed {}), starting at {}",
                        config.slot_name, confirmed, start
                    );
                    (start, None, false)
                }
                None => {
                    let options = ReplicationSlotOptions {
                        temporary: false,
                        snapshot: Some(SnapshotAction::Export),
                    };
                    let created = connection
                        .create_replication_slot(&config.slot_name, OUTPUT_PLUGIN, &options)
                        .map_err(setup_error)?;
                    let start = if created.consistent_point.is_valid() {
                        created.consistent_point
                    } else {
                        system.xlogpos
                    };
                    (start, created.snapshot_name, true)
                }
            };

        let state = if config.stream_old_data {
            SessionState::Snapshotting
        } else {
            SessionState::Initializing
        };
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
        let filter = ChangeFilter::new(config.tables.iter().cloned(), config.schema.clone())
            .with_separate_changes(config.separate_changes);

        info!("Replication session opened at {} ({})", start_position, state);

        Ok(Self {
            handle: SessionHandle::new(start_position, state, ack_tx),
            config,
            connection,
            filter,
            ack_rx,
            start_position,
            snapshot_name,
            freshly_created,
            streaming_started: false,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Position the first streamed change follows
    pub fn start_position(&self) -> Lsn {
        self.start_position
    }

    /// Snapshot exported together with a freshly created slot
    pub fn snapshot_name(&self) -> Option<&str> {
        self.snapshot_name.as_deref()
    }

    pub fn freshly_created(&self) -> bool {
        self.freshly_created
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Issue `START_REPLICATION` and move to [`SessionState::Streaming`]
    ///
    /// A rejected start marks the session failed and drops a slot created by
    /// this session.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.handle.is_stopped() {
            return Err(CaptureError::cancelled("session was stopped before streaming"));
        }
        if self.streaming_started {
            return Ok(());
        }

        let options = [("pretty-print", "0")];
        if let Err(e) = self.connection.start_replication(
            &self.config.slot_name,
            self.start_position.0,
            &options,
        ) {
            error!("Starting replication on slot {} failed: {}", self.config.slot_name, e);
            self.fail_and_clean_up();
            return Err(setup_error(e));
        }

        self.streaming_started = true;
        self.handle.transition(SessionState::Streaming);
        info!(
            "Started logical replication on slot {} at {}",
            self.config.slot_name, self.start_position
        );
        Ok(())
    }

    /// Read, decode and deliver until stopped or a fatal error
    ///
    /// `on_change` is awaited once per retained batch; acknowledgement requests
    /// keep being served while it runs, so it may call
    /// [`SessionHandle::acknowledge`] itself. An error from `on_change` ends the
    /// loop and is returned. A payload that fails to decode marks the session
    /// failed and returns [`CaptureError::Decode`].
    pub async fn read_loop<F, Fut>(&mut self, mut on_change: F) -> Result<()>
    where
        F: FnMut(ChangeBatch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.streaming_started {
            return Err(CaptureError::protocol(
                "read_loop called before start_streaming",
            ));
        }

        let result = self.run_read_loop(&mut on_change).await;

        self.connection.close();
        self.ack_rx.close();
        while let Ok(request) = self.ack_rx.try_recv() {
            let _ = request
                .reply
                .send(Err(CaptureError::acknowledge("replication session ended")));
        }

        match &result {
            Ok(()) => {
                self.handle.transition(SessionState::Stopped);
                info!("Replication session on slot {} stopped", self.config.slot_name);
            }
            Err(e) => {
                self.handle.transition(SessionState::Failed);
                error!("Replication session on slot {} failed: {}", self.config.slot_name, e);
            }
        }
        result
    }

    async fn run_read_loop<F, Fut>(&mut self, on_change: &mut F) -> Result<()>
    where
        F: FnMut(ChangeBatch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cancel = self.handle.cancellation_token();
        let timeout = self.config.standby_timeout();
        let mut deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                if let Err(e) = self.send_status(false) {
                    warn!("Periodic standby status update failed: {}", e);
                }
                deadline = Instant::now() + timeout;
            }

            let wake = tokio::select! {
                biased;

                _ = cancel.cancelled() => Wake::Cancelled,
                Some(request) = self.ack_rx.recv() => Wake::Ack(request),
                received = timeout_at(deadline, self.connection.get_copy_data_async(&cancel)) => {
                    Wake::Received(received)
                }
            };

            let data = match wake {
                Wake::Cancelled => return Ok(()),
                Wake::Ack(request) => {
                    self.answer_ack(request, &mut deadline);
                    continue;
                }
                // Deadline reached; the status update goes out at the top of the loop
                Wake::Received(Err(_)) => continue,
                Wake::Received(Ok(Err(e))) if e.is_cancelled() => return Ok(()),
                Wake::Received(Ok(Err(e))) => return Err(e),
                Wake::Received(Ok(Ok(data))) => data,
            };

            match parse_replication_message(data)? {
                ReplicationMessage::Keepalive(keepalive) => {
                    debug!(
                        "Received keepalive: wal_end={}, reply_requested={}",
                        format_lsn(keepalive.wal_end),
                        keepalive.reply_requested
                    );
                    self.handle.positions().update_received(keepalive.wal_end);
                    if keepalive.reply_requested {
                        deadline = Instant::now();
                    }
                }
                ReplicationMessage::XLogData(xlog) => {
                    let end = Lsn(xlog.end_position());
                    self.handle.positions().update_received(end.0);

                    let outcome = plan_xlog(
                        &self.filter,
                        self.handle.positions(),
                        self.config.auto_ack,
                        end,
                        &xlog.data,
                    )?;

                    match outcome {
                        XLogOutcome::Deliver(batches) => {
                            self.handle.positions().update_delivered(end.0);
                            for batch in batches {
                                if !self.deliver(batch, on_change, &cancel, &mut deadline).await? {
                                    return Ok(());
                                }
                            }
                        }
                        XLogOutcome::AutoAck(position) => {
                            self.handle.positions().acknowledge(position.0);
                            match self.send_status(true) {
                                Ok(()) => deadline = Instant::now() + timeout,
                                Err(e) => warn!("Automatic acknowledgement of {} failed: {}", position, e),
                            }
                        }
                        XLogOutcome::Skip => {
                            debug!("Nothing to deliver up to {}", end);
                        }
                    }
                }
                ReplicationMessage::Unknown(tag) => {
                    warn!("Received unknown message type: {}", tag as char);
                }
            }
        }
    }

    /// Await `on_change` for one batch while still answering acknowledgements
    ///
    /// Returns `false` when the session was stopped during delivery.
    async fn deliver<F, Fut>(
        &mut self,
        batch: ChangeBatch,
        on_change: &mut F,
        cancel: &CancellationToken,
        deadline: &mut Instant,
    ) -> Result<bool>
    where
        F: FnMut(ChangeBatch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        debug!(
            "Delivering {} changes at {:?}",
            batch.len(),
            batch.position.map(|p| p.to_string())
        );

        let delivery = on_change(batch);
        tokio::pin!(delivery);

        loop {
            let wake = tokio::select! {
                biased;

                _ = cancel.cancelled() => DeliveryWake::Cancelled,
                Some(request) = self.ack_rx.recv() => DeliveryWake::Ack(request),
                result = &mut delivery => DeliveryWake::Done(result),
            };

            match wake {
                DeliveryWake::Cancelled => return Ok(false),
                DeliveryWake::Ack(request) => self.answer_ack(request, deadline),
                DeliveryWake::Done(result) => return result.map(|()| true),
            }
        }
    }

    fn answer_ack(&mut self, request: AckRequest, deadline: &mut Instant) {
        let result = self
            .send_status(true)
            .map_err(|e| CaptureError::acknowledge(e.to_string()));

        match &result {
            Ok(()) => {
                *deadline = Instant::now() + self.config.standby_timeout();
                debug!("Sent standby status message at {}", request.position);
            }
            Err(e) => warn!("Acknowledging {} failed: {}", request.position, e),
        }
        let _ = request.reply.send(result);
    }

    /// Report the acknowledged position as written, flushed and applied
    fn send_status(&self, reply_requested: bool) -> Result<()> {
        let position = self.handle.positions().acknowledged();
        self.connection
            .send_standby_status_update(position, position, position, reply_requested)
    }

    fn fail_and_clean_up(&mut self) {
        self.handle.transition(SessionState::Failed);
        if let Err(e) = self.clean_up() {
            warn!("Cleanup after failure incomplete: {}", e);
        }
    }

    /// Drop the slot and publication if this session created the slot
    ///
    /// A slot this session did not create is left alone so its position
    /// survives for the next run.
    pub fn clean_up(&mut self) -> Result<()> {
        if !self.freshly_created {
            return Ok(());
        }
        warn!(
            "Cleaning up replication slot {} and publication {}",
            self.config.slot_name,
            self.config.publication_name()
        );

        if self.connection.is_streaming() || !self.connection.is_alive() {
            self.connection.close();
            self.connection = PgReplicationConnection::connect(&self.config.replication_conninfo())?;
        }

        self.connection
            .drop_replication_slot(&self.config.slot_name, true)
            .map_err(setup_error)?;
        self.connection
            .exec(&publication_statements(&self.config).0)
            .map_err(setup_error)?;
        self.freshly_created = false;
        Ok(())
    }

    /// Close the session from the owning side
    ///
    /// A slot created by this session is dropped if streaming never began.
    pub fn close(&mut self) -> Result<()> {
        self.handle.stop();
        let cleaned = if owns_unstreamed_slot(self.freshly_created, self.streaming_started) {
            self.clean_up()
        } else {
            Ok(())
        };
        self.connection.close();
        self.handle.transition(SessionState::Stopped);
        cleaned
    }

    /// Mark the session failed and remove what it created
    pub(crate) fn abort(&mut self) {
        self.handle.stop();
        self.fail_and_clean_up();
        self.connection.close();
    }
}

impl Drop for ReplicationSession {
    fn drop(&mut self) {
        if owns_unstreamed_slot(self.freshly_created, self.streaming_started) {
            warn!(
                "Replication session dropped before streaming; removing slot {}",
                self.config.slot_name
            );
            if let Err(e) = self.close() {
                warn!("Cleanup on drop incomplete: {}", e);
            }
        }
        self.connection.close();
    }
}

/// A slot this session created but never streamed from would retain WAL forever
fn owns_unstreamed_slot(freshly_created: bool, streaming_started: bool) -> bool {
    freshly_created && !streaming_started
}

fn confirmed_flush_position(
    connection: &PgReplicationConnection,
    slot_name: &str,
) -> Result<Option<Lsn>> {
    let result = connection
        .exec(&format!(
            "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = {}",
            quote_sql_string_value(slot_name)
        ))
        .map_err(setup_error)?;

    if result.ntuples() == 0 {
        return Ok(None);
    }
    if result.is_null(0, 0) {
        return Ok(Some(Lsn::INVALID));
    }

    let text = result.get_value(0, 0).unwrap_or_default();
    parse_lsn(&text)
        .map(|lsn| Some(Lsn(lsn)))
        .map_err(|e| CaptureError::protocol_setup(format!("bad confirmed_flush_lsn: {e}")))
}
