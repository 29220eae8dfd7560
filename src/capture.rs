//! End-to-end capture: optional snapshot followed by live streaming
//!
//! [`Capture::run`] drives one [`ReplicationSession`]. With `stream_old_data`
//! the current table contents are loaded first through the snapshot exported
//! with the slot, then a heartbeat batch carrying the slot's start position is
//! emitted, and only then does live streaming begin. Batches reach the
//! consumer callback strictly in that order.
//!
//! The snapshot is loaded on a blocking thread into a bounded channel; live
//! batches pass through a channel of capacity one, so the read loop never runs
//! far ahead of the consumer.

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::snapshot::{SnapshotSource, SnapshotSummary, Snapshotter};
use crate::stream::{ReplicationSession, SessionHandle, SessionState};
use crate::types::{ChangeBatch, Lsn};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Snapshot pages buffered ahead of the consumer
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 100;

/// Live batches buffered ahead of the consumer
pub const LIVE_CHANNEL_CAPACITY: usize = 1;

/// Stops a capture and forwards acknowledgements to its session
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    cancel: CancellationToken,
    session: Arc<OnceLock<SessionHandle>>,
}

impl CaptureHandle {
    /// Stop the capture; safe to call repeatedly and before the session exists
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(session) = self.session.get() {
            session.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// See [`SessionHandle::acknowledge`]
    pub async fn acknowledge(&self, position: Lsn) -> Result<()> {
        match self.session.get() {
            Some(session) => session.acknowledge(position).await,
            None => Err(CaptureError::acknowledge("capture has no open session yet")),
        }
    }

    pub async fn acknowledge_str(&self, position: &str) -> Result<()> {
        match self.session.get() {
            Some(session) => session.acknowledge_str(position).await,
            None => Err(CaptureError::acknowledge("capture has no open session yet")),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .get()
            .map(SessionHandle::state)
            .unwrap_or(SessionState::Initializing)
    }

    pub fn acknowledged_position(&self) -> Option<Lsn> {
        self.session.get().map(SessionHandle::acknowledged_position)
    }

    /// Session handle once the session is open
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.get()
    }
}

/// One capture run against one slot
pub struct Capture {
    config: CaptureConfig,
    handle: CaptureHandle,
}

impl Capture {
    pub fn new(mut config: CaptureConfig) -> Result<Self> {
        config.validate_and_default()?;
        Ok(Self {
            config,
            handle: CaptureHandle {
                cancel: CancellationToken::new(),
                session: Arc::new(OnceLock::new()),
            },
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    /// Run until stopped, a fatal error, or `on_change` fails
    ///
    /// An error returned by `on_change` stops the session and is returned.
    /// Snapshot and decode failures drop a slot created by this run, together
    /// with its publication, before the error is returned.
    pub async fn run<F, Fut>(self, mut on_change: F) -> Result<()>
    where
        F: FnMut(ChangeBatch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Capture { config, handle } = self;
        let cancel = handle.cancel.clone();

        let mut session = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Capture stopped before the session was opened");
                return Ok(());
            }
            session = ReplicationSession::open(config.clone()) => session?,
        };

        let session_handle = session.handle();
        // Set exactly once; `run` consumes the capture
        let _ = handle.session.set(session_handle.clone());
        if cancel.is_cancelled() {
            session_handle.stop();
        }

        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<ChangeBatch>(SNAPSHOT_CHANNEL_CAPACITY);
        let (live_tx, mut live_rx) = mpsc::channel::<ChangeBatch>(LIVE_CHANNEL_CAPACITY);

        let snapshot_task = if config.stream_old_data {
            if !session.freshly_created() {
                warn!(
                    "Slot {} already existed; snapshot reflects current data, not the slot position",
                    config.slot_name
                );
            }
            let snapshot_name = session.snapshot_name().map(str::to_string);
            let start = session.start_position();
            let snapshot_config = config.clone();
            let token = session_handle.cancellation_token();

            Some(tokio::task::spawn_blocking(move || {
                let mut snapshotter =
                    Snapshotter::prepare(&snapshot_config, snapshot_name.as_deref())?;
                load_snapshot(&mut snapshotter, start, &snapshot_tx, &token)
            }))
        } else {
            drop(snapshot_tx);
            None
        };

        let session_task = tokio::spawn(async move {
            if let Some(task) = snapshot_task {
                let outcome = task
                    .await
                    .map_err(|e| CaptureError::snapshot(format!("snapshot task failed: {e}")))
                    .and_then(|result| result);

                match outcome {
                    Ok(summary) => info!(
                        "Snapshot delivered {} rows from {} tables",
                        summary.rows, summary.tables
                    ),
                    Err(e) if session.handle().is_stopped() => {
                        info!("Snapshot interrupted by stop: {}", e);
                        return session.close();
                    }
                    Err(e) => {
                        error!("Snapshot failed: {}", e);
                        session.abort();
                        return Err(e);
                    }
                }
            }

            if session.handle().is_stopped() {
                return session.close();
            }

            session.start_streaming()?;
            let result = session
                .read_loop(|batch| {
                    let live_tx = live_tx.clone();
                    async move {
                        live_tx
                            .send(batch)
                            .await
                            .map_err(|_| CaptureError::channel_closed("capture consumer went away"))
                    }
                })
                .await;

            if let Err(CaptureError::Decode(_)) = &result {
                if let Err(cleanup) = session.clean_up() {
                    warn!("Cleanup after decode failure incomplete: {}", cleanup);
                }
            }
            result
        });

        let mut snapshot_open = true;
        let mut live_open = true;
        let consumed: Result<()> = loop {
            let batch = tokio::select! {
                biased;

                batch = snapshot_rx.recv(), if snapshot_open => match batch {
                    Some(batch) => batch,
                    None => {
                        snapshot_open = false;
                        continue;
                    }
                },
                batch = live_rx.recv(), if live_open => match batch {
                    Some(batch) => batch,
                    None => {
                        live_open = false;
                        continue;
                    }
                },
                _ = cancel.cancelled() => break Ok(()),
                else => break Ok(()),
            };

            if let Err(e) = on_change(batch).await {
                error!("Change handler failed, stopping capture: {}", e);
                break Err(e);
            }
        };

        if consumed.is_err() {
            session_handle.stop();
        }
        drop(snapshot_rx);
        drop(live_rx);

        let session_result = session_task
            .await
            .map_err(|e| CaptureError::protocol(format!("session task failed: {e}")))
            .and_then(|result| result);

        consumed?;
        match session_result {
            Err(e) if e.is_cancelled() || matches!(e, CaptureError::ChannelClosed(_)) => Ok(()),
            other => other,
        }
    }
}

/// Load every table into `tx`, then a heartbeat at `start`
fn load_snapshot<S: SnapshotSource>(
    snapshotter: &mut Snapshotter<S>,
    start: Lsn,
    tx: &mpsc::Sender<ChangeBatch>,
    cancel: &CancellationToken,
) -> Result<SnapshotSummary> {
    let summary = snapshotter.run(|batch| {
        if cancel.is_cancelled() {
            return Err(CaptureError::cancelled("snapshot interrupted"));
        }
        tx.blocking_send(batch)
            .map_err(|_| CaptureError::channel_closed("snapshot consumer went away"))
    })?;
    snapshotter.release_snapshot()?;

    tx.blocking_send(ChangeBatch::heartbeat(start))
        .map_err(|_| CaptureError::channel_closed("snapshot consumer went away"))?;
    Ok(summary)
}
