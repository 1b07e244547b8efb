//! The index runner: feeds sinks from the receive log in strict
//! receive-sequence order.
//!
//! Each sink runs in its own task. Catch-up reads from the sink's
//! persisted cursor; once caught up the task blocks on the log's
//! append broadcast (direct sinks) or a sublog's append signal
//! (indirect sinks) until new items arrive. A single bad item is
//! logged and skipped; only storage-level failures halt a sink.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use scuttle_store::{LogEntry, Multilog, ReceiveLog};
use scuttle_types::{ReceiveSeq, Result, ScuttleError};

use crate::cursor::Cursor;

/// One derived index: consumes ordered `(receive_seq, entry)` pairs.
pub trait SinkIndex: Send {
    /// Name used for the cursor directory and logging.
    fn name(&self) -> &'static str;

    /// Applies one log entry to the derived state.
    fn process(&mut self, seq: ReceiveSeq, entry: &LogEntry) -> Result<()>;
}

/// Decides whether a per-item failure halts the sink.
///
/// Validation, crypto and lookup failures are expected for individual
/// messages (unboxable envelopes, malformed content) and are skipped;
/// storage-level failures stop the task.
fn is_fatal(err: &ScuttleError) -> bool {
    matches!(
        err,
        ScuttleError::Storage { .. } | ScuttleError::Fatal { .. } | ScuttleError::Corrupt { .. }
    )
}

/// Owns the sink tasks and their shutdown signal.
pub struct IndexRunner {
    log: Arc<ReceiveLog>,
    shutdown: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl IndexRunner {
    /// Creates a runner over `log`; `shutdown` drains every sink task.
    pub fn new(log: Arc<ReceiveLog>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            log,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Registers a sink fed directly from the receive log.
    pub fn serve(&mut self, cursor: Cursor, sink: Box<dyn SinkIndex>) {
        let log = self.log.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            if let Err(e) = run_direct(log, cursor, sink, shutdown).await {
                tracing::error!(error = %e, "index task halted");
            }
        }));
    }

    /// Registers a sink fed indirectly from one sublog of a multilog:
    /// it only sees the receive sequences that sublog enumerates.
    pub fn serve_from(
        &mut self,
        multilog: Multilog,
        addr: Vec<u8>,
        cursor: Cursor,
        sink: Box<dyn SinkIndex>,
    ) {
        let log = self.log.clone();
        let shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            if let Err(e) = run_indirect(log, multilog, addr, cursor, sink, shutdown).await {
                tracing::error!(error = %e, "indirect index task halted");
            }
        }));
    }

    /// Waits for every sink task to stop (after shutdown fired).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_direct(
    log: Arc<ReceiveLog>,
    cursor: Cursor,
    mut sink: Box<dyn SinkIndex>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut processed = cursor.load()?;
    let mut appends = log.subscribe();
    tracing::debug!(sink = sink.name(), cursor = processed, "index task starting");

    loop {
        let last = log.last_seq().unwrap_or(0);
        if processed < last {
            for (seq, entry) in log.range(processed + 1, last)? {
                apply(&mut sink, seq, &entry)?;
                processed = seq;
                cursor.store(processed)?;
            }
            continue;
        }

        tokio::select! {
            changed = appends.recv() => match changed {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_indirect(
    log: Arc<ReceiveLog>,
    multilog: Multilog,
    addr: Vec<u8>,
    cursor: Cursor,
    mut sink: Box<dyn SinkIndex>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut pos = cursor.load()?;
    let signal = multilog.append_signal();
    tracing::debug!(sink = sink.name(), cursor = pos, "indirect index task starting");

    loop {
        // Register interest before checking the length so appends that
        // land in between still wake the task.
        let notified = signal.notified();

        let len = multilog.len(&addr)?;
        if pos < len {
            for seq in multilog.read_from(&addr, pos)? {
                let entry = log.get(seq)?.ok_or_else(|| ScuttleError::Corrupt {
                    index: sink.name().to_string(),
                    reason: format!("sublog points at missing receive seq {seq}"),
                })?;
                apply(&mut sink, seq, &entry)?;
                pos += 1;
                cursor.store(pos)?;
            }
            continue;
        }

        tokio::select! {
            _ = notified => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

fn apply(sink: &mut Box<dyn SinkIndex>, seq: ReceiveSeq, entry: &LogEntry) -> Result<()> {
    match sink.process(seq, entry) {
        Ok(()) => Ok(()),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            tracing::warn!(sink = sink.name(), seq, error = %e, "skipping item");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
