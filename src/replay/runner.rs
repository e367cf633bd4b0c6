// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Drives one replay run: feeds the capture through the accumulator, lets the dispatcher replay
//! and emit, then drains everything in order.
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::accumulator::{Accumulator, AccumulatorConfig, AccumulatorStats};
use super::dispatcher::{DispatchStats, Dispatcher};
use super::emitter::TupleEmitter;
use super::executor::ReplayExecutor;
use crate::capture::CaptureSource;
use crate::errors::{Error, Result};

/// End-of-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub connections_created: u64,
    pub reused_connection_requests: u64,
    pub expired: u64,
    pub closed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub evicted: u64,
    pub unmatched_writes: u64,
}

impl ReplaySummary {
    fn new(accumulated: &AccumulatorStats, dispatched: &DispatchStats) -> Self {
        Self {
            connections_created: accumulated.connections_created,
            reused_connection_requests: accumulated.requests_on_reused_connections,
            expired: accumulated.connections_expired,
            closed: accumulated.connections_closed,
            succeeded: dispatched.succeeded,
            failed: dispatched.failed,
            evicted: accumulated.connections_evicted,
            unmatched_writes: accumulated.unmatched_writes,
        }
    }
}

impl fmt::Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections created: {}, requests on reused connections: {}, expired: {}, closed: {}, \
             evicted: {}, replays succeeded: {}, replays failed: {}, unmatched writes: {}",
            self.connections_created,
            self.reused_connection_requests,
            self.expired,
            self.closed,
            self.evicted,
            self.succeeded,
            self.failed,
            self.unmatched_writes
        )
    }
}

/// Replays everything `source` yields. Returns once every transaction has been emitted and the
/// executor's transport has been released.
///
/// Replay failures only show up in the summary. A source error still drains what was already
/// accumulated before it is returned; an emitter error stops the feed and is returned as soon as
/// the run has wound down.
pub async fn replay<S: CaptureSource>(
    source: &mut S,
    executor: Arc<dyn ReplayExecutor>,
    emitter: Arc<dyn TupleEmitter>,
    config: AccumulatorConfig,
) -> Result<ReplaySummary> {
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(executor, emitter.clone(), cancel.clone());
    let dispatch = tokio::spawn(dispatcher.run(events_rx));

    let mut accumulator = Accumulator::new(config, events_tx);
    let feed_result = feed(source, &mut accumulator, &cancel).await;
    if let Err(e) = &feed_result {
        warn!("capture feed stopped early: {e}");
    }

    accumulator.close();
    let accumulated = accumulator.stats().clone();
    // closes the event channel
    drop(accumulator);
    source.close();

    let (dispatched, dispatch_result) = dispatch
        .await
        .map_err(|e| Error::Internal(format!("dispatcher task failed: {e}")))?;
    let close_result = emitter.close().await;

    let summary = ReplaySummary::new(&accumulated, &dispatched);
    if summary.failed > 0 || dispatch_result.is_err() {
        warn!("replay finished: {summary}");
    } else {
        info!("replay finished: {summary}");
    }

    dispatch_result?;
    feed_result?;
    close_result?;
    Ok(summary)
}

async fn feed<S: CaptureSource>(
    source: &mut S,
    accumulator: &mut Accumulator,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut records = 0u64;
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("feed cancelled after {records} records");
                return Ok(());
            }
            batch = source.read_next_batch() => batch?,
        };
        if batch.is_empty() {
            debug!("capture exhausted after {records} records");
            return Ok(());
        }
        for record in &batch {
            accumulator.accept_record(record);
            source.acknowledge(&record.key());
            records += 1;
        }
    }
}
