// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Joins accumulator events with replay results and hands finished tuples to the emitter.
//!
//! The dispatcher owns the in-flight table outright. Every key moves through one lineage:
//! `AwaitingReplay` when its request is assembled, `AwaitingFinalize` once the captured
//! transaction is complete, and out of the table when the finalize task reports back.
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::accumulator::AccumulationEvent;
use super::emitter::TupleEmitter;
use super::executor::{ReplayError, ReplayExecutor};
use super::types::{
    AggregatedRawResponse, RequestResponsePacketPair, SourceTargetCaptureTuple, UniqueRequestKey,
};
use crate::errors::{Error, Result};
use crate::metrics;

type ReplayHandle = JoinHandle<std::result::Result<AggregatedRawResponse, ReplayError>>;

enum Lineage {
    AwaitingReplay(ReplayHandle),
    AwaitingFinalize(JoinHandle<()>),
}

/// How a finalize task ended.
enum Outcome {
    Done,
    Failed,
    Fatal(Error),
}

struct Completion {
    key: UniqueRequestKey,
    outcome: Outcome,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    executor: Arc<dyn ReplayExecutor>,
    emitter: Arc<dyn TupleEmitter>,
    inflight: HashMap<UniqueRequestKey, Lineage>,
    finalizing: usize,
    stats: DispatchStats,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn ReplayExecutor>,
        emitter: Arc<dyn TupleEmitter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            emitter,
            inflight: HashMap::new(),
            finalizing: 0,
            stats: DispatchStats::default(),
            cancel,
        }
    }

    /// Runs until the event channel closes and every finalization has reported back, or until
    /// the emitter fails. The replay transport is shut down on the way out in both cases.
    pub async fn run(
        mut self,
        mut events: UnboundedReceiver<AccumulationEvent>,
    ) -> (DispatchStats, Result<()>) {
        let (completions_tx, mut completions) = mpsc::unbounded_channel();
        let mut events_open = true;

        while events_open || self.finalizing > 0 {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event, &completions_tx),
                    None => {
                        debug!("event stream closed, draining {} finalizations", self.finalizing);
                        events_open = false;
                    }
                },
                Some(completion) = completions.recv() => {
                    if let Err(e) = self.complete(completion) {
                        error!("aborting replay: {e}");
                        self.cancel.cancel();
                        self.abort_all();
                        self.executor.shutdown();
                        return (self.stats, Err(e));
                    }
                }
            }
        }

        let result = self.check_drained();
        self.executor.shutdown();
        (self.stats, result)
    }

    fn handle_event(&mut self, event: AccumulationEvent, completions: &UnboundedSender<Completion>) {
        match event {
            AccumulationEvent::RequestAssembled { key, request } => {
                trace!("{key}: request assembled ({} bytes)", request.len());
                let replay = tokio::spawn(self.executor.submit(&key, &request));
                if let Some(previous) = self.inflight.insert(key.clone(), Lineage::AwaitingReplay(replay)) {
                    error!("{key}: request assembled twice");
                    self.inflight.insert(key, previous);
                }
            }
            AccumulationEvent::TransactionComplete(pair) => self.finalize(pair, completions),
            AccumulationEvent::ConnectionReleased {
                connection_id,
                reason,
            } => trace!("connection {connection_id} released ({reason:?})"),
        }
    }

    fn finalize(&mut self, pair: RequestResponsePacketPair, completions: &UnboundedSender<Completion>) {
        let key = pair.key.clone();
        let replay = match self.inflight.remove(&key) {
            Some(Lineage::AwaitingReplay(handle)) => Some(handle),
            Some(lineage @ Lineage::AwaitingFinalize(_)) => {
                error!("{key}: transaction completed twice");
                self.inflight.insert(key, lineage);
                return;
            }
            None => {
                warn!("{key}: transaction completed without a replay");
                None
            }
        };

        let emitter = self.emitter.clone();
        let completions = completions.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let outcome = finish_transaction(pair, replay, emitter.as_ref()).await;
            if completions.send(Completion { key: task_key, outcome }).is_err() {
                trace!("dispatcher gone, dropping completion");
            }
        });
        self.inflight.insert(key, Lineage::AwaitingFinalize(task));
        self.finalizing += 1;
    }

    fn complete(&mut self, completion: Completion) -> Result<()> {
        let key = completion.key;
        match self.inflight.remove(&key) {
            Some(Lineage::AwaitingFinalize(_)) => self.finalizing -= 1,
            Some(lineage) => {
                self.inflight.insert(key.clone(), lineage);
                return Err(Error::Internal(format!("{key}: finalized before its transaction completed")));
            }
            None => return Err(Error::Internal(format!("{key}: finalized twice"))),
        }

        match completion.outcome {
            Outcome::Done => {
                self.stats.succeeded += 1;
                metrics::REPLAYS_SUCCEEDED.inc();
                Ok(())
            }
            Outcome::Failed => {
                self.stats.failed += 1;
                metrics::REPLAYS_FAILED.inc();
                Ok(())
            }
            Outcome::Fatal(e) => Err(e),
        }
    }

    fn check_drained(&mut self) -> Result<()> {
        if self.inflight.is_empty() {
            return Ok(());
        }
        let stranded = self.inflight.len();
        for (key, lineage) in self.inflight.drain() {
            error!("{key}: never finalized");
            match lineage {
                Lineage::AwaitingReplay(handle) => handle.abort(),
                Lineage::AwaitingFinalize(handle) => handle.abort(),
            }
        }
        Err(Error::Internal(format!("{stranded} transactions left in flight at shutdown")))
    }

    fn abort_all(&mut self) {
        if !self.inflight.is_empty() {
            info!("abandoning {} in-flight transactions", self.inflight.len());
        }
        for (_, lineage) in self.inflight.drain() {
            match lineage {
                Lineage::AwaitingReplay(handle) => handle.abort(),
                Lineage::AwaitingFinalize(handle) => handle.abort(),
            }
        }
        self.finalizing = 0;
    }
}

/// Waits for the replay, builds the tuple and emits it. A failed replay still yields a tuple,
/// with no target packets.
async fn finish_transaction(
    pair: RequestResponsePacketPair,
    replay: Option<ReplayHandle>,
    emitter: &dyn TupleEmitter,
) -> Outcome {
    let key = pair.key.clone();
    let result = match replay {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplayError::Task(e.to_string())),
        },
        None => Err(ReplayError::Task("no replay was started".into())),
    };

    let (tuple, succeeded) = match result {
        Ok(response) if response.error.is_none() && response.response_size > 0 => {
            metrics::REPLAY_DURATION.observe(response.response_duration.as_secs_f64());
            (SourceTargetCaptureTuple::new(pair, response), true)
        }
        Ok(response) => {
            let cause = response.error.unwrap_or_else(|| ReplayError::EmptyResponse.to_string());
            warn!("{key}: replay failed: {cause}");
            (SourceTargetCaptureTuple::failed(pair), false)
        }
        Err(e) => {
            warn!("{key}: replay failed: {e}");
            (SourceTargetCaptureTuple::failed(pair), false)
        }
    };

    match emitter.emit(&tuple).await {
        Ok(()) if succeeded => Outcome::Done,
        Ok(()) => Outcome::Failed,
        Err(e) => Outcome::Fatal(e),
    }
}
