// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Folds capture observations into HTTP transactions.
//!
//! Each connection is tracked by a small state machine:
//!
//! ```text
//! Idle -> AccumulatingRequest -> [AwaitingResponseStart] -> AccumulatingResponse
//!           ^                                                      |
//!           +-------------------- next client read ----------------+
//! ```
//!
//! The first server write after request bytes assembles the request, the next client read
//! completes the transaction, and a close, reset, idle expiry or eviction completes whatever is
//! in flight. Results leave the accumulator as [`AccumulationEvent`]s on an unbounded channel so
//! the feed loop never waits on the dispatcher.
//!
//! Idle time is measured on the capture clock: the newest observation timestamp seen so far.
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::types::{HttpMessageAndTimestamp, RequestResponsePacketPair, UniqueRequestKey};
use crate::capture::{CaptureObservation, CaptureRecord, ObservationKind};
use crate::metrics;

#[derive(Debug)]
pub enum AccumulationEvent {
    /// A request is complete and may be replayed.
    RequestAssembled {
        key: UniqueRequestKey,
        request: HttpMessageAndTimestamp,
    },
    /// The captured response for a previously assembled request is complete.
    TransactionComplete(RequestResponsePacketPair),
    /// A connection's state was released.
    ConnectionReleased {
        connection_id: String,
        reason: ReleaseReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Closed,
    Reset,
    Expired,
    Evicted,
    /// The capture ran out while the connection was still open.
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    AccumulatingRequest,
    AwaitingResponseStart,
    AccumulatingResponse,
    Closed,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccumulatorStats {
    pub connections_created: u64,
    pub requests_on_reused_connections: u64,
    pub connections_expired: u64,
    pub connections_closed: u64,
    pub connections_evicted: u64,
    pub unmatched_writes: u64,
}

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub inactivity_timeout: Duration,
    /// Upper bound on resident connections; 0 disables the bound.
    pub max_live_connections: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(crate::constants::DEFAULT_PACKET_TIMEOUT_SECS),
            max_live_connections: crate::constants::DEFAULT_MAX_LIVE_CONNECTIONS,
        }
    }
}

struct ConnectionState {
    node_id: String,
    connection_id: String,
    phase: ConnectionPhase,
    request: HttpMessageAndTimestamp,
    response: HttpMessageAndTimestamp,
    pending: Option<RequestResponsePacketPair>,
    last_activity: DateTime<Utc>,
    next_request_index: u64,
    completed_transactions: u64,
    skip_leading_reads: bool,
}

impl ConnectionState {
    fn new(node_id: &str, connection_id: &str, now: DateTime<Utc>, first_index: u64) -> Self {
        Self {
            node_id: node_id.to_string(),
            connection_id: connection_id.to_string(),
            phase: ConnectionPhase::Idle,
            request: HttpMessageAndTimestamp::default(),
            response: HttpMessageAndTimestamp::default(),
            pending: None,
            last_activity: now,
            next_request_index: first_index,
            completed_transactions: 0,
            skip_leading_reads: false,
        }
    }

    fn on_read(
        &mut self,
        obs: &CaptureObservation,
        stats: &mut AccumulatorStats,
        out: &mut Vec<AccumulationEvent>,
    ) {
        if self.skip_leading_reads {
            trace!(
                "{}: discarding read continuing a request from before the capture",
                self.connection_id
            );
            return;
        }
        match self.phase {
            ConnectionPhase::Idle => {
                self.start_request(stats);
            }
            ConnectionPhase::AccumulatingRequest => {}
            ConnectionPhase::AwaitingResponseStart | ConnectionPhase::AccumulatingResponse => {
                self.complete_transaction(out);
                self.start_request(stats);
            }
            ConnectionPhase::Closed => return,
        }
        self.request.add_packet(obs.timestamp, &obs.data);
        self.phase = ConnectionPhase::AccumulatingRequest;
    }

    fn on_write(
        &mut self,
        obs: &CaptureObservation,
        stats: &mut AccumulatorStats,
        out: &mut Vec<AccumulationEvent>,
    ) {
        self.skip_leading_reads = false;
        match self.phase {
            ConnectionPhase::Idle | ConnectionPhase::Closed => {
                stats.unmatched_writes += 1;
                metrics::UNMATCHED_WRITES.inc();
                debug!(
                    "{}: dropping {} response bytes with no pending request",
                    self.connection_id,
                    obs.data.len()
                );
                return;
            }
            ConnectionPhase::AccumulatingRequest => {
                self.assemble_request(out);
            }
            ConnectionPhase::AwaitingResponseStart | ConnectionPhase::AccumulatingResponse => {}
        }
        self.response.add_packet(obs.timestamp, &obs.data);
        self.phase = ConnectionPhase::AccumulatingResponse;
    }

    fn on_end_of_message(&mut self, out: &mut Vec<AccumulationEvent>) {
        self.skip_leading_reads = false;
        if self.phase == ConnectionPhase::AccumulatingRequest {
            self.assemble_request(out);
            self.phase = ConnectionPhase::AwaitingResponseStart;
        } else {
            trace!(
                "{}: ignoring end of message in phase {:?}",
                self.connection_id,
                self.phase
            );
        }
    }

    fn start_request(&mut self, stats: &mut AccumulatorStats) {
        if self.completed_transactions > 0 {
            stats.requests_on_reused_connections += 1;
            metrics::REUSED_CONNECTION_REQUESTS.inc();
        }
    }

    fn assemble_request(&mut self, out: &mut Vec<AccumulationEvent>) {
        let key = UniqueRequestKey::new(
            self.node_id.clone(),
            self.connection_id.clone(),
            self.next_request_index,
        );
        self.next_request_index += 1;
        let request = std::mem::take(&mut self.request);
        trace!("{key}: request assembled from {} bytes", request.len());
        out.push(AccumulationEvent::RequestAssembled {
            key: key.clone(),
            request: request.clone(),
        });
        self.pending = Some(RequestResponsePacketPair::new(key, request));
    }

    /// Pairs the buffered response with the pending request, assembling the request first if a
    /// write never arrived to do so.
    fn complete_transaction(&mut self, out: &mut Vec<AccumulationEvent>) {
        if self.pending.is_none() {
            if self.request.is_empty() {
                return;
            }
            self.assemble_request(out);
        }
        if let Some(mut pair) = self.pending.take() {
            pair.response = Some(std::mem::take(&mut self.response));
            trace!("{}: transaction complete", pair.key);
            out.push(AccumulationEvent::TransactionComplete(pair));
            self.completed_transactions += 1;
        }
        self.phase = ConnectionPhase::Idle;
    }

    fn release(&mut self, reason: ReleaseReason, out: &mut Vec<AccumulationEvent>) {
        self.complete_transaction(out);
        self.phase = ConnectionPhase::Closed;
        out.push(AccumulationEvent::ConnectionReleased {
            connection_id: self.connection_id.clone(),
            reason,
        });
    }
}

pub struct Accumulator {
    config: AccumulatorConfig,
    connections: HashMap<String, ConnectionState>,
    /// Live connections ordered by last activity, oldest first.
    by_activity: BTreeSet<(DateTime<Utc>, String)>,
    /// Next request index of connections expired or evicted before their capture ended.
    resume_from: HashMap<String, u64>,
    clock: Option<DateTime<Utc>>,
    stats: AccumulatorStats,
    events: mpsc::UnboundedSender<AccumulationEvent>,
}

impl Accumulator {
    pub fn new(config: AccumulatorConfig, events: mpsc::UnboundedSender<AccumulationEvent>) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            by_activity: BTreeSet::new(),
            resume_from: HashMap::new(),
            clock: None,
            stats: AccumulatorStats::default(),
            events,
        }
    }

    pub fn stats(&self) -> &AccumulatorStats {
        &self.stats
    }

    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn phase(&self, connection_id: &str) -> Option<ConnectionPhase> {
        self.connections.get(connection_id).map(|c| c.phase)
    }

    /// Folds every observation of `record` in order.
    pub fn accept_record(&mut self, record: &CaptureRecord) {
        for obs in &record.observations {
            self.accept_observation(record, obs);
        }
        if record.chunk.is_last() && self.connections.contains_key(&record.connection_id) {
            debug!(
                "{}: final chunk reached without a close, closing",
                record.connection_id
            );
            self.release(&record.connection_id, ReleaseReason::Closed);
        }
        if record.chunk.is_last() {
            self.resume_from.remove(&record.connection_id);
        }
    }

    fn accept_observation(&mut self, record: &CaptureRecord, obs: &CaptureObservation) {
        let now = self.advance_clock(obs.timestamp);
        let connection_id = record.connection_id.as_str();

        let stale = self
            .connections
            .get(connection_id)
            .is_some_and(|c| self.is_idle(c, now));
        if stale {
            // the connection went quiet for too long; whatever arrives now starts over, but keeps
            // counting requests so keys stay unique
            let next_index = self.release(connection_id, ReleaseReason::Expired);
            if let (Some(next_index), false) = (next_index, obs.kind.is_termination()) {
                self.create(&record.node_id, connection_id, now, next_index, false);
            }
        }
        self.expire_idle(now);

        if !self.connections.contains_key(connection_id) {
            if obs.kind.is_termination() {
                trace!("{connection_id}: {:?} for unknown connection", obs.kind);
                self.resume_from.remove(connection_id);
                return;
            }
            let resumed = record.chunk.index() != 0;
            let first_index = if resumed { record.request_count } else { 0 };
            let skip = resumed && record.last_observation_was_unterminated_read;
            self.create(&record.node_id, connection_id, obs.timestamp, first_index, skip);
        }

        self.touch(connection_id, obs.timestamp);

        let mut out = Vec::new();
        match obs.kind {
            ObservationKind::ConnectionClose => {
                self.release(connection_id, ReleaseReason::Closed);
                return;
            }
            ObservationKind::ConnectionReset => {
                self.release(connection_id, ReleaseReason::Reset);
                return;
            }
            _ => {}
        }

        let Some(state) = self.connections.get_mut(connection_id) else {
            return;
        };
        match obs.kind {
            ObservationKind::ClientRead | ObservationKind::ClientReadSegment => {
                state.on_read(obs, &mut self.stats, &mut out)
            }
            ObservationKind::ServerWrite | ObservationKind::ServerWriteSegment => {
                state.on_write(obs, &mut self.stats, &mut out)
            }
            ObservationKind::EndOfMessage => state.on_end_of_message(&mut out),
            ObservationKind::ConnectionOpen => {
                trace!("{connection_id}: open observed in phase {:?}", state.phase);
            }
            ObservationKind::Other
            | ObservationKind::ConnectionClose
            | ObservationKind::ConnectionReset => {}
        }
        self.send_all(out);
    }

    /// Releases every connection idle for longer than the inactivity timeout as of `now`.
    /// Returns how many were expired.
    pub fn expire_idle(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for (last_activity, connection_id) in &self.by_activity {
            if !self.is_past_timeout(*last_activity, now) {
                break;
            }
            expired.push(connection_id.clone());
        }
        for connection_id in &expired {
            debug!("{connection_id}: expiring idle connection");
            self.release(connection_id, ReleaseReason::Expired);
        }
        expired.len()
    }

    /// Releases every remaining connection as if it had been closed.
    pub fn close(&mut self) {
        let remaining: Vec<String> = self.connections.keys().cloned().collect();
        if !remaining.is_empty() {
            debug!("flushing {} connections left open", remaining.len());
        }
        for connection_id in remaining {
            self.release(&connection_id, ReleaseReason::Flushed);
        }
        self.resume_from.clear();
    }

    fn advance_clock(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let now = match self.clock {
            Some(clock) if clock >= timestamp => clock,
            _ => timestamp,
        };
        self.clock = Some(now);
        now
    }

    fn is_idle(&self, state: &ConnectionState, now: DateTime<Utc>) -> bool {
        self.is_past_timeout(state.last_activity, now)
    }

    fn is_past_timeout(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - last_activity).to_std() {
            Ok(idle) => idle > self.config.inactivity_timeout,
            Err(_) => false,
        }
    }

    fn create(
        &mut self,
        node_id: &str,
        connection_id: &str,
        now: DateTime<Utc>,
        first_index: u64,
        skip_leading_reads: bool,
    ) {
        if self.config.max_live_connections > 0
            && self.connections.len() >= self.config.max_live_connections
        {
            self.make_room(now);
        }
        let first_index = match self.resume_from.remove(connection_id) {
            Some(resumed) => resumed.max(first_index),
            None => first_index,
        };
        let mut state = ConnectionState::new(node_id, connection_id, now, first_index);
        state.skip_leading_reads = skip_leading_reads;
        self.by_activity.insert((now, connection_id.to_string()));
        self.connections.insert(connection_id.to_string(), state);
        self.stats.connections_created += 1;
        metrics::CONNECTIONS_CREATED.inc();
    }

    fn make_room(&mut self, now: DateTime<Utc>) {
        self.expire_idle(now);
        while self.connections.len() >= self.config.max_live_connections {
            let Some((_, oldest)) = self.by_activity.first().cloned() else {
                break;
            };
            warn!(
                "{oldest}: evicting least recently active connection, {} connections live",
                self.connections.len()
            );
            self.release(&oldest, ReleaseReason::Evicted);
        }
    }

    fn touch(&mut self, connection_id: &str, timestamp: DateTime<Utc>) {
        if let Some(state) = self.connections.get_mut(connection_id) {
            if timestamp <= state.last_activity {
                return;
            }
            self.by_activity
                .remove(&(state.last_activity, connection_id.to_string()));
            state.last_activity = timestamp;
            self.by_activity.insert((timestamp, connection_id.to_string()));
        }
    }

    /// Finalizes and drops a connection, returning the request index it would have used next.
    fn release(&mut self, connection_id: &str, reason: ReleaseReason) -> Option<u64> {
        let mut state = self.connections.remove(connection_id)?;
        self.by_activity
            .remove(&(state.last_activity, connection_id.to_string()));
        match reason {
            ReleaseReason::Closed | ReleaseReason::Reset | ReleaseReason::Flushed => {
                self.stats.connections_closed += 1;
                metrics::CONNECTIONS_CLOSED.inc();
            }
            ReleaseReason::Expired => {
                self.stats.connections_expired += 1;
                metrics::CONNECTIONS_EXPIRED.inc();
            }
            ReleaseReason::Evicted => {
                self.stats.connections_evicted += 1;
                metrics::CONNECTIONS_EVICTED.inc();
            }
        }
        let mut out = Vec::new();
        state.release(reason, &mut out);
        self.send_all(out);
        match reason {
            ReleaseReason::Expired | ReleaseReason::Evicted => {
                self.resume_from
                    .insert(connection_id.to_string(), state.next_request_index);
            }
            ReleaseReason::Closed | ReleaseReason::Reset | ReleaseReason::Flushed => {
                self.resume_from.remove(connection_id);
            }
        }
        Some(state.next_request_index)
    }

    fn send_all(&self, events: Vec<AccumulationEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                debug!("dispatcher is gone, dropping accumulation event");
                return;
            }
        }
    }
}
