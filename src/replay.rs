// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Turning captured connections into replayed transactions.
//!
//! [`accumulator`] folds capture records into requests and responses, [`dispatcher`] pairs them
//! with what the [`executor`] got back from the target, and [`emitter`] writes the resulting
//! tuples. [`runner::replay`] wires the pieces together for one run.
pub mod accumulator;
pub mod dispatcher;
pub mod emitter;
pub mod executor;
pub mod framing;
pub mod runner;
pub mod tls;
pub mod transform;
pub mod types;

#[cfg(test)]
mod tests;

pub use accumulator::{AccumulationEvent, Accumulator, AccumulatorConfig, AccumulatorStats};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use emitter::{JsonLinesTupleWriter, TupleEmitter};
pub use executor::{ReplayError, ReplayExecutor, TargetReplayExecutor, TargetSettings};
pub use runner::{replay, ReplaySummary};
pub use tls::TlsMode;
pub use types::{
    AggregatedRawResponse, HttpMessageAndTimestamp, RequestResponsePacketPair,
    SourceTargetCaptureTuple, UniqueRequestKey,
};
