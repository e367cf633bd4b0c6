// SPDX-License-Identifier: BSD-3-Clause-LBNL
pub mod capture;
pub mod config;
pub mod constants;
pub mod errors;
pub mod metrics;
pub mod replay;

use std::sync::Arc;
use tracing::{info, trace};

use crate::capture::{JsonLinesCaptureSource, ProgressAnnotatingSource};
use crate::config::ReplayOptions;
use crate::errors::Result;
use crate::replay::{
    AccumulatorConfig, JsonLinesTupleWriter, ReplaySummary, TargetReplayExecutor, TargetSettings,
};

/// Replays the capture named by `options` against its target and writes one tuple per
/// transaction.
pub async fn run_replay(options: ReplayOptions) -> Result<ReplaySummary> {
    metrics::init_metrics();

    let executor = Arc::new(TargetReplayExecutor::new(TargetSettings {
        target: options.target.clone(),
        tls_mode: options.tls_mode,
        authorization: options.authorization.clone(),
        request_timeout: options.request_timeout,
        max_concurrent_requests: options.max_concurrent_requests,
    })?);
    let emitter = Arc::new(JsonLinesTupleWriter::open(options.output.as_deref()).await?);
    let source = JsonLinesCaptureSource::open(options.input.as_deref(), options.batch_size).await?;
    let accumulator = AccumulatorConfig {
        inactivity_timeout: options.inactivity_timeout,
        max_live_connections: options.max_live_connections,
    };

    info!("replaying captured traffic against {}", options.target);
    let summary = if options.annotate_progress {
        let mut source = ProgressAnnotatingSource::new(source);
        replay::replay(&mut source, executor, emitter, accumulator).await?
    } else {
        let mut source = source;
        replay::replay(&mut source, executor, emitter, accumulator).await?
    };

    trace!("metrics at exit:\n{}", metrics::render());
    Ok(summary)
}
