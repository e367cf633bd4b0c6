use prometheus::{
    exponential_buckets, register_counter, register_histogram, Counter, Histogram,
    HistogramOpts, Opts,
};
use std::sync::LazyLock;

// Accumulator counters
pub static CONNECTIONS_CREATED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_connections_created_total",
        "Captured connections the accumulator started tracking"
    ))
    .unwrap()
});

pub static REUSED_CONNECTION_REQUESTS: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_reused_connection_requests_total",
        "Requests observed on a keep-alive connection after its first transaction"
    ))
    .unwrap()
});

pub static CONNECTIONS_EXPIRED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_connections_expired_total",
        "Captured connections finalized after going idle"
    ))
    .unwrap()
});

pub static CONNECTIONS_CLOSED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_connections_closed_total",
        "Captured connections finalized by a close, reset or end of capture"
    ))
    .unwrap()
});

pub static CONNECTIONS_EVICTED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_connections_evicted_total",
        "Captured connections finalized early to stay under the live connection limit"
    ))
    .unwrap()
});

pub static UNMATCHED_WRITES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_unmatched_writes_total",
        "Server writes dropped because no request was pending"
    ))
    .unwrap()
});

// Dispatcher counters
pub static REPLAYS_SUCCEEDED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_replays_succeeded_total",
        "Transactions whose replay completed and whose tuple was emitted"
    ))
    .unwrap()
});

pub static REPLAYS_FAILED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "trafficreplay_replays_failed_total",
        "Transactions whose replay against the target failed"
    ))
    .unwrap()
});

// Histograms
pub static REPLAY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(HistogramOpts::new(
        "trafficreplay_replay_duration_seconds",
        "Time from sending a request to the target until its response was complete"
    )
    .buckets(exponential_buckets(0.001, 2.0, 15).unwrap()))
    .unwrap()
});

/// Touches every metric so they are exported with zero values before the first event.
pub fn init_metrics() {
    LazyLock::force(&CONNECTIONS_CREATED);
    LazyLock::force(&REUSED_CONNECTION_REQUESTS);
    LazyLock::force(&CONNECTIONS_EXPIRED);
    LazyLock::force(&CONNECTIONS_CLOSED);
    LazyLock::force(&CONNECTIONS_EVICTED);
    LazyLock::force(&UNMATCHED_WRITES);
    LazyLock::force(&REPLAYS_SUCCEEDED);
    LazyLock::force(&REPLAYS_FAILED);
    LazyLock::force(&REPLAY_DURATION);
}

/// Renders the default registry in the text exposition format.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
