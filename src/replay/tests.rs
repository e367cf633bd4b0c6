// SPDX-License-Identifier: BSD-3-Clause-LBNL
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::*;
use crate::capture::{CaptureObservation, CaptureRecord, ChunkPosition, VecCaptureSource};
use crate::errors::{Error, Result};

type Script = dyn Fn(&UniqueRequestKey, &[u8]) -> std::result::Result<Vec<u8>, ReplayError>
    + Send
    + Sync;

/// Answers each submission from a closure, optionally after a delay.
struct ScriptedExecutor {
    script: Box<Script>,
    delay: Duration,
    submitted: Mutex<Vec<UniqueRequestKey>>,
    shut_down: AtomicBool,
}

impl ScriptedExecutor {
    fn new<F>(script: F) -> Self
    where
        F: Fn(&UniqueRequestKey, &[u8]) -> std::result::Result<Vec<u8>, ReplayError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn echo() -> Self {
        Self::new(|_, request| {
            let mut response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
            response.extend_from_slice(request);
            Ok(response)
        })
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ReplayExecutor for ScriptedExecutor {
    fn submit(
        &self,
        key: &UniqueRequestKey,
        request: &HttpMessageAndTimestamp,
    ) -> BoxFuture<'static, std::result::Result<AggregatedRawResponse, ReplayError>> {
        assert!(!self.shut_down.load(Ordering::SeqCst), "submit after shutdown");
        self.submitted.lock().unwrap().push(key.clone());
        let outcome = (self.script)(key, &request.to_bytes());
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            let bytes = outcome?;
            let mut response = AggregatedRawResponse::builder();
            if !bytes.is_empty() {
                response.add_response_packet(&bytes);
            }
            Ok(response.build())
        }
        .boxed()
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Records every tuple; fails with an I/O error once `fail_after` tuples were accepted.
#[derive(Default)]
struct MemoryEmitter {
    tuples: Mutex<Vec<SourceTargetCaptureTuple>>,
    fail_after: Option<usize>,
    closed: AtomicUsize,
}

impl MemoryEmitter {
    fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Default::default()
        }
    }

    fn tuples(&self) -> Vec<SourceTargetCaptureTuple> {
        let mut tuples = self.tuples.lock().unwrap().clone();
        tuples.sort_by(|a, b| a.pair.key.cmp(&b.pair.key));
        tuples
    }
}

impl TupleEmitter for MemoryEmitter {
    fn emit<'a>(&'a self, tuple: &'a SourceTargetCaptureTuple) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut tuples = self.tuples.lock().unwrap();
            if self.fail_after.is_some_and(|n| tuples.len() >= n) {
                return Err(Error::Emission(std::io::Error::other("disk full")));
            }
            tuples.push(tuple.clone());
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn record(connection_id: &str, observations: Vec<CaptureObservation>) -> CaptureRecord {
    CaptureRecord::new("node", connection_id, ChunkPosition::Number(0), observations)
}

fn keep_alive_connection(connection_id: &str, start: i64) -> CaptureRecord {
    record(
        connection_id,
        vec![
            CaptureObservation::read(at(start), b"GET /a HTTP/1.1\r\n\r\n".to_vec()),
            CaptureObservation::write(at(start), b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
            CaptureObservation::read(at(start + 1), b"GET /b HTTP/1.1\r\n\r\n".to_vec()),
            CaptureObservation::write(at(start + 1), b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()),
            CaptureObservation::close(at(start + 2)),
        ],
    )
}

async fn run(
    records: Vec<CaptureRecord>,
    executor: Arc<ScriptedExecutor>,
    emitter: Arc<MemoryEmitter>,
) -> (VecCaptureSource, Result<ReplaySummary>) {
    let mut source = VecCaptureSource::new(records, 2);
    let result = replay(
        &mut source,
        executor,
        emitter,
        AccumulatorConfig {
            inactivity_timeout: Duration::from_secs(30),
            max_live_connections: 0,
        },
    )
    .await;
    (source, result)
}

#[tokio::test]
async fn every_key_is_emitted_exactly_once() {
    let executor = Arc::new(ScriptedExecutor::echo().with_delay(Duration::from_millis(20)));
    let emitter = Arc::new(MemoryEmitter::default());
    let records = (0..5)
        .map(|i| keep_alive_connection(&format!("conn-{i}"), i))
        .collect();

    let (source, result) = run(records, executor.clone(), emitter.clone()).await;
    let summary = result.unwrap();

    assert_eq!(summary.connections_created, 5);
    assert_eq!(summary.reused_connection_requests, 5);
    assert_eq!(summary.closed, 5);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.failed, 0);

    let tuples = emitter.tuples();
    assert_eq!(tuples.len(), 10);
    let mut keys: Vec<_> = tuples.iter().map(|t| t.pair.key.clone()).collect();
    keys.dedup();
    assert_eq!(keys.len(), 10);

    let mut submitted = executor.submitted.lock().unwrap().clone();
    submitted.sort();
    assert_eq!(submitted, keys);

    assert!(executor.shut_down.load(Ordering::SeqCst));
    assert_eq!(emitter.closed.load(Ordering::SeqCst), 1);
    assert_eq!(source.acknowledged().len(), 5);
    assert!(source.is_closed());
}

#[tokio::test]
async fn tuples_pair_capture_with_target_response() {
    let executor = Arc::new(ScriptedExecutor::echo());
    let emitter = Arc::new(MemoryEmitter::default());

    let (_, result) = run(vec![keep_alive_connection("c", 0)], executor, emitter.clone()).await;
    result.unwrap();

    let tuples = emitter.tuples();
    assert_eq!(tuples.len(), 2);
    let second = &tuples[1];
    assert_eq!(second.pair.key, UniqueRequestKey::new("node", "c", 1));
    assert_eq!(second.pair.request.to_bytes(), b"GET /b HTTP/1.1\r\n\r\n".to_vec());
    assert_eq!(
        second.pair.response.as_ref().unwrap().to_bytes(),
        b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()
    );
    assert_eq!(
        second.target_response.concat(),
        b"HTTP/1.1 200 OK\r\n\r\nGET /b HTTP/1.1\r\n\r\n".to_vec()
    );
}

#[tokio::test]
async fn failed_replays_still_produce_tuples() {
    let executor = Arc::new(ScriptedExecutor::new(|key, _| {
        if key.request_index == 0 {
            Err(ReplayError::EmptyResponse)
        } else {
            Ok(Vec::new())
        }
    }));
    let emitter = Arc::new(MemoryEmitter::default());

    let (_, result) = run(vec![keep_alive_connection("c", 0)], executor, emitter.clone()).await;
    let summary = result.unwrap();

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 2);
    let tuples = emitter.tuples();
    assert_eq!(tuples.len(), 2);
    for tuple in tuples {
        assert!(tuple.target_response.is_empty());
        assert_eq!(tuple.target_response_duration, Duration::ZERO);
        assert!(tuple.pair.response.is_some());
    }
}

#[tokio::test]
async fn unterminated_connections_are_flushed_at_the_end() {
    let executor = Arc::new(ScriptedExecutor::echo());
    let emitter = Arc::new(MemoryEmitter::default());
    let records = vec![
        // never answered
        record(
            "pending",
            vec![CaptureObservation::read(at(0), b"GET / HTTP/1.1\r\n\r\n".to_vec())],
        ),
        // answered but never closed
        record(
            "open",
            vec![
                CaptureObservation::read(at(0), b"GET / HTTP/1.1\r\n\r\n".to_vec()),
                CaptureObservation::write(at(0), b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
            ],
        ),
    ];

    let (_, result) = run(records, executor, emitter.clone()).await;
    let summary = result.unwrap();

    assert_eq!(summary.closed, 2);
    assert_eq!(summary.succeeded, 2);
    let tuples = emitter.tuples();
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples[1].pair.key.connection_id, "pending");
    assert!(tuples[1]
        .pair
        .response
        .as_ref()
        .is_none_or(HttpMessageAndTimestamp::is_empty));
}

#[tokio::test]
async fn idle_connections_expire_on_the_capture_clock() {
    let executor = Arc::new(ScriptedExecutor::echo());
    let emitter = Arc::new(MemoryEmitter::default());
    let records = vec![
        record(
            "quiet",
            vec![CaptureObservation::read(at(0), b"GET / HTTP/1.1\r\n\r\n".to_vec())],
        ),
        keep_alive_connection("busy", 120),
    ];

    let (_, result) = run(records, executor, emitter.clone()).await;
    let summary = result.unwrap();

    assert_eq!(summary.expired, 1);
    assert_eq!(summary.closed, 1);
    assert_eq!(emitter.tuples().len(), 3);
}

#[tokio::test]
async fn emission_failure_aborts_the_run() {
    let executor = Arc::new(ScriptedExecutor::echo());
    let emitter = Arc::new(MemoryEmitter::failing_after(1));
    let records = (0..4)
        .map(|i| keep_alive_connection(&format!("conn-{i}"), i))
        .collect();

    let (source, result) = run(records, executor.clone(), emitter.clone()).await;

    assert!(matches!(result, Err(Error::Emission(_))));
    assert_eq!(emitter.tuples().len(), 1);
    assert!(executor.shut_down.load(Ordering::SeqCst));
    assert!(source.is_closed());
}

#[tokio::test]
async fn replays_against_a_live_target() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 512];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let body = if request.starts_with(b"GET /a") { "alpha" } else { "beta" };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{body}\r\n0\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    let executor = TargetReplayExecutor::new(TargetSettings {
        target: url::Url::parse(&format!("http://{addr}")).unwrap(),
        tls_mode: TlsMode::Verify,
        authorization: None,
        request_timeout: Duration::from_secs(5),
        max_concurrent_requests: 2,
    })
    .unwrap();
    let emitter = Arc::new(MemoryEmitter::default());
    let mut source = VecCaptureSource::new(vec![keep_alive_connection("live", 0)], 8);

    let summary = replay(
        &mut source,
        Arc::new(executor),
        emitter.clone(),
        AccumulatorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 2);
    let tuples = emitter.tuples();
    let first = String::from_utf8(tuples[0].target_response.concat()).unwrap();
    let second = String::from_utf8(tuples[1].target_response.concat()).unwrap();
    assert!(first.ends_with("5\r\nalpha\r\n0\r\n\r\n"));
    assert!(second.ends_with("4\r\nbeta\r\n0\r\n\r\n"));
    assert!(tuples[0].target_response_duration > Duration::ZERO);
}

#[tokio::test]
async fn connection_resumed_after_sweep_gets_fresh_keys() {
    let executor = Arc::new(ScriptedExecutor::echo().with_delay(Duration::from_millis(300)));
    let emitter = Arc::new(MemoryEmitter::default());
    let records = vec![
        record(
            "c",
            vec![
                CaptureObservation::read(at(0), b"GET /a HTTP/1.1\r\n\r\n".to_vec()),
                CaptureObservation::write(at(0), b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
            ],
        ),
        // sweeps the idle "c"
        record(
            "d",
            vec![CaptureObservation::read(at(100), b"GET /d HTTP/1.1\r\n\r\n".to_vec())],
        ),
        CaptureRecord::new(
            "node",
            "c",
            ChunkPosition::Number(1),
            vec![
                CaptureObservation::read(at(101), b"GET /b HTTP/1.1\r\n\r\n".to_vec()),
                CaptureObservation::write(at(101), b"HTTP/1.1 200 OK\r\n\r\n".to_vec()),
                CaptureObservation::close(at(101)),
            ],
        ),
    ];

    let (_, result) = run(records, executor.clone(), emitter.clone()).await;
    let summary = result.unwrap();

    assert_eq!(summary.succeeded, 3);
    let emitted: Vec<String> = emitter.tuples().iter().map(|t| t.pair.key.to_string()).collect();
    assert_eq!(emitted, vec!["node.c.0", "node.c.1", "node.d.0"]);
    let mut submitted: Vec<String> = executor
        .submitted
        .lock()
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    submitted.sort();
    assert_eq!(submitted, emitted);
}

#[tokio::test]
async fn response_with_error_cause_counts_as_failed() {
    let emitter = Arc::new(MemoryEmitter::default());
    let mut source = VecCaptureSource::new(vec![keep_alive_connection("c", 0)], 8);

    let summary = replay(
        &mut source,
        Arc::new(PartialResponseExecutor),
        emitter.clone(),
        AccumulatorConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 2);
    for tuple in emitter.tuples() {
        assert!(tuple.target_response.is_empty());
    }
}

/// Returns a truncated response carrying the read error that cut it short.
struct PartialResponseExecutor;

impl ReplayExecutor for PartialResponseExecutor {
    fn submit(
        &self,
        _key: &UniqueRequestKey,
        _request: &HttpMessageAndTimestamp,
    ) -> BoxFuture<'static, std::result::Result<AggregatedRawResponse, ReplayError>> {
        async {
            let mut response = AggregatedRawResponse::builder();
            response
                .add_response_packet(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
                .add_error_cause("connection reset by peer");
            Ok(response.build())
        }
        .boxed()
    }

    fn shutdown(&self) {}
}
