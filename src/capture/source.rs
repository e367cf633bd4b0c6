// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Capture sources: where the replayer pulls batches of capture records from.
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, trace};

use super::observation::{CaptureRecord, RecordKey};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("io error reading capture: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed capture record on line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

/// A sequential supplier of capture records.
///
/// Records for one connection must be returned in non-decreasing chunk order.
pub trait CaptureSource {
    /// Returns the next batch of records. An empty batch marks the end of the stream.
    fn read_next_batch(
        &mut self,
    ) -> impl Future<Output = Result<Vec<CaptureRecord>, CaptureError>> + Send;

    /// Marks a record as fully folded into the accumulator so it can be checkpointed.
    fn acknowledge(&mut self, key: &RecordKey);

    fn close(&mut self);
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Reads newline-delimited JSON capture records from a file or stdin.
pub struct JsonLinesCaptureSource {
    lines: Lines<BufReader<BoxedReader>>,
    batch_size: usize,
    line_number: u64,
    acknowledged: u64,
}

impl JsonLinesCaptureSource {
    /// Opens `path`, or stdin when no path is given.
    pub async fn open(path: Option<&Path>, batch_size: usize) -> Result<Self, CaptureError> {
        let reader: BoxedReader = match path {
            Some(path) => {
                debug!("reading capture records from {}", path.display());
                Box::new(tokio::fs::File::open(path).await?)
            }
            None => {
                debug!("reading capture records from stdin");
                Box::new(tokio::io::stdin())
            }
        };
        Ok(Self::from_reader(reader, batch_size))
    }

    pub fn from_reader(reader: impl AsyncRead + Unpin + Send + 'static, batch_size: usize) -> Self {
        let reader: BoxedReader = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            batch_size: batch_size.max(1),
            line_number: 0,
            acknowledged: 0,
        }
    }

    pub fn acknowledged_count(&self) -> u64 {
        self.acknowledged
    }
}

impl CaptureSource for JsonLinesCaptureSource {
    async fn read_next_batch(&mut self) -> Result<Vec<CaptureRecord>, CaptureError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(line) = self.lines.next_line().await? else {
                break;
            };
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: CaptureRecord =
                serde_json::from_str(line).map_err(|e| CaptureError::Malformed {
                    line: self.line_number,
                    reason: e.to_string(),
                })?;
            batch.push(record);
        }
        Ok(batch)
    }

    fn acknowledge(&mut self, key: &RecordKey) {
        self.acknowledged += 1;
        trace!("acknowledged capture record {key}");
    }

    fn close(&mut self) {
        debug!(
            "closing capture source after {} lines, {} records acknowledged",
            self.line_number, self.acknowledged
        );
    }
}

/// An in-memory capture source.
#[derive(Debug, Default)]
pub struct VecCaptureSource {
    batches: VecDeque<Vec<CaptureRecord>>,
    acknowledged: Vec<RecordKey>,
    closed: bool,
}

impl VecCaptureSource {
    pub fn new(records: Vec<CaptureRecord>, batch_size: usize) -> Self {
        let mut batches = VecDeque::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            batches.push_back(records.by_ref().take(batch_size.max(1)).collect());
        }
        Self {
            batches,
            acknowledged: Vec::new(),
            closed: false,
        }
    }

    pub fn acknowledged(&self) -> &[RecordKey] {
        &self.acknowledged
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl CaptureSource for VecCaptureSource {
    async fn read_next_batch(&mut self) -> Result<Vec<CaptureRecord>, CaptureError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }

    fn acknowledge(&mut self, key: &RecordKey) {
        self.acknowledged.push(key.clone());
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
