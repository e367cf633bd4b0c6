// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Stamps per-connection progress metadata onto captures recorded without it.
//!
//! Older captures carry neither the count of requests already seen on a connection nor whether
//! the previous chunk stopped in the middle of a client read. The accumulator needs both to pick
//! up a connection that starts partway through the capture, so this adapter recomputes them from
//! the records it has already passed along.
use std::collections::HashMap;

use super::observation::{CaptureRecord, RecordKey};
use super::source::{CaptureError, CaptureSource};

#[derive(Debug, Default)]
struct Progress {
    last_was_read: bool,
    request_count: u64,
}

impl Progress {
    fn add(&mut self, record: &CaptureRecord) {
        if let Some(last) = record.observations.last() {
            self.last_was_read = last.kind.is_read();
        }
        self.request_count += record
            .observations
            .iter()
            .filter(|o| o.kind.is_read())
            .count() as u64;
    }
}

pub struct ProgressAnnotatingSource<S> {
    inner: S,
    progress: HashMap<String, Progress>,
}

impl<S: CaptureSource> ProgressAnnotatingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            progress: HashMap::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn annotate(&mut self, mut record: CaptureRecord) -> CaptureRecord {
        let progress = self
            .progress
            .entry(record.connection_id.clone())
            .or_insert_with(|| Progress {
                // a connection first seen past its first chunk must have started before the capture
                last_was_read: record.chunk.index() != 0,
                request_count: 0,
            });
        record.last_observation_was_unterminated_read = progress.last_was_read;
        record.request_count = progress.request_count;
        progress.add(&record);
        if record.chunk.is_last() {
            self.progress.remove(&record.connection_id);
        }
        record
    }
}

impl<S: CaptureSource + Send> CaptureSource for ProgressAnnotatingSource<S> {
    async fn read_next_batch(&mut self) -> Result<Vec<CaptureRecord>, CaptureError> {
        let batch = self.inner.read_next_batch().await?;
        Ok(batch.into_iter().map(|r| self.annotate(r)).collect())
    }

    fn acknowledge(&mut self, key: &RecordKey) {
        self.inner.acknowledge(key);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
