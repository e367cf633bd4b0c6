// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Output side of a replay: each finished transaction becomes one tuple record.
use std::path::Path;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::types::SourceTargetCaptureTuple;
use crate::errors::{Error, Result};

/// Receives every finished tuple exactly once. An `Err` from `emit` ends the run.
pub trait TupleEmitter: Send + Sync + 'static {
    fn emit<'a>(&'a self, tuple: &'a SourceTargetCaptureTuple) -> BoxFuture<'a, Result<()>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

type Sink = BufWriter<Box<dyn AsyncWrite + Unpin + Send>>;

/// Writes tuples as newline-delimited JSON to a file or stdout.
pub struct JsonLinesTupleWriter {
    out: Mutex<Sink>,
}

impl JsonLinesTupleWriter {
    /// Appends to `path`, creating it if needed; writes to stdout when no path is given.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let sink: Box<dyn AsyncWrite + Unpin + Send> = match path {
            Some(path) => {
                debug!("writing tuples to {}", path.display());
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(Error::Emission)?;
                Box::new(file)
            }
            None => Box::new(tokio::io::stdout()),
        };
        Ok(Self::from_writer(sink))
    }

    pub fn from_writer(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            out: Mutex::new(BufWriter::new(writer)),
        }
    }
}

impl TupleEmitter for JsonLinesTupleWriter {
    fn emit<'a>(&'a self, tuple: &'a SourceTargetCaptureTuple) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut line = serde_json::to_vec(tuple)
                .map_err(|e| Error::Emission(std::io::Error::other(e)))?;
            line.push(b'\n');
            let mut out = self.out.lock().await;
            out.write_all(&line).await.map_err(Error::Emission)?;
            out.flush().await.map_err(Error::Emission)?;
            trace!("emitted tuple for {}", tuple.pair.key);
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut out = self.out.lock().await;
            out.flush().await.map_err(Error::Emission)?;
            out.shutdown().await.map_err(Error::Emission)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::types::{
        AggregatedRawResponse, HttpMessageAndTimestamp, RequestResponsePacketPair,
        UniqueRequestKey,
    };
    use chrono::{TimeZone, Utc};

    fn tuple(index: u64) -> SourceTargetCaptureTuple {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut request = HttpMessageAndTimestamp::default();
        request.add_packet(ts, b"GET / HTTP/1.1\r\n\r\n");
        let mut response = HttpMessageAndTimestamp::default();
        response.add_packet(ts, b"HTTP/1.1 200 OK\r\n\r\n");
        let mut pair = RequestResponsePacketPair::new(UniqueRequestKey::new("node", "conn", index), request);
        pair.response = Some(response);
        let mut target = AggregatedRawResponse::builder();
        target.add_response_packet(b"HTTP/1.1 201 Created\r\n\r\n");
        SourceTargetCaptureTuple::new(pair, target.build())
    }

    #[tokio::test]
    async fn appends_one_line_per_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuples.log");
        std::fs::write(&path, "existing\n").unwrap();

        let writer = JsonLinesTupleWriter::open(Some(&path)).await.unwrap();
        writer.emit(&tuple(0)).await.unwrap();
        writer.emit(&tuple(1)).await.unwrap();
        writer.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");

        let record: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(record["connectionId"], "conn");
        assert_eq!(record["nodeId"], "node");
        assert_eq!(record["requestIndex"], 1);
        assert_eq!(
            record["sourceRequest"]["packets"][0],
            hex::encode(b"GET / HTTP/1.1\r\n\r\n")
        );
        assert_eq!(
            record["targetResponse"][0],
            hex::encode(b"HTTP/1.1 201 Created\r\n\r\n")
        );
    }

    #[tokio::test]
    async fn unwritable_output_is_an_emission_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("tuples.log");
        assert!(matches!(
            JsonLinesTupleWriter::open(Some(&path)).await,
            Err(Error::Emission(_))
        ));
    }
}
