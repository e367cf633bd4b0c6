// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Capture records as delivered by a capture source, and the observations they carry.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened on the captured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationKind {
    /// Bytes read from the client (request direction).
    #[serde(rename = "read")]
    ClientRead,
    /// One piece of a client read that the capture split up.
    #[serde(rename = "readSegment")]
    ClientReadSegment,
    /// Bytes written by the server (response direction).
    #[serde(rename = "write")]
    ServerWrite,
    /// One piece of a server write that the capture split up.
    #[serde(rename = "writeSegment")]
    ServerWriteSegment,
    #[serde(rename = "open")]
    ConnectionOpen,
    #[serde(rename = "close")]
    ConnectionClose,
    #[serde(rename = "reset")]
    ConnectionReset,
    /// The capture determined that the client finished sending its request.
    #[serde(rename = "endOfMessage")]
    EndOfMessage,
    #[serde(rename = "other")]
    Other,
}

impl ObservationKind {
    pub fn is_read(self) -> bool {
        matches!(self, Self::ClientRead | Self::ClientReadSegment)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::ServerWrite | Self::ServerWriteSegment)
    }

    pub fn is_termination(self) -> bool {
        matches!(self, Self::ConnectionClose | Self::ConnectionReset)
    }
}

/// A single event within a capture record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureObservation {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub kind: ObservationKind,
    /// Payload for read and write kinds; empty otherwise.
    #[serde(default, with = "hex::serde", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl CaptureObservation {
    pub fn new(timestamp: DateTime<Utc>, kind: ObservationKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            kind,
            data: data.into(),
        }
    }

    pub fn read(timestamp: DateTime<Utc>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(timestamp, ObservationKind::ClientRead, data)
    }

    pub fn write(timestamp: DateTime<Utc>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(timestamp, ObservationKind::ServerWrite, data)
    }

    pub fn open(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, ObservationKind::ConnectionOpen, Vec::new())
    }

    pub fn close(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, ObservationKind::ConnectionClose, Vec::new())
    }

    pub fn reset(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, ObservationKind::ConnectionReset, Vec::new())
    }

    pub fn end_of_message(timestamp: DateTime<Utc>) -> Self {
        Self::new(timestamp, ObservationKind::EndOfMessage, Vec::new())
    }
}

/// Where a record sits in its connection's sequence of chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkPosition {
    #[serde(rename = "number")]
    Number(u32),
    /// The connection's final chunk; no further records follow for it.
    #[serde(rename = "lastChunkNumber")]
    Last(u32),
}

impl ChunkPosition {
    pub fn index(&self) -> u32 {
        match self {
            Self::Number(n) | Self::Last(n) => *n,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Self::Last(_))
    }
}

/// A batch of observations for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub node_id: String,
    pub connection_id: String,
    #[serde(flatten)]
    pub chunk: ChunkPosition,
    /// Number of requests the capture had already seen on this connection before this chunk.
    #[serde(default)]
    pub request_count: u64,
    /// The previous chunk for this connection ended in the middle of a client read.
    #[serde(default)]
    pub last_observation_was_unterminated_read: bool,
    #[serde(default)]
    pub observations: Vec<CaptureObservation>,
}

impl CaptureRecord {
    pub fn new(
        node_id: impl Into<String>,
        connection_id: impl Into<String>,
        chunk: ChunkPosition,
        observations: Vec<CaptureObservation>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
            chunk,
            request_count: 0,
            last_observation_was_unterminated_read: false,
            observations,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            node_id: self.node_id.clone(),
            connection_id: self.connection_id.clone(),
            chunk_index: self.chunk.index(),
        }
    }
}

/// Identifies a capture record for acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub node_id: String,
    pub connection_id: String,
    pub chunk_index: u32,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.node_id, self.connection_id, self.chunk_index
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_numbered_record() {
        let line = r#"{"nodeId":"n1","connectionId":"c1","number":2,"requestCount":3,
            "lastObservationWasUnterminatedRead":true,
            "observations":[{"ts":"2023-05-01T00:00:00Z","kind":"read","data":"474554"},
                            {"ts":"2023-05-01T00:00:01Z","kind":"close"}]}"#;
        let record: CaptureRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.chunk, ChunkPosition::Number(2));
        assert_eq!(record.request_count, 3);
        assert!(record.last_observation_was_unterminated_read);
        assert_eq!(record.observations[0].data, b"GET");
        assert_eq!(record.observations[1].kind, ObservationKind::ConnectionClose);
        assert!(record.observations[1].data.is_empty());
    }

    #[test]
    fn parses_last_chunk_record() {
        let line = r#"{"nodeId":"n1","connectionId":"c1","lastChunkNumber":7}"#;
        let record: CaptureRecord = serde_json::from_str(line).unwrap();
        assert!(record.chunk.is_last());
        assert_eq!(record.key().chunk_index, 7);
        assert!(record.observations.is_empty());
        assert_eq!(record.key().to_string(), "n1.c1.7");
    }
}
