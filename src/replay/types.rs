// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Value types that flow between the accumulator, the dispatcher, the executor and the emitter.
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{Duration, Instant};

/// Identity of one HTTP transaction within the capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueRequestKey {
    pub node_id: String,
    pub connection_id: String,
    pub request_index: u64,
}

impl UniqueRequestKey {
    pub fn new(node_id: impl Into<String>, connection_id: impl Into<String>, request_index: u64) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
            request_index,
        }
    }
}

impl fmt::Display for UniqueRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.node_id, self.connection_id, self.request_index)
    }
}

/// The packets making up one direction of a captured HTTP message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpMessageAndTimestamp {
    #[serde(rename = "timestamp")]
    pub first_packet_timestamp: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_packet_timestamp: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_hex_packets")]
    pub packets: Vec<Vec<u8>>,
}

impl HttpMessageAndTimestamp {
    pub fn add_packet(&mut self, timestamp: DateTime<Utc>, data: &[u8]) {
        if self.first_packet_timestamp.is_none() {
            self.first_packet_timestamp = Some(timestamp);
        }
        self.last_packet_timestamp = Some(timestamp);
        if !data.is_empty() {
            self.packets.push(data.to_vec());
        }
    }

    /// True until the first packet (even an empty one) has been observed.
    pub fn is_empty(&self) -> bool {
        self.first_packet_timestamp.is_none()
    }

    pub fn len(&self) -> usize {
        self.packets.iter().map(Vec::len).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.packets.concat()
    }
}

/// A captured request and, once the transaction completes, its captured response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResponsePacketPair {
    pub key: UniqueRequestKey,
    pub request: HttpMessageAndTimestamp,
    pub response: Option<HttpMessageAndTimestamp>,
}

impl RequestResponsePacketPair {
    pub fn new(key: UniqueRequestKey, request: HttpMessageAndTimestamp) -> Self {
        Self {
            key,
            request,
            response: None,
        }
    }
}

/// Everything the target sent back for one replayed request.
#[derive(Debug, Clone, Default)]
pub struct AggregatedRawResponse {
    pub response_size: usize,
    pub response_duration: Duration,
    pub packets: Vec<(DateTime<Utc>, Vec<u8>)>,
    pub error: Option<String>,
}

impl AggregatedRawResponse {
    pub fn builder() -> AggregatedRawResponseBuilder {
        AggregatedRawResponseBuilder::new()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.packets.iter().flat_map(|(_, p)| p.iter().copied()).collect()
    }
}

pub struct AggregatedRawResponseBuilder {
    start: Instant,
    packets: Vec<(DateTime<Utc>, Vec<u8>)>,
    error: Option<String>,
}

impl AggregatedRawResponseBuilder {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            packets: Vec::new(),
            error: None,
        }
    }

    pub fn add_response_packet(&mut self, data: &[u8]) -> &mut Self {
        self.packets.push((Utc::now(), data.to_vec()));
        self
    }

    pub fn add_error_cause(&mut self, cause: impl fmt::Display) -> &mut Self {
        self.error = Some(cause.to_string());
        self
    }

    pub fn build(self) -> AggregatedRawResponse {
        AggregatedRawResponse {
            response_size: self.packets.iter().map(|(_, p)| p.len()).sum(),
            response_duration: self.start.elapsed(),
            packets: self.packets,
            error: self.error,
        }
    }
}

/// The record handed to the tuple emitter: a captured transaction plus the target's answer.
#[derive(Debug, Clone)]
pub struct SourceTargetCaptureTuple {
    pub pair: RequestResponsePacketPair,
    pub target_response: Vec<Vec<u8>>,
    pub target_response_duration: Duration,
}

impl SourceTargetCaptureTuple {
    pub fn new(pair: RequestResponsePacketPair, response: AggregatedRawResponse) -> Self {
        Self {
            pair,
            target_response: response.packets.into_iter().map(|(_, p)| p).collect(),
            target_response_duration: response.response_duration,
        }
    }

    /// The tuple recorded when the replay failed: no target packets, zero duration.
    pub fn failed(pair: RequestResponsePacketPair) -> Self {
        Self {
            pair,
            target_response: Vec::new(),
            target_response_duration: Duration::ZERO,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TupleRecord<'a> {
    node_id: &'a str,
    connection_id: &'a str,
    request_index: u64,
    source_request: &'a HttpMessageAndTimestamp,
    source_response: Option<&'a HttpMessageAndTimestamp>,
    #[serde(serialize_with = "serialize_hex_packets")]
    target_response: &'a [Vec<u8>],
    target_response_duration_ms: u128,
}

impl Serialize for SourceTargetCaptureTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TupleRecord {
            node_id: &self.pair.key.node_id,
            connection_id: &self.pair.key.connection_id,
            request_index: self.pair.key.request_index,
            source_request: &self.pair.request,
            source_response: self.pair.response.as_ref(),
            target_response: &self.target_response,
            target_response_duration_ms: self.target_response_duration.as_millis(),
        }
        .serialize(serializer)
    }
}

fn serialize_hex_packets<S: Serializer>(packets: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(packets.iter().map(hex::encode))
}
