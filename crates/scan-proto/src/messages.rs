//! Tagged request and response payloads of the scan protocol.
//!
//! One scan exchange is: the client writes a single request frame, the server
//! streams zero or more `ResponseStream` frames, and terminates the exchange
//! with a `StreamEndResponse`. The client may write an `EndStreamRequest` to
//! cut a stream short, but must still drain frames until the stream end.

use crate::timestamp::{Consistency, TsVector};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this client. A server replying with version
/// zero is a legacy server: session consistency then requires the caller to
/// supply a vbucket-timestamp vector.
pub const PROTOCOL_VERSION: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Helo,
    HeloAck,
    Scan,
    ScanAll,
    Count,
    Statistics,
    ResponseStream,
    CountResponse,
    StatisticsResponse,
    StreamEnd,
    EndStream,
}

impl MessageTag {
    pub fn to_u16(self) -> u16 {
        match self {
            MessageTag::Helo => 1,
            MessageTag::HeloAck => 2,
            MessageTag::Scan => 3,
            MessageTag::ScanAll => 4,
            MessageTag::Count => 5,
            MessageTag::Statistics => 6,
            MessageTag::ResponseStream => 7,
            MessageTag::CountResponse => 8,
            MessageTag::StatisticsResponse => 9,
            MessageTag::StreamEnd => 10,
            MessageTag::EndStream => 11,
        }
    }

    pub fn from_u16(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => MessageTag::Helo,
            2 => MessageTag::HeloAck,
            3 => MessageTag::Scan,
            4 => MessageTag::ScanAll,
            5 => MessageTag::Count,
            6 => MessageTag::Statistics,
            7 => MessageTag::ResponseStream,
            8 => MessageTag::CountResponse,
            9 => MessageTag::StatisticsResponse,
            10 => MessageTag::StreamEnd,
            11 => MessageTag::EndStream,
            _ => return None,
        })
    }
}

/// Whether a composite filter includes its low and/or high bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Inclusion {
    Neither,
    Low,
    High,
    #[default]
    Both,
}

/// One composite-element filter of a scan span. `None` bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompositeElementFilter {
    pub low: Option<serde_json::Value>,
    pub high: Option<serde_json::Value>,
    pub inclusion: Inclusion,
}

/// A scan is either an ordered list of composite filters or an equality
/// seek vector. `equals` takes precedence when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Scan {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<CompositeElementFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Vec<serde_json::Value>>,
}

/// Key positions to project out of each row, plus the primary key flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexProjection {
    pub entry_keys: Vec<u64>,
    pub primary_key: bool,
}

/// Grouping and aggregation pushed down with a `scan3` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupAggr {
    /// Group keys, as positions into the composite index key.
    pub group: Vec<u32>,
    /// Aggregate expressions, as opaque compiled forms.
    pub aggrs: Vec<serde_json::Value>,
    pub allow_partial_aggr: bool,
}

/// How row keys are encoded on the wire. Pre-6.5 servers ship JSON-encoded
/// secondary keys; 6.5+ servers ship collate-encoded binary keys. The client
/// selects based on the cluster version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    #[default]
    Json,
    Collated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeloRequest {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeloResponse {
    pub version: u32,
}

/// A range, lookup, multi-scan, or scan3 request against one index instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScanRequest {
    pub defn_id: u64,
    pub inst_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_ids: Vec<u32>,
    pub scans: Vec<Scan>,
    pub distinct: bool,
    /// Zero means unlimited.
    pub limit: u64,
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<IndexProjection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_aggr: Option<GroupAggr>,
    pub consistency: Consistency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<TsVector>,
    pub rollback_time: i64,
    pub data_encoding: DataEncoding,
}

/// A full-index scan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScanAllRequest {
    pub defn_id: u64,
    pub inst_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_ids: Vec<u32>,
    pub limit: u64,
    pub consistency: Consistency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<TsVector>,
    pub rollback_time: i64,
    pub data_encoding: DataEncoding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CountRequest {
    pub defn_id: u64,
    pub inst_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_ids: Vec<u32>,
    pub scans: Vec<Scan>,
    pub distinct: bool,
    pub consistency: Consistency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<TsVector>,
    pub rollback_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatisticsRequest {
    pub defn_id: u64,
    pub inst_id: u64,
    pub span: Scan,
}

/// One streamed row: the encoded secondary key and the primary document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub doc_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseStream {
    pub entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CountResponse {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexStatistics {
    pub count: u64,
    pub unique_keys: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatisticsResponse {
    pub stats: IndexStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Terminates a response stream. A set `err` reports a server-side failure;
/// the stream is still cleanly terminated and the connection reusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamEndResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Helo(HeloRequest),
    HeloAck(HeloResponse),
    Scan(ScanRequest),
    ScanAll(ScanAllRequest),
    Count(CountRequest),
    Statistics(StatisticsRequest),
    Stream(ResponseStream),
    CountResult(CountResponse),
    StatisticsResult(StatisticsResponse),
    StreamEnd(StreamEndResponse),
    EndStream,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Helo(_) => MessageTag::Helo,
            Message::HeloAck(_) => MessageTag::HeloAck,
            Message::Scan(_) => MessageTag::Scan,
            Message::ScanAll(_) => MessageTag::ScanAll,
            Message::Count(_) => MessageTag::Count,
            Message::Statistics(_) => MessageTag::Statistics,
            Message::Stream(_) => MessageTag::ResponseStream,
            Message::CountResult(_) => MessageTag::CountResponse,
            Message::StatisticsResult(_) => MessageTag::StatisticsResponse,
            Message::StreamEnd(_) => MessageTag::StreamEnd,
            Message::EndStream => MessageTag::EndStream,
        }
    }

    pub fn encode_payload(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::Helo(m) => serde_json::to_vec(m),
            Message::HeloAck(m) => serde_json::to_vec(m),
            Message::Scan(m) => serde_json::to_vec(m),
            Message::ScanAll(m) => serde_json::to_vec(m),
            Message::Count(m) => serde_json::to_vec(m),
            Message::Statistics(m) => serde_json::to_vec(m),
            Message::Stream(m) => serde_json::to_vec(m),
            Message::CountResult(m) => serde_json::to_vec(m),
            Message::StatisticsResult(m) => serde_json::to_vec(m),
            Message::StreamEnd(m) => serde_json::to_vec(m),
            Message::EndStream => Ok(b"{}".to_vec()),
        }
    }

    pub fn decode_payload(tag: MessageTag, payload: &[u8]) -> crate::Result<Self> {
        let wrap = |source| crate::Error::Payload { tag, source };
        Ok(match tag {
            MessageTag::Helo => Message::Helo(serde_json::from_slice(payload).map_err(wrap)?),
            MessageTag::HeloAck => Message::HeloAck(serde_json::from_slice(payload).map_err(wrap)?),
            MessageTag::Scan => Message::Scan(serde_json::from_slice(payload).map_err(wrap)?),
            MessageTag::ScanAll => Message::ScanAll(serde_json::from_slice(payload).map_err(wrap)?),
            MessageTag::Count => Message::Count(serde_json::from_slice(payload).map_err(wrap)?),
            MessageTag::Statistics => {
                Message::Statistics(serde_json::from_slice(payload).map_err(wrap)?)
            }
            MessageTag::ResponseStream => {
                Message::Stream(serde_json::from_slice(payload).map_err(wrap)?)
            }
            MessageTag::CountResponse => {
                Message::CountResult(serde_json::from_slice(payload).map_err(wrap)?)
            }
            MessageTag::StatisticsResponse => {
                Message::StatisticsResult(serde_json::from_slice(payload).map_err(wrap)?)
            }
            MessageTag::StreamEnd => {
                Message::StreamEnd(serde_json::from_slice(payload).map_err(wrap)?)
            }
            MessageTag::EndStream => Message::EndStream,
        })
    }
}
