//! Stream service interface.
//!
//! The consumer only needs three operations from the stream side: describe
//! the shard topology, exchange a position for an iterator token, and
//! exchange an iterator token for a batch of records. Tokens are opaque
//! cursors; the service decides their encoding and lifetime.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StreamError;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// One shard as reported by the stream's describe operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: String,
    /// Inclusive 128-bit hash key range, decimal-encoded.
    pub hash_key_start: String,
    pub hash_key_end: String,
    /// Set when this shard was produced by a split or merge.
    pub parent_shard_id: Option<String>,
}

/// Where to open an iterator on a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Only records appended after the iterator is created.
    Latest,
    /// The oldest record still retained.
    TrimHorizon,
    /// The first record at or after this epoch-ms timestamp. The timestamp
    /// travels with the variant, so the missing-timestamp misconfiguration
    /// cannot be expressed.
    AtTimestamp(i64),
    /// The record immediately after this sequence number; used to resume from
    /// a checkpoint.
    AfterSequence(String),
}

impl std::fmt::Display for IteratorPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IteratorPosition::Latest => write!(f, "LATEST"),
            IteratorPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            IteratorPosition::AtTimestamp(ts) => write!(f, "AT_TIMESTAMP({ts})"),
            IteratorPosition::AfterSequence(seq) => write!(f, "AFTER_SEQUENCE_NUMBER({seq})"),
        }
    }
}

/// A single stream record, delivered in shard order.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque ordered token identifying this record within its shard.
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Bytes,
    /// Approximate append time, epoch ms. Feeds lag reporting.
    pub approximate_arrival: Option<i64>,
}

/// Response to a `get_records` call.
///
/// `records` is an `Option` on purpose: a present-but-empty list combined
/// with an absent `next_iterator` is the legitimate end of a closed shard,
/// while an absent list is a malformed response that must be retried. The
/// reader relies on this distinction for shard-closure detection.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Option<Vec<Record>>,
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// Client interface to the partitioned stream service.
#[async_trait]
pub trait StreamService: Send + Sync {
    /// Current shard set of the stream.
    async fn describe_stream(&self, stream_name: &str) -> StreamResult<Vec<ShardDescription>>;

    /// Exchange a position for an opaque iterator token.
    async fn shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> StreamResult<String>;

    /// Exchange an iterator token for at most `limit` records.
    async fn get_records(&self, iterator: &str, limit: usize) -> StreamResult<RecordBatch>;
}
