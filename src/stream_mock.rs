//! Scriptable in-memory stream for testing.
//!
//! Models the behaviors the reader's state machine has to handle: ordered
//! record delivery with opaque iterator tokens, shard closure (final empty
//! page without a next token), malformed responses (absent records field),
//! and injected per-call errors. Shared between simulated producers and
//! consumers via `Clone`.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::StreamError;
use crate::lease::now_ms;
use crate::stream::{
    IteratorPosition, Record, RecordBatch, ShardDescription, StreamResult, StreamService,
};

#[derive(Debug)]
struct MockShard {
    description: ShardDescription,
    records: Vec<Record>,
    /// A closed shard stops issuing next-iterator tokens once drained.
    closed: bool,
}

/// One scripted `get_records` response, served before real data.
#[derive(Debug)]
enum Scripted {
    Fault(StreamError),
    /// Well-formed transport, missing records field.
    Malformed,
}

#[derive(Debug, Default)]
struct Inner {
    stream_name: String,
    shards: BTreeMap<String, MockShard>,
    /// Scripted responses, one per subsequent `get_records` call, served in
    /// injection order.
    script: VecDeque<Scripted>,
    get_records_calls: u64,
}

/// Shared scriptable [`StreamService`].
#[derive(Debug, Clone)]
pub struct MockStream {
    inner: Arc<Mutex<Inner>>,
}

impl MockStream {
    /// A stream with `shard_count` open shards, ids `shard-0000`, `shard-0001`…
    /// Hash key ranges split the 128-bit space evenly.
    pub fn new(stream_name: &str, shard_count: usize) -> Self {
        let mut shards = BTreeMap::new();
        let span = u128::MAX / shard_count.max(1) as u128;
        for index in 0..shard_count {
            let shard_id = format!("shard-{index:04}");
            let start = span * index as u128 + index as u128;
            let end = if index + 1 == shard_count {
                u128::MAX
            } else {
                start + span
            };
            shards.insert(
                shard_id.clone(),
                MockShard {
                    description: ShardDescription {
                        shard_id,
                        hash_key_start: start.to_string(),
                        hash_key_end: end.to_string(),
                        parent_shard_id: None,
                    },
                    records: Vec::new(),
                    closed: false,
                },
            );
        }
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stream_name: stream_name.to_string(),
                shards,
                ..Default::default()
            })),
        }
    }

    /// Append a record to a shard, returning its sequence number.
    pub async fn append(&self, shard_id: &str, partition_key: &str, data: &[u8]) -> String {
        let mut inner = self.inner.lock().await;
        let shard = inner.shards.get_mut(shard_id).expect("unknown shard");
        let sequence_number = format!("{:020}", shard.records.len() + 1);
        shard.records.push(Record {
            sequence_number: sequence_number.clone(),
            partition_key: partition_key.to_string(),
            data: Bytes::copy_from_slice(data),
            approximate_arrival: Some(now_ms()),
        });
        sequence_number
    }

    /// Close a shard: once its records are drained, `get_records` returns an
    /// empty batch without a next-iterator token.
    pub async fn close_shard(&self, shard_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.shards.get_mut(shard_id).expect("unknown shard").closed = true;
    }

    /// Queue an error for a subsequent `get_records` call. Consumed in
    /// injection order, interleaved with malformed responses.
    pub async fn inject_fault(&self, error: StreamError) {
        self.inner.lock().await.script.push_back(Scripted::Fault(error));
    }

    /// Queue `count` malformed `get_records` responses (no records field at
    /// all).
    pub async fn inject_malformed(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        for _ in 0..count {
            inner.script.push_back(Scripted::Malformed);
        }
    }

    /// Total `get_records` calls served, for pacing assertions.
    pub async fn get_records_calls(&self) -> u64 {
        self.inner.lock().await.get_records_calls
    }
}

fn encode_iterator(shard_id: &str, offset: usize) -> String {
    format!("{shard_id}:{offset}")
}

fn decode_iterator(token: &str) -> StreamResult<(String, usize)> {
    let (shard_id, offset) = token
        .split_once(':')
        .ok_or_else(|| StreamError::Malformed(format!("bad iterator token: {token}")))?;
    let offset = offset
        .parse()
        .map_err(|_| StreamError::Malformed(format!("bad iterator offset: {token}")))?;
    Ok((shard_id.to_string(), offset))
}

#[async_trait]
impl StreamService for MockStream {
    async fn describe_stream(&self, stream_name: &str) -> StreamResult<Vec<ShardDescription>> {
        let inner = self.inner.lock().await;
        if inner.stream_name != stream_name {
            return Err(StreamError::NotFound(stream_name.to_string()));
        }
        Ok(inner
            .shards
            .values()
            .map(|s| s.description.clone())
            .collect())
    }

    async fn shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorPosition,
    ) -> StreamResult<String> {
        let inner = self.inner.lock().await;
        if inner.stream_name != stream_name {
            return Err(StreamError::NotFound(stream_name.to_string()));
        }
        let shard = inner
            .shards
            .get(shard_id)
            .ok_or_else(|| StreamError::NotFound(shard_id.to_string()))?;
        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => shard.records.len(),
            IteratorPosition::AtTimestamp(ts) => shard
                .records
                .iter()
                .position(|r| r.approximate_arrival.unwrap_or(0) >= *ts)
                .unwrap_or(shard.records.len()),
            IteratorPosition::AfterSequence(seq) => shard
                .records
                .iter()
                .position(|r| r.sequence_number == *seq)
                .map(|i| i + 1)
                .unwrap_or(0),
        };
        Ok(encode_iterator(shard_id, offset))
    }

    async fn get_records(&self, iterator: &str, limit: usize) -> StreamResult<RecordBatch> {
        let mut inner = self.inner.lock().await;
        inner.get_records_calls += 1;
        match inner.script.pop_front() {
            Some(Scripted::Fault(fault)) => return Err(fault),
            Some(Scripted::Malformed) => {
                return Ok(RecordBatch {
                    records: None,
                    next_iterator: Some(iterator.to_string()),
                    millis_behind_latest: None,
                });
            }
            None => {}
        }

        let (shard_id, offset) = decode_iterator(iterator)?;
        let shard = inner
            .shards
            .get(&shard_id)
            .ok_or(StreamError::ExpiredIterator)?;

        let end = (offset + limit).min(shard.records.len());
        let records: Vec<Record> = shard.records[offset.min(end)..end].to_vec();
        let drained = end >= shard.records.len();
        let next_iterator = if shard.closed && drained {
            None
        } else {
            Some(encode_iterator(&shard_id, end))
        };
        Ok(RecordBatch {
            records: Some(records),
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }
}
