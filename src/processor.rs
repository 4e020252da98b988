//! Caller-supplied record processing.
//!
//! A [`Processor`] is shared by every shard reader in the instance, so
//! implementations hold per-shard state keyed by [`ShardContext::shard_id`]
//! if they need any. Record delivery is ordered within a shard and
//! at-least-once across lease handoffs: a crash between processing and
//! checkpointing replays the batch on the next holder.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::stream::Record;

/// What the reader should do after a batch was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Persist the last sequence number of the batch as the shard checkpoint.
    Checkpoint,
    /// Keep reading without checkpointing. Use when batches are cheap to
    /// replay and checkpoint writes are worth amortizing.
    Continue,
}

/// Identifies the shard a callback is running for.
#[derive(Debug, Clone)]
pub struct ShardContext {
    pub stream_name: String,
    pub shard_id: String,
    /// Id of the worker holding the lease, as written to the lease record.
    pub instance_id: String,
}

/// A non-empty run of records from one fetch.
#[derive(Debug)]
pub struct Batch {
    /// Records in shard order.
    pub records: Vec<Record>,
    /// Delivery time minus the first record's approximate arrival time.
    pub lag_ms: Option<i64>,
    /// How far behind the shard tip this batch was, if the service reports it.
    pub millis_behind_latest: Option<i64>,
}

/// Application callback interface.
///
/// Any error returned here is fatal for the whole instance. Retrying
/// application logic without an idempotence guarantee risks double
/// processing, so the library refuses to guess; handle retryable failures
/// inside the implementation.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Called once when a lease is acquired, before the first fetch.
    async fn init(&self, _ctx: &ShardContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called for every non-empty batch, in shard order.
    async fn process_records(&self, ctx: &ShardContext, batch: Batch)
    -> Result<Disposition, BoxError>;

    /// Called when the shard is read to the end, before the lease is marked
    /// complete. Last chance to flush per-shard state.
    async fn on_shard_closed(&self, _ctx: &ShardContext) -> Result<(), BoxError> {
        Ok(())
    }
}
