//! Leaderless, lease-coordinated consumption of partitioned append-only
//! streams.
//!
//! Any number of worker processes point at the same stream and the same
//! lease store; conditional writes on per-shard lease records decide who
//! reads what. There is no leader, no membership protocol and no
//! inter-worker networking. Each worker:
//!
//! - syncs the shard topology into the lease table,
//! - acquires leases up to its fair share of the shard count,
//! - runs one [`reader`] task per held shard, delivering ordered batches to
//!   a caller-supplied [`Processor`](processor::Processor),
//! - renews its leases on a heartbeat and checkpoints progress so a
//!   successor resumes where it left off.
//!
//! Workers can be added, removed or killed at any point. A dead worker's
//! leases expire and are picked up by the survivors; delivery is
//! at-least-once across such handoffs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use shardflow::config::ConsumerConfig;
//! use shardflow::consumer::ShardConsumer;
//! use shardflow::error::BoxError;
//! use shardflow::processor::{Batch, Disposition, Processor, ShardContext};
//! use shardflow::store_memory::InMemoryLeaseStore;
//! use shardflow::stream::IteratorPosition;
//! use shardflow::stream_mock::MockStream;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl Processor for Printer {
//!     async fn process_records(
//!         &self,
//!         ctx: &ShardContext,
//!         batch: Batch,
//!     ) -> Result<Disposition, BoxError> {
//!         for record in &batch.records {
//!             println!("{} {:?}", ctx.shard_id, record.data);
//!         }
//!         Ok(Disposition::Checkpoint)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let stream = Arc::new(MockStream::new("orders", 4));
//! let config = ConsumerConfig {
//!     iterator_position: IteratorPosition::TrimHorizon,
//!     ..ConsumerConfig::new("orders")
//! };
//!
//! let consumer = ShardConsumer::new(config, store, stream, Arc::new(Printer))?;
//! consumer.start().await?;
//! consumer.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Production deployments implement [`store::LeaseStore`] against a
//! conditional-write database and [`stream::StreamService`] against the
//! stream provider's API; the in-memory pair above ships behind the
//! `test-utilities` feature.

pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod processor;
pub mod reader;
pub mod registry;
pub mod retry;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod telemetry;
pub mod topology;

#[cfg(any(test, feature = "test-utilities"))]
pub mod store_memory;
#[cfg(any(test, feature = "test-utilities"))]
pub mod stream_mock;

pub use config::ConsumerConfig;
pub use consumer::ShardConsumer;
pub use error::{BoxError, ConsumerError, ConsumerResult};
pub use lease::{LeaseStatus, ShardLease};
pub use processor::{Batch, Disposition, Processor, ShardContext};
pub use store::LeaseStore;
pub use stream::{IteratorPosition, Record, StreamService};
