//! Per-shard fetch loop.
//!
//! One [`ShardReader`] runs per held lease, as its own task. The loop
//! exchanges an iterator token for a batch, hands non-empty batches to the
//! processor, checkpoints on request, and paces itself so a cheap processor
//! does not hammer the stream service.
//!
//! # Failure Handling
//!
//! Fetch errors are classified by [`StreamError`]: malformed responses and
//! force-aborted requests retry after a fixed short delay, load-related
//! errors retry with jittered linear backoff. Both paths increment a shared
//! attempt counter, but only the backoff path enforces the cap, so fixed
//! retries shorten the remaining backoff budget without being fatal on their
//! own. Reaching the cap is fatal for the instance. Attempts reset on any
//! successful fetch, empty or not.
//!
//! # Ownership
//!
//! The reader never renews its own lease; checkpoints extend it as a side
//! effect and the heartbeat covers quiet stretches. When the heartbeat (or a
//! failed checkpoint) reveals that ownership was lost, the reader winds down
//! without touching the store again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::constants::{
    BACKOFF_JITTER_MAX_MS, BACKOFF_JITTER_MIN_MS, BACKOFF_STEP_MS, EMPTY_SHARD_IDLE_DELAY_MS,
    MALFORMED_RETRY_DELAY_MS, MAX_FETCH_ATTEMPTS,
};
use crate::error::{ConsumerError, ConsumerResult, StoreError, StreamError};
use crate::lease::now_ms;
use crate::manager::LeaseManager;
use crate::metrics;
use crate::processor::{Batch, Disposition, Processor, ShardContext};
use crate::store::LeaseStore;
use crate::stream::{IteratorPosition, RecordBatch, StreamService};

/// Shared state for one held shard, visible to the reader task, the
/// heartbeat and the orchestrator.
#[derive(Debug)]
pub struct HeldShard {
    pub shard_id: String,
    /// Epoch ms of the last successful fetch. The heartbeat compares this
    /// against the zombie threshold.
    last_progress: AtomicI64,
    /// Set when lease ownership is lost; the reader exits at the next loop
    /// iteration without further store writes.
    revoked: AtomicBool,
}

impl HeldShard {
    pub fn new(shard_id: &str) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            last_progress: AtomicI64::new(now_ms()),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn mark_progress(&self) {
        self.last_progress.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last successful fetch.
    pub fn stalled_ms(&self, now: i64) -> i64 {
        now - self.last_progress.load(Ordering::Relaxed)
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Relaxed);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Relaxed)
    }
}

/// Jittered linear backoff for fetch retries: a random base between the
/// jitter bounds plus a fixed step per attempt already made.
fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(BACKOFF_JITTER_MIN_MS..=BACKOFF_JITTER_MAX_MS);
    Duration::from_millis(jitter + BACKOFF_STEP_MS * attempt as u64)
}

/// Reads one shard from its checkpoint to the present (or to closure).
pub struct ShardReader<S, K, P> {
    config: Arc<ConsumerConfig>,
    shard: Arc<HeldShard>,
    manager: Arc<LeaseManager<S>>,
    stream: Arc<K>,
    processor: Arc<P>,
    /// Last checkpointed sequence; the resume point for iterator refreshes.
    checkpoint: Option<String>,
    context: ShardContext,
}

impl<S, K, P> ShardReader<S, K, P>
where
    S: LeaseStore,
    K: StreamService,
    P: Processor,
{
    pub fn new(
        config: Arc<ConsumerConfig>,
        shard: Arc<HeldShard>,
        checkpoint: Option<String>,
        manager: Arc<LeaseManager<S>>,
        stream: Arc<K>,
        processor: Arc<P>,
    ) -> Self {
        let context = ShardContext {
            stream_name: config.stream_name.clone(),
            shard_id: shard.shard_id.clone(),
            instance_id: manager.instance_id().to_string(),
        };
        Self {
            config,
            shard,
            manager,
            stream,
            processor,
            checkpoint,
            context,
        }
    }

    /// Resume position: just past the checkpoint when one exists, otherwise
    /// the configured initial position.
    fn resume_position(&self) -> IteratorPosition {
        match &self.checkpoint {
            Some(sequence) => IteratorPosition::AfterSequence(sequence.clone()),
            None => self.config.iterator_position.clone(),
        }
    }

    async fn fresh_iterator(&self) -> Result<String, StreamError> {
        let position = self.resume_position();
        debug!(shard_id = %self.shard.shard_id, %position, "Opening shard iterator");
        self.stream
            .shard_iterator(&self.config.stream_name, &self.shard.shard_id, &position)
            .await
    }

    /// One fetch, force-aborted at the request timeout. A request that
    /// returns neither data nor an error within the window is
    /// indistinguishable from a hung connection.
    async fn fetch(&self, iterator: &str) -> Result<RecordBatch, StreamError> {
        match tokio::time::timeout(
            self.config.request_timeout(),
            self.stream.get_records(iterator, self.config.record_limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StreamError::Aborted),
        }
    }

    /// Drive the shard until closure, revocation or a fatal error.
    pub async fn run(mut self) -> ConsumerResult<()> {
        self.processor
            .init(&self.context)
            .await
            .map_err(|source| ConsumerError::Processor {
                shard_id: self.shard.shard_id.clone(),
                source,
            })?;

        let mut iterator = self.fresh_iterator().await?;
        let mut attempts: u32 = 0;

        loop {
            if self.shard.is_revoked() {
                info!(shard_id = %self.shard.shard_id, "Reader stopping, lease revoked");
                return Ok(());
            }

            let iteration_start = Instant::now();
            match self.fetch(&iterator).await {
                Ok(RecordBatch {
                    records: Some(records),
                    next_iterator,
                    millis_behind_latest,
                }) => {
                    attempts = 0;
                    self.shard.mark_progress();
                    let was_empty = records.is_empty();

                    if !was_empty && !self.deliver(records, millis_behind_latest).await? {
                        return Ok(());
                    }

                    match next_iterator {
                        Some(next) => {
                            iterator = next;
                            if was_empty {
                                // Caught up on an open shard.
                                tokio::time::sleep(Duration::from_millis(
                                    EMPTY_SHARD_IDLE_DELAY_MS,
                                ))
                                .await;
                            } else {
                                self.pace(iteration_start).await;
                            }
                        }
                        // End of a closed shard: the records field was present
                        // and no further iterator was issued.
                        None => return self.finish().await,
                    }
                }
                // Records field absent: structurally invalid response even if
                // it parsed, regardless of any iterator token it carried.
                Ok(RecordBatch { records: None, .. }) => {
                    attempts += 1;
                    metrics::record_fetch_retry("malformed");
                    warn!(
                        shard_id = %self.shard.shard_id,
                        attempts,
                        "Fetch response missing records field"
                    );
                    tokio::time::sleep(Duration::from_millis(MALFORMED_RETRY_DELAY_MS)).await;
                }
                Err(error) => {
                    attempts += 1;
                    metrics::record_fetch_retry(error.as_metric_label());
                    match error {
                        StreamError::ExpiredIterator => {
                            debug!(shard_id = %self.shard.shard_id, "Refreshing expired iterator");
                            iterator = self.fresh_iterator().await?;
                        }
                        e if e.uses_fixed_retry() => {
                            warn!(shard_id = %self.shard.shard_id, error = %e, attempts, "Fetch failed, short retry");
                            tokio::time::sleep(Duration::from_millis(MALFORMED_RETRY_DELAY_MS))
                                .await;
                        }
                        e if e.is_transient() => {
                            if attempts >= MAX_FETCH_ATTEMPTS {
                                warn!(shard_id = %self.shard.shard_id, error = %e, attempts, "Fetch attempt cap reached");
                                return Err(self.exhausted(attempts));
                            }
                            let delay = backoff_delay(attempts);
                            warn!(
                                shard_id = %self.shard.shard_id,
                                error = %e,
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Fetch failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        e => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Hand a non-empty batch to the processor and checkpoint if asked.
    /// Returns `false` when ownership was lost and the reader should stop.
    async fn deliver(
        &mut self,
        records: Vec<crate::stream::Record>,
        millis_behind_latest: Option<i64>,
    ) -> ConsumerResult<bool> {
        // Safe: deliver is only called for non-empty batches.
        let last_sequence = records[records.len() - 1].sequence_number.clone();
        let lag_ms = records[0].approximate_arrival.map(|t| now_ms() - t);
        let batch = Batch {
            records,
            lag_ms,
            millis_behind_latest,
        };
        let disposition = self
            .processor
            .process_records(&self.context, batch)
            .await
            .map_err(|source| ConsumerError::Processor {
                shard_id: self.shard.shard_id.clone(),
                source,
            })?;

        if disposition == Disposition::Checkpoint {
            match self
                .manager
                .checkpoint(&self.shard.shard_id, &last_sequence, "batch")
                .await
            {
                Ok(_) => self.checkpoint = Some(last_sequence),
                Err(StoreError::Precondition) => {
                    self.manager.note_revoked(&self.shard.shard_id);
                    self.shard.revoke();
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Hold the loop open until the minimum processing window has elapsed.
    async fn pace(&self, iteration_start: Instant) {
        let floor = Duration::from_millis(self.config.min_process_time_ms);
        let elapsed = iteration_start.elapsed();
        if elapsed < floor {
            tokio::time::sleep(floor - elapsed).await;
        }
    }

    /// Shard closure: flush the processor, then mark the lease complete.
    async fn finish(&self) -> ConsumerResult<()> {
        info!(shard_id = %self.shard.shard_id, "Shard read to the end");
        self.processor
            .on_shard_closed(&self.context)
            .await
            .map_err(|source| ConsumerError::Processor {
                shard_id: self.shard.shard_id.clone(),
                source,
            })?;
        match self.manager.complete(&self.shard.shard_id).await {
            Ok(_) => Ok(()),
            // Someone else took the lease between our last fetch and now;
            // they will rediscover the closure themselves.
            Err(StoreError::Precondition) => {
                self.manager.note_revoked(&self.shard.shard_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exhausted(&self, attempts: u32) -> ConsumerError {
        ConsumerError::ExhaustedRetries {
            shard_id: self.shard.shard_id.clone(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Mutex;

    use crate::lease::{LeaseStatus, ShardLease};
    use crate::manager::AcquireOutcome;
    use crate::store_memory::InMemoryLeaseStore;
    use crate::stream_mock::MockStream;

    struct Collecting {
        disposition: Disposition,
        seen: Mutex<Vec<String>>,
        closed: AtomicBool,
        init_calls: AtomicUsize,
    }

    impl Collecting {
        fn new(disposition: Disposition) -> Arc<Self> {
            Arc::new(Self {
                disposition,
                seen: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                init_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Processor for Collecting {
        async fn init(&self, _ctx: &ShardContext) -> Result<(), crate::error::BoxError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn process_records(
            &self,
            _ctx: &ShardContext,
            batch: Batch,
        ) -> Result<Disposition, crate::error::BoxError> {
            let mut seen = self.seen.lock().await;
            for record in &batch.records {
                seen.push(String::from_utf8_lossy(&record.data).to_string());
            }
            Ok(self.disposition)
        }

        async fn on_shard_closed(&self, _ctx: &ShardContext) -> Result<(), crate::error::BoxError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryLeaseStore>,
        stream: Arc<MockStream>,
        manager: Arc<LeaseManager<InMemoryLeaseStore>>,
        config: Arc<ConsumerConfig>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stream = Arc::new(MockStream::new("events", 1));
        store
            .seed_lease(ShardLease::new_available("shard-0000", "0", "100", None))
            .await;
        let manager = Arc::new(LeaseManager::new("worker-a", 120_000, 10, store.clone()));
        let config = Arc::new(ConsumerConfig {
            iterator_position: IteratorPosition::TrimHorizon,
            min_process_time_ms: 0,
            ..ConsumerConfig::new("events")
        });
        Fixture {
            store,
            stream,
            manager,
            config,
        }
    }

    async fn acquire(f: &Fixture) -> ShardLease {
        match f.manager.try_acquire_next(|_| false).await.unwrap() {
            AcquireOutcome::Acquired(lease) => lease,
            other => panic!("expected acquisition, got {other:?}"),
        }
    }

    fn reader(
        f: &Fixture,
        lease: &ShardLease,
        processor: Arc<Collecting>,
    ) -> (
        Arc<HeldShard>,
        ShardReader<InMemoryLeaseStore, MockStream, Collecting>,
    ) {
        let shard = Arc::new(HeldShard::new(&lease.shard_id));
        let reader = ShardReader::new(
            f.config.clone(),
            shard.clone(),
            lease.checkpoint.clone(),
            f.manager.clone(),
            f.stream.clone(),
            processor,
        );
        (shard, reader)
    }

    #[tokio::test]
    async fn closed_shard_is_drained_and_completed() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"hello").await;
        let last = f.stream.append("shard-0000", "k", b"world").await;
        f.stream.close_shard("shard-0000").await;

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();

        assert_eq!(*processor.seen.lock().await, ["hello", "world"]);
        assert!(processor.closed.load(Ordering::SeqCst));
        assert_eq!(processor.init_calls.load(Ordering::SeqCst), 1);

        let stored = f.store.lease("shard-0000").await.unwrap();
        assert_eq!(stored.status, LeaseStatus::Complete);
        assert_eq!(stored.checkpoint.as_deref(), Some(last.as_str()));
    }

    #[tokio::test]
    async fn continue_disposition_skips_checkpointing() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"a").await;
        f.stream.close_shard("shard-0000").await;

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Continue);
        let (_, reader) = reader(&f, &lease, processor);

        reader.run().await.unwrap();
        let stored = f.store.lease("shard-0000").await.unwrap();
        assert_eq!(stored.checkpoint, None);
        assert_eq!(stored.status, LeaseStatus::Complete);
    }

    #[tokio::test]
    async fn resumes_after_the_stored_checkpoint() {
        let f = fixture().await;
        let first = f.stream.append("shard-0000", "k", b"done-already").await;
        f.stream.append("shard-0000", "k", b"fresh").await;
        f.stream.close_shard("shard-0000").await;

        let mut lease = acquire(&f).await;
        lease.checkpoint = Some(first);
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();
        assert_eq!(*processor.seen.lock().await, ["fresh"]);
    }

    #[tokio::test]
    async fn revoked_reader_exits_without_store_writes() {
        let f = fixture().await;
        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (shard, reader) = reader(&f, &lease, processor);

        shard.revoke();
        reader.run().await.unwrap();

        let stored = f.store.lease("shard-0000").await.unwrap();
        assert_eq!(stored.status, LeaseStatus::Leased);
        assert_eq!(stored.checkpoint, None);
    }

    #[tokio::test]
    async fn lost_ownership_at_checkpoint_stops_the_reader() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"contested").await;
        let lease = acquire(&f).await;

        // Another worker takes over before the first batch lands.
        let mut stolen = f.store.lease("shard-0000").await.unwrap();
        stolen.owner = Some("worker-b".into());
        stolen.expires_at = now_ms() + 120_000;
        f.store.seed_lease(stolen).await;

        let processor = Collecting::new(Disposition::Checkpoint);
        let (shard, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();
        assert!(shard.is_revoked());
        assert_eq!(*processor.seen.lock().await, ["contested"]);

        let stored = f.store.lease("shard-0000").await.unwrap();
        assert_eq!(stored.owner.as_deref(), Some("worker-b"));
        assert_eq!(stored.checkpoint, None);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_responses_are_retried_until_success() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"eventually").await;
        f.stream.close_shard("shard-0000").await;
        f.stream.inject_malformed(3).await;

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();
        assert_eq!(*processor.seen.lock().await, ["eventually"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"after-throttle").await;
        f.stream.close_shard("shard-0000").await;
        f.stream.inject_fault(StreamError::Throttled).await;
        f.stream.inject_fault(StreamError::Unavailable).await;

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();
        assert_eq!(*processor.seen.lock().await, ["after-throttle"]);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_is_fatal() {
        let f = fixture().await;
        for _ in 0..MAX_FETCH_ATTEMPTS {
            f.stream.inject_fault(StreamError::Throttled).await;
        }

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor);

        let err = reader.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::ExhaustedRetries {
                attempts: MAX_FETCH_ATTEMPTS,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_reset_after_a_successful_fetch() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"v").await;
        // One short of the cap, then success, then one short of the cap again.
        for _ in 0..MAX_FETCH_ATTEMPTS - 1 {
            f.stream.inject_fault(StreamError::Throttled).await;
        }

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (shard, reader) = reader(&f, &lease, processor.clone());

        let handle = tokio::spawn(reader.run());
        // Give the loop time to burn through the faults and the success.
        tokio::time::sleep(Duration::from_secs(120)).await;
        for _ in 0..MAX_FETCH_ATTEMPTS - 1 {
            f.stream.inject_fault(StreamError::Throttled).await;
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        shard.revoke();

        handle.await.unwrap().unwrap();
        assert_eq!(*processor.seen.lock().await, ["v"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_retries_count_toward_the_cap_without_triggering_it() {
        let f = fixture().await;
        f.stream.append("shard-0000", "k", b"survivor").await;
        f.stream.close_shard("shard-0000").await;
        // A full cap's worth of malformed responses alone is not fatal.
        f.stream.inject_malformed(MAX_FETCH_ATTEMPTS as usize).await;

        let lease = acquire(&f).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, surviving) = reader(&f, &lease, processor.clone());
        surviving.run().await.unwrap();
        assert_eq!(*processor.seen.lock().await, ["survivor"]);

        // But they do consume the budget: after malformed retries one short
        // of the cap, a single backoff-class error tips the reader over.
        let g = fixture().await;
        g.stream.inject_malformed(MAX_FETCH_ATTEMPTS as usize - 1).await;
        g.stream.inject_fault(StreamError::Throttled).await;

        let lease = acquire(&g).await;
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, tipped) = reader(&g, &lease, processor);
        let err = tipped.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::ExhaustedRetries {
                attempts: MAX_FETCH_ATTEMPTS,
                ..
            }
        ));
    }

    #[test]
    fn backoff_delay_bounds() {
        for attempt in [1u32, 5, 9] {
            for _ in 0..32 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                let step = BACKOFF_STEP_MS * attempt as u64;
                assert!(delay >= BACKOFF_JITTER_MIN_MS + step);
                assert!(delay <= BACKOFF_JITTER_MAX_MS + step);
            }
        }
    }

    #[tokio::test]
    async fn expired_iterator_is_refreshed_from_checkpoint() {
        let f = fixture().await;
        let first = f.stream.append("shard-0000", "k", b"skip").await;
        f.stream.append("shard-0000", "k", b"keep").await;
        f.stream.close_shard("shard-0000").await;
        f.stream.inject_fault(StreamError::ExpiredIterator).await;

        let mut lease = acquire(&f).await;
        lease.checkpoint = Some(first);
        let processor = Collecting::new(Disposition::Checkpoint);
        let (_, reader) = reader(&f, &lease, processor.clone());

        reader.run().await.unwrap();
        assert_eq!(*processor.seen.lock().await, ["keep"]);
    }
}
