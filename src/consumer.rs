//! Consumer orchestration.
//!
//! [`ShardConsumer`] owns the whole lifecycle: table bootstrap, topology
//! sync, instance registration, the acquisition loop, one reader task per
//! held lease, and the heartbeat. Readers and the heartbeat report through a
//! fatal-error channel; the first fatal error wins and [`wait`] surfaces it
//! after shutting everything down.
//!
//! [`wait`]: ShardConsumer::wait
//!
//! # Shutdown
//!
//! [`stop`](ShardConsumer::stop) cancels all tasks and deregisters the
//! instance, but deliberately leaves held leases in the store. Peers take
//! them over once they expire; releasing them early would require a write
//! path that a crashed process would not get to run anyway, and takeover
//! must work without it.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use crate::config::ConsumerConfig;
use crate::constants::QUOTA_RESCAN_DELAY_MS;
use crate::error::{ConsumerError, ConsumerResult, StoreError};
use crate::heartbeat::HeartbeatScheduler;
use crate::lease::ShardLease;
use crate::manager::{AcquireOutcome, LeaseManager};
use crate::metrics;
use crate::processor::Processor;
use crate::reader::{HeldShard, ShardReader};
use crate::registry::InstanceRegistry;
use crate::retry;
use crate::store::LeaseStore;
use crate::stream::StreamService;
use crate::tasks::TaskRegistry;
use crate::topology::TopologyFetcher;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A lease-coordinated consumer instance for one stream.
pub struct ShardConsumer<S, K, P> {
    config: Arc<ConsumerConfig>,
    store: Arc<S>,
    stream: Arc<K>,
    processor: Arc<P>,
    manager: Arc<LeaseManager<S>>,
    registry: Arc<InstanceRegistry<S>>,
    topology: Arc<TopologyFetcher<S, K>>,
    held: Arc<DashMap<String, Arc<HeldShard>>>,
    tasks: Arc<Mutex<TaskRegistry>>,
    fatal_tx: mpsc::Sender<ConsumerError>,
    fatal_rx: Mutex<mpsc::Receiver<ConsumerError>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<S, K, P> ShardConsumer<S, K, P>
where
    S: LeaseStore + 'static,
    K: StreamService + 'static,
    P: Processor,
{
    /// Build a consumer. Fails fast on configuration errors; no I/O happens
    /// until [`start`](Self::start).
    pub fn new(
        config: ConsumerConfig,
        store: Arc<S>,
        stream: Arc<K>,
        processor: Arc<P>,
    ) -> ConsumerResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let manager = Arc::new(LeaseManager::new(
            &config.instance_id,
            config.lease_timeout_ms,
            config.max_shards_per_instance,
            store.clone(),
        ));
        let registry = Arc::new(InstanceRegistry::new(
            &config.instance_id,
            config.lease_timeout_ms,
            store.clone(),
        ));
        let topology = Arc::new(TopologyFetcher::new(
            &config.stream_name,
            store.clone(),
            stream.clone(),
        ));
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            config,
            store,
            stream,
            processor,
            manager,
            registry,
            topology,
            held: Arc::new(DashMap::new()),
            tasks: Arc::new(Mutex::new(TaskRegistry::new())),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
            stop_tx,
            stop_rx,
        })
    }

    pub fn instance_id(&self) -> &str {
        self.manager.instance_id()
    }

    /// Shard ids currently held by this instance.
    pub fn held_shards(&self) -> Vec<String> {
        self.held.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bootstrap and launch the coordinator and heartbeat tasks. Returns once
    /// the instance is registered and coordination is running; record
    /// processing continues in the background.
    pub async fn start(&self) -> ConsumerResult<()> {
        info!(
            stream = %self.config.stream_name,
            instance_id = %self.config.instance_id,
            "Starting consumer"
        );
        (|| async { self.store.create_table_if_missing().await })
            .retry(retry::store_policy())
            .when(StoreError::is_transient)
            .await?;
        self.topology.sync().await?;
        self.registry.register().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.spawn(
            "heartbeat",
            HeartbeatScheduler::new(
                self.manager.clone(),
                self.registry.clone(),
                self.held.clone(),
                self.config.max_process_time_ms,
                self.config.heartbeat_interval(),
                self.fatal_tx.clone(),
            )
            .run(),
        );
        tasks.spawn("coordinator", self.coordinator_loop());
        Ok(())
    }

    /// Block until the first fatal error (returned after an internal
    /// shutdown) or until [`stop`](Self::stop) completes.
    pub async fn wait(&self) -> ConsumerResult<()> {
        let mut stop_rx = self.stop_rx.clone();
        if *stop_rx.borrow() {
            return Ok(());
        }
        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            fatal = fatal_rx.recv() => {
                drop(fatal_rx);
                match fatal {
                    Some(err) => {
                        warn!(error = %err, "Fatal error, shutting down");
                        self.stop().await;
                        Err(err)
                    }
                    None => Ok(()),
                }
            }
            _ = stop_rx.changed() => Ok(()),
        }
    }

    /// Graceful shutdown: stop all tasks and deregister the instance. Held
    /// leases are left to expire. Idempotent.
    pub async fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!(instance_id = %self.config.instance_id, "Stopping consumer");
        self.tasks.lock().await.shutdown_all(SHUTDOWN_TIMEOUT).await;
        self.registry.deregister().await;
        self.held.clear();
        metrics::set_held_shards(&self.config.stream_name, 0);
    }

    /// Persist an out-of-band checkpoint for a held shard. The conditional
    /// write still verifies live ownership, so a concurrently lost lease
    /// surfaces as a precondition failure rather than a silent overwrite.
    pub async fn checkpoint(&self, shard_id: &str, sequence: &str) -> ConsumerResult<ShardLease> {
        if !self.held.contains_key(shard_id) {
            return Err(ConsumerError::NotHeld(shard_id.to_string()));
        }
        Ok(self.manager.checkpoint(shard_id, sequence, "external").await?)
    }

    /// The acquisition loop: sync topology, compute the fair-share quota, and
    /// take one lease per pass while under it.
    ///
    /// One candidate per pass keeps the failure mode simple: losing a
    /// conditional-write race costs one retry delay, nothing more. All
    /// instances scan in store order and converge on an even split as each
    /// reaches its quota.
    fn coordinator_loop(&self) -> impl Future<Output = ()> + Send + 'static {
        let config = self.config.clone();
        let topology = self.topology.clone();
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let stream = self.stream.clone();
        let processor = self.processor.clone();
        let held = self.held.clone();
        let tasks = self.tasks.clone();
        let fatal_tx = self.fatal_tx.clone();

        async move {
            loop {
                let quota = match coordinator_pass(&topology, &registry, &manager).await {
                    Ok(quota) => quota,
                    Err(error) => {
                        warn!(%error, "Coordination pass failed");
                        tokio::time::sleep(config.acquire_retry_delay()).await;
                        continue;
                    }
                };

                if held.len() >= quota {
                    tokio::time::sleep(Duration::from_millis(QUOTA_RESCAN_DELAY_MS)).await;
                    continue;
                }

                match manager
                    .try_acquire_next(|shard_id| held.contains_key(shard_id))
                    .await
                {
                    Ok(AcquireOutcome::Acquired(lease)) => {
                        spawn_reader(
                            &config, &manager, &stream, &processor, &held, &tasks, &fatal_tx,
                            lease,
                        )
                        .await;
                    }
                    Ok(AcquireOutcome::LostRace) | Ok(AcquireOutcome::NoneEligible) => {}
                    Err(error) => {
                        warn!(%error, "Lease acquisition failed");
                    }
                }
                tokio::time::sleep(config.acquire_retry_delay()).await;
            }
        }
    }
}

/// Topology sync plus quota math for one coordinator pass.
async fn coordinator_pass<S: LeaseStore, K: StreamService>(
    topology: &TopologyFetcher<S, K>,
    registry: &InstanceRegistry<S>,
    manager: &LeaseManager<S>,
) -> ConsumerResult<usize> {
    let shards = topology.sync().await?;
    let live = registry.live_instances().await?;
    Ok(manager.desired_shards(shards.len(), live))
}

/// Launch a reader task for a freshly acquired lease. The task removes
/// itself from the held map on exit and escalates fatal errors.
#[allow(clippy::too_many_arguments)]
async fn spawn_reader<S, K, P>(
    config: &Arc<ConsumerConfig>,
    manager: &Arc<LeaseManager<S>>,
    stream: &Arc<K>,
    processor: &Arc<P>,
    held: &Arc<DashMap<String, Arc<HeldShard>>>,
    tasks: &Arc<Mutex<TaskRegistry>>,
    fatal_tx: &mpsc::Sender<ConsumerError>,
    lease: ShardLease,
) where
    S: LeaseStore + 'static,
    K: StreamService + 'static,
    P: Processor,
{
    let shard = Arc::new(HeldShard::new(&lease.shard_id));
    held.insert(lease.shard_id.clone(), shard.clone());
    metrics::set_held_shards(&config.stream_name, held.len());

    let reader = ShardReader::new(
        config.clone(),
        shard,
        lease.checkpoint.clone(),
        manager.clone(),
        stream.clone(),
        processor.clone(),
    );

    let shard_id = lease.shard_id;
    let stream_name = config.stream_name.clone();
    let held = held.clone();
    let fatal_tx = fatal_tx.clone();
    let task_shard_id = shard_id.clone();
    tasks.lock().await.spawn(format!("reader-{shard_id}"), async move {
        let result = reader.run().await;
        held.remove(&task_shard_id);
        metrics::set_held_shards(&stream_name, held.len());
        if let Err(err) = result {
            let _ = fatal_tx.try_send(err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Batch, Disposition, ShardContext};
    use crate::store_memory::InMemoryLeaseStore;
    use crate::stream_mock::MockStream;
    use crate::stream::IteratorPosition;

    struct NoopProcessor;

    #[async_trait::async_trait]
    impl Processor for NoopProcessor {
        async fn process_records(
            &self,
            _ctx: &ShardContext,
            _batch: Batch,
        ) -> Result<Disposition, crate::error::BoxError> {
            Ok(Disposition::Checkpoint)
        }
    }

    fn consumer(
        config: ConsumerConfig,
        store: Arc<InMemoryLeaseStore>,
        stream: Arc<MockStream>,
    ) -> ShardConsumer<InMemoryLeaseStore, MockStream, NoopProcessor> {
        ShardConsumer::new(config, store, stream, Arc::new(NoopProcessor)).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_before_any_io() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stream = Arc::new(MockStream::new("events", 1));
        let result = ShardConsumer::new(
            ConsumerConfig::default(),
            store,
            stream,
            Arc::new(NoopProcessor),
        );
        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }

    #[tokio::test]
    async fn checkpoint_on_unheld_shard_is_rejected_locally() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stream = Arc::new(MockStream::new("events", 1));
        let consumer = consumer(ConsumerConfig::new("events"), store, stream);

        let err = consumer.checkpoint("shard-0000", "01").await.unwrap_err();
        assert!(matches!(err, ConsumerError::NotHeld(_)));
    }

    #[tokio::test]
    async fn start_registers_and_seeds_topology() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stream = Arc::new(MockStream::new("events", 2));
        let config = ConsumerConfig {
            instance_id: "worker-a".into(),
            iterator_position: IteratorPosition::TrimHorizon,
            ..ConsumerConfig::new("events")
        };
        let consumer = consumer(config, store.clone(), stream);

        consumer.start().await.unwrap();
        assert_eq!(store.list_leases().await.unwrap().len(), 2);
        assert_eq!(store.instance_count().await, 1);

        consumer.stop().await;
        assert!(store.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_unblocks_wait() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let stream = Arc::new(MockStream::new("events", 1));
        let consumer = consumer(ConsumerConfig::new("events"), store, stream);

        consumer.stop().await;
        consumer.stop().await;
        consumer.wait().await.unwrap();
    }
}
