//! Multi-worker lease coordination: races, expiry takeover and resumption.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use shardflow::config::ConsumerConfig;
use shardflow::consumer::ShardConsumer;
use shardflow::error::BoxError;
use shardflow::lease::{LeaseStatus, ShardLease};
use shardflow::manager::{AcquireOutcome, LeaseManager};
use shardflow::processor::{Batch, Disposition, Processor, ShardContext};
use shardflow::store_memory::InMemoryLeaseStore;
use shardflow::stream::IteratorPosition;
use shardflow::stream_mock::MockStream;

struct Collecting {
    seen: Mutex<Vec<String>>,
}

impl Collecting {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl Processor for Collecting {
    async fn process_records(
        &self,
        _ctx: &ShardContext,
        batch: Batch,
    ) -> Result<Disposition, BoxError> {
        let mut seen = self.seen.lock().await;
        for record in &batch.records {
            seen.push(String::from_utf8_lossy(&record.data).to_string());
        }
        Ok(Disposition::Checkpoint)
    }
}

async fn wait_until<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn n_way_acquisition_race_has_exactly_one_winner() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store
        .seed_lease(ShardLease::new_available("shard-0000", "0", "100", None))
        .await;

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let manager = LeaseManager::new(&format!("worker-{worker}"), 120_000, 10, store);
            manager.try_acquire_next(|_| false).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), AcquireOutcome::Acquired(_)) {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let lease = store.lease("shard-0000").await.unwrap();
    assert_eq!(lease.status, LeaseStatus::Leased);
    assert!(lease.owner.is_some());
}

#[tokio::test]
async fn successor_waits_for_expiry_then_resumes_from_checkpoint() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let stream = Arc::new(MockStream::new("events", 1));
    let sequence = stream.append("shard-0000", "k", b"hello").await;

    let config_a = ConsumerConfig {
        instance_id: "worker-a".into(),
        iterator_position: IteratorPosition::TrimHorizon,
        lease_timeout_ms: 1_500,
        min_process_time_ms: 0,
        acquire_retry_delay_ms: 25,
        heartbeat_interval_ms: 100,
        ..ConsumerConfig::new("events")
    };
    let processor_a = Collecting::new();
    let worker_a = ShardConsumer::new(config_a, store.clone(), stream.clone(), processor_a.clone())
        .unwrap();
    worker_a.start().await.unwrap();

    wait_until("worker A checkpoint", || async {
        store
            .lease("shard-0000")
            .await
            .is_some_and(|l| l.checkpoint.is_some())
    })
    .await;

    // Stopping does not release the lease; it is left to expire.
    worker_a.stop().await;
    let lease = store.lease("shard-0000").await.unwrap();
    assert_eq!(lease.owner.as_deref(), Some("worker-a"));
    assert_eq!(lease.status, LeaseStatus::Leased);

    let manager_b = LeaseManager::new("worker-b", 120_000, 10, store.clone());
    assert!(matches!(
        manager_b.try_acquire_next(|_| false).await.unwrap(),
        AcquireOutcome::NoneEligible
    ));

    // Past worker A's expiry the lease becomes eligible, checkpoint intact.
    tokio::time::sleep(Duration::from_millis(1_700)).await;
    let AcquireOutcome::Acquired(taken) = manager_b.try_acquire_next(|_| false).await.unwrap()
    else {
        panic!("expected takeover after expiry");
    };
    assert_eq!(taken.owner.as_deref(), Some("worker-b"));
    assert_eq!(taken.checkpoint.as_deref(), Some(sequence.as_str()));
    assert_eq!(*processor_a.seen.lock().await, ["hello"]);
}

#[tokio::test]
async fn dead_worker_records_flow_to_the_survivor() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let stream = Arc::new(MockStream::new("events", 1));
    stream.append("shard-0000", "k", b"before-crash").await;

    let config = |id: &str| ConsumerConfig {
        instance_id: id.into(),
        iterator_position: IteratorPosition::TrimHorizon,
        lease_timeout_ms: 400,
        min_process_time_ms: 0,
        acquire_retry_delay_ms: 25,
        heartbeat_interval_ms: 100,
        ..ConsumerConfig::new("events")
    };

    let processor_a = Collecting::new();
    let worker_a =
        ShardConsumer::new(config("worker-a"), store.clone(), stream.clone(), processor_a.clone())
            .unwrap();
    worker_a.start().await.unwrap();
    wait_until("worker A checkpoint", || async {
        store
            .lease("shard-0000")
            .await
            .is_some_and(|l| l.checkpoint.is_some())
    })
    .await;
    // Simulated crash: tasks die, no deregistration, lease not released.
    worker_a.stop().await;

    stream.append("shard-0000", "k", b"after-crash").await;
    stream.close_shard("shard-0000").await;

    let processor_b = Collecting::new();
    let worker_b =
        ShardConsumer::new(config("worker-b"), store.clone(), stream.clone(), processor_b.clone())
            .unwrap();
    worker_b.start().await.unwrap();

    wait_until("survivor finishes the shard", || async {
        store
            .lease("shard-0000")
            .await
            .is_some_and(|l| l.status == LeaseStatus::Complete)
    })
    .await;
    worker_b.stop().await;

    // At-least-once across the handoff, no replay before the checkpoint.
    assert_eq!(*processor_a.seen.lock().await, ["before-crash"]);
    assert_eq!(*processor_b.seen.lock().await, ["after-crash"]);
}
