//! Heartbeat tick: renewals, instance presence and zombie detection.
//!
//! Every tick re-registers this instance and walks the held shards. The
//! zombie check runs before renewal on purpose: renewing the lease of a
//! reader that stopped making progress would keep its shard unreclaimable
//! indefinitely, so a stalled reader fails the whole instance instead and the
//! lease is left to expire.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{ConsumerError, StoreError};
use crate::lease::now_ms;
use crate::manager::LeaseManager;
use crate::reader::HeldShard;
use crate::registry::InstanceRegistry;
use crate::store::LeaseStore;

/// Periodic maintenance driver, one per consumer instance.
pub struct HeartbeatScheduler<S> {
    manager: Arc<LeaseManager<S>>,
    registry: Arc<InstanceRegistry<S>>,
    held: Arc<DashMap<String, Arc<HeldShard>>>,
    max_process_time_ms: i64,
    interval: Duration,
    fatal_tx: mpsc::Sender<ConsumerError>,
}

impl<S: LeaseStore> HeartbeatScheduler<S> {
    pub fn new(
        manager: Arc<LeaseManager<S>>,
        registry: Arc<InstanceRegistry<S>>,
        held: Arc<DashMap<String, Arc<HeldShard>>>,
        max_process_time_ms: i64,
        interval: Duration,
        fatal_tx: mpsc::Sender<ConsumerError>,
    ) -> Self {
        Self {
            manager,
            registry,
            held,
            max_process_time_ms,
            interval,
            fatal_tx,
        }
    }

    /// Tick forever. Shutdown comes from the task registry cancelling this
    /// future.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so
        // startup registration is not immediately repeated.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One maintenance pass. Public so tests can drive ticks deterministically.
    pub async fn tick(&self) {
        if let Err(error) = self.registry.register().await {
            // Worst case the instance row expires and peers briefly
            // over-count their quota; leases are unaffected.
            warn!(%error, "Instance re-registration failed");
        }
        match self.registry.live_instances().await {
            Ok(live) => debug!(live, "Instance sweep complete"),
            Err(error) => warn!(%error, "Instance sweep failed"),
        }

        let now = now_ms();
        let shards: Vec<Arc<HeldShard>> =
            self.held.iter().map(|entry| entry.value().clone()).collect();
        for shard in shards {
            if shard.is_revoked() {
                continue;
            }

            let stalled_ms = shard.stalled_ms(now);
            if stalled_ms > self.max_process_time_ms {
                error!(
                    shard_id = %shard.shard_id,
                    stalled_ms,
                    max_process_time_ms = self.max_process_time_ms,
                    "Reader made no fetch progress within the zombie threshold"
                );
                shard.revoke();
                let _ = self
                    .fatal_tx
                    .try_send(ConsumerError::ZombieDetected {
                        shard_id: shard.shard_id.clone(),
                        stalled_ms,
                    });
                continue;
            }

            match self.manager.renew(&shard.shard_id).await {
                Ok(lease) => {
                    debug!(
                        shard_id = %shard.shard_id,
                        expires_at = lease.expires_at,
                        heartbeat_counter = lease.heartbeat_counter,
                        "Lease renewed"
                    );
                }
                Err(StoreError::Precondition) => {
                    // Expired and reclaimed, or completed under us. Not fatal:
                    // the reader winds down and the shard lives elsewhere now.
                    self.manager.note_revoked(&shard.shard_id);
                    shard.revoke();
                }
                Err(error) => {
                    // Transient store trouble. The lease has renewal slack, so
                    // waiting for the next tick is safe.
                    warn!(shard_id = %shard.shard_id, %error, "Lease renewal failed");
                }
            }
        }
    }
}
