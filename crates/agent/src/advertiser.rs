//! Periodic capacity advertisements.
//!
//! Every interval the agent publishes how much memory and disk remain
//! unreserved, letting schedulers place new tasks. Capacity is configured
//! in bytes internally; the wire format carries whole megabytes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use sandgate_core::messages::{Advertisement, ADVERTISE_SUBJECT};
use sandgate_core::traits::{ContainerBackend, MessageBus};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

pub struct Advertiser {
    agent_id: Uuid,
    backend: Arc<dyn ContainerBackend>,
    bus: Arc<dyn MessageBus>,
    capacity_memory_bytes: u64,
    capacity_disk_bytes: u64,
    interval: Duration,
}

impl Advertiser {
    pub fn new(
        agent_id: Uuid,
        backend: Arc<dyn ContainerBackend>,
        bus: Arc<dyn MessageBus>,
        capacity_memory_bytes: u64,
        capacity_disk_bytes: u64,
        interval: Duration,
    ) -> Self {
        Self {
            agent_id,
            backend,
            bus,
            capacity_memory_bytes,
            capacity_disk_bytes,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.advertise_once().await;
        }
    }

    /// Compute available capacity from live reservations and publish it.
    /// Failures are logged and skipped; the next tick tries again.
    pub async fn advertise_once(&self) {
        let reservations = match self.backend.reservations().await {
            Ok(reservations) => reservations,
            Err(e) => {
                tracing::warn!(error = %e, "skipping advertisement, reservations unreadable");
                return;
            }
        };

        let (reserved_memory, reserved_disk) = reservations
            .iter()
            .fold((0u64, 0u64), |(memory, disk), reservation| {
                (
                    memory + reservation.memory_bytes,
                    disk + reservation.disk_bytes,
                )
            });

        let advertisement = Advertisement {
            id: self.agent_id.to_string(),
            available_memory: self.capacity_memory_bytes.saturating_sub(reserved_memory)
                / BYTES_PER_MEGABYTE,
            available_disk: self.capacity_disk_bytes.saturating_sub(reserved_disk)
                / BYTES_PER_MEGABYTE,
        };

        let payload = match serde_json::to_vec(&advertisement) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "advertisement serialization failed");
                return;
            }
        };

        if let Err(e) = self.bus.publish(ADVERTISE_SUBJECT, payload).await {
            tracing::warn!(error = %e, "advertisement publish failed");
        } else {
            tracing::debug!(
                available_memory = advertisement.available_memory,
                available_disk = advertisement.available_disk,
                "capacity advertised"
            );
        }
    }
}
