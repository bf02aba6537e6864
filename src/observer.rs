//! Observability hooks.
//!
//! The handler reports lifecycle, admission and delivery outcomes to an
//! [`Observer`] supplied at construction. [`TracingObserver`] forwards them
//! to `tracing`; embedders can plug metrics sinks in its place.

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Which consumer pool an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Registrations on the main queue
    Chain,
    /// Registrations on the recycler (trash) queue
    Trash,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Chain => f.write_str("chain"),
            PoolKind::Trash => f.write_str("trash"),
        }
    }
}

/// Something worth recording happened inside the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Prepared,
    Destroyed,
    ConnectionLost { reason: String },
    ConsumerRegistered { pool: PoolKind, consumer_tag: String, active: usize },
    ConsumerCancelled { pool: PoolKind, consumer_tag: String },
    QuotaRejected { pool: PoolKind, max_consumers: usize },
    Published { routing_key: String },
    PublishFailed { routing_key: String, reason: String },
    Acked { pool: PoolKind, delivery_tag: u64 },
    Requeued { pool: PoolKind, delivery_tag: u64 },
    /// A failed delivery was sent back to the main queue or on to the trash queue
    Recycled { delivery_tag: u64, target: PoolKind, redelivered_count: u32 },
    HandlerPanicked { pool: PoolKind, delivery_tag: u64 },
}

/// Receives [`BridgeEvent`]s. Must not block.
pub trait Observer: Send + Sync {
    fn observe(&self, event: BridgeEvent);
}

/// Default observer that logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Prepared => info!("Bridge prepared"),
            BridgeEvent::Destroyed => info!("Bridge destroyed"),
            BridgeEvent::ConnectionLost { reason } => {
                error!(reason = %reason, "Broker connection lost")
            }
            BridgeEvent::ConsumerRegistered { pool, consumer_tag, active } => {
                info!(pool = %pool, consumer_tag = %consumer_tag, active, "Consumer registered")
            }
            BridgeEvent::ConsumerCancelled { pool, consumer_tag } => {
                info!(pool = %pool, consumer_tag = %consumer_tag, "Consumer cancelled")
            }
            BridgeEvent::QuotaRejected { pool, max_consumers } => {
                warn!(pool = %pool, max_consumers, "Consumer quota exceeded")
            }
            BridgeEvent::Published { routing_key } => {
                debug!(routing_key = %routing_key, "Message published")
            }
            BridgeEvent::PublishFailed { routing_key, reason } => {
                error!(routing_key = %routing_key, reason = %reason, "Publish failed")
            }
            BridgeEvent::Acked { pool, delivery_tag } => {
                debug!(pool = %pool, delivery_tag, "Delivery acknowledged")
            }
            BridgeEvent::Requeued { pool, delivery_tag } => {
                debug!(pool = %pool, delivery_tag, "Delivery requeued")
            }
            BridgeEvent::Recycled { delivery_tag, target, redelivered_count } => {
                warn!(delivery_tag, target = %target, redelivered_count, "Delivery recycled")
            }
            BridgeEvent::HandlerPanicked { pool, delivery_tag } => {
                error!(pool = %pool, delivery_tag, "Message handler panicked, acknowledgment withheld")
            }
        }
    }
}
