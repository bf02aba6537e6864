//! AMQP Bridge Library
//!
//! A message-queue client bridge for AMQP brokers: admission-controlled
//! consumer pools for a main queue and a trash queue, ordered consumption,
//! and publishing with CC fan-out and per-call routing keys.

pub mod api;
pub mod bridge;
pub mod error;
pub mod observer;
pub mod transport;
pub mod types;

pub use bridge::{
    EnqueueOptions, EnqueueOverrides, Finish, MessageHandler, RabbitmqHandler, Registration,
};
pub use error::{BridgeError, BridgeResult, BrokerError};
pub use observer::{BridgeEvent, Observer, PoolKind, TracingObserver};
pub use transport::{AmqpConnector, MemoryBroker};
pub use types::{DeliveryInfo, ExchangeType, HandlerConfig, HeaderValue, QueueStatus, RecyclerConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bridge::{EnqueueOptions, EnqueueOverrides, Finish, MessageHandler, RabbitmqHandler};
    pub use crate::error::*;
    pub use crate::types::*;
}

/// Prefix of generated consumer tags
pub const DEFAULT_CONSUMER_TAG_PREFIX: &str = "amqp-bridge";

/// Header counting how often a failed delivery was republished
pub const DEFAULT_REDELIVERED_COUNT_NAME: &str = "x-redelivered-count";

/// Republish attempts before a failed delivery goes to the trash queue
pub const DEFAULT_REDELIVERED_LIMIT: u32 = 5;

/// Prefetch used by ordered consumers
pub const ORDERED_PREFETCH: u16 = 1;
