//! # Broker Transport
//!
//! The bridge never talks to a broker client library directly. Everything
//! goes through the [`Connector`] / [`BrokerChannel`] pair defined here.
//!
//! ## Implementations
//! - [`AmqpConnector`]: AMQP 0-9-1 over `lapin`
//! - [`MemoryBroker`]: in-process broker with the same routing, prefetch and
//!   acknowledgment semantics, used by tests and broker-free deployments

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;
use crate::types::{ExchangeType, Headers, QueueStatus};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Header carrying sender-selected extra routing keys.
pub const CC_HEADER: &str = "CC";

/// Invoked by a transport when its connection fails outside of any call.
pub type FailureHook = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Stream of deliveries for one consumer registration.
///
/// The stream ends when the consumer is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `uri` and open one channel on the new connection.
    async fn connect(
        &self,
        uri: &str,
        on_failure: FailureHook,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// Subscription settings for [`BrokerChannel::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    /// Maximum unacknowledged deliveries for this consumer, 0 for unlimited
    pub prefetch: u16,
}

/// One open channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Make `publish` wait for the broker's confirmation.
    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueStatus, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Passive queue lookup.
    async fn inspect_queue(&self, queue: &str) -> Result<QueueStatus, BrokerError>;

    /// Drop all ready messages, returning how many were removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Close the channel and its connection. Unacknowledged deliveries go
    /// back to their queues.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
