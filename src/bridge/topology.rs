//! Topology Binder: declares the exchange and queues a handler relies on.

use tracing::{debug, instrument};

use crate::error::{BridgeError, BridgeResult, BrokerError};
use crate::transport::BrokerChannel;
use crate::types::HandlerConfig;

/// Declares exchange, main queue and trash queue, and binds them.
///
/// Every step is a plain AMQP declare/bind, so running it again against an
/// already prepared broker changes nothing.
pub struct TopologyBinder<'a> {
    config: &'a HandlerConfig,
}

impl<'a> TopologyBinder<'a> {
    pub fn new(config: &'a HandlerConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, channel), fields(exchange = %self.config.exchange))]
    pub async fn bind(&self, channel: &dyn BrokerChannel) -> BridgeResult<()> {
        let config = self.config;

        channel
            .declare_exchange(&config.exchange, config.exchange_type, config.durable)
            .await
            .map_err(|e| {
                topology_error(e, format!("declare exchange '{}'", config.exchange))
            })?;

        self.bind_queue(channel, &config.queue, &config.routing_key)
            .await?;

        if let Some(recycler) = &config.recycler {
            self.bind_queue(channel, &recycler.queue, recycler.routing_key())
                .await?;
        }

        debug!(
            queue = %config.queue,
            trash = ?config.recycler.as_ref().map(|r| r.queue.as_str()),
            "Topology ready"
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        routing_key: &str,
    ) -> BridgeResult<()> {
        channel
            .declare_queue(queue, self.config.durable)
            .await
            .map_err(|e| topology_error(e, format!("declare queue '{queue}'")))?;
        channel
            .bind_queue(queue, &self.config.exchange, routing_key)
            .await
            .map_err(|e| {
                topology_error(e, format!("bind queue '{queue}' with key '{routing_key}'"))
            })?;
        Ok(())
    }
}

/// Always a topology error, even though the broker closes the channel after
/// refusing a declaration.
fn topology_error(err: BrokerError, step: String) -> BridgeError {
    BridgeError::Topology(format!("{step}: {}", err.message))
}
