//! Queue Inspector: point-in-time status and purge of the handler's queues.

use std::sync::Arc;

use tracing::{info, instrument};

use super::channel::{classify, ChannelManager};
use crate::error::{BridgeError, BridgeResult};
use crate::types::QueueStatus;

pub struct QueueInspector {
    channels: Arc<ChannelManager>,
}

impl QueueInspector {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels }
    }

    /// Server-reported message and consumer counts for `queue`.
    #[instrument(skip(self))]
    pub async fn check(&self, queue: &str) -> BridgeResult<QueueStatus> {
        self.channels
            .with_channel(|channel| async move {
                channel
                    .inspect_queue(queue)
                    .await
                    .map_err(|e| classify(channel.as_ref(), e, BridgeError::Topology))
            })
            .await
    }

    /// Remove every ready message from `queue`. Bindings and subscriptions
    /// are untouched.
    #[instrument(skip(self))]
    pub async fn purge(&self, queue: &str) -> BridgeResult<u32> {
        let purged = self
            .channels
            .with_channel(|channel| async move {
                channel
                    .purge_queue(queue)
                    .await
                    .map_err(|e| classify(channel.as_ref(), e, BridgeError::Topology))
            })
            .await?;
        info!(queue, purged, "Queue purged");
        Ok(purged)
    }
}
