//! # Handler
//!
//! [`RabbitmqHandler`] ties the bridge components together around one broker
//! channel:
//!
//! ```text
//! prepare ──► ChannelManager ──► TopologyBinder
//!                  │
//!      ┌───────────┼──────────────┬───────────────┐
//!      ▼           ▼              ▼               ▼
//!  chain pool  trash pool     Publisher     QueueInspector
//! ```

pub mod channel;
pub mod delivery;
pub mod inspector;
pub mod pool;
pub mod publisher;
pub mod topology;

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::observer::{BridgeEvent, Observer, PoolKind, TracingObserver};
use crate::transport::{BrokerChannel, Connector};
use crate::types::{HandlerConfig, QueueStatus};
use crate::ORDERED_PREFETCH;

pub use channel::{ChannelManager, ConnectionLostHook};
pub use delivery::{Finish, MessageHandler};
pub use inspector::QueueInspector;
pub use pool::{ConsumerPool, Registration};
pub use publisher::{EnqueueOptions, EnqueueOverrides, Publisher};
pub use topology::TopologyBinder;

use delivery::{FailurePolicy, RecycleRoute};

/// State that only exists between `prepare` and `destroy`.
struct Session {
    channel: Arc<dyn BrokerChannel>,
    publisher: Publisher,
    worker: JoinHandle<()>,
}

/// Client bridge for one exchange, its main queue and optional trash queue.
///
/// Call [`destroy`](Self::destroy) before dropping a prepared handler.
/// Dropping it only stops the local tasks and schedules the channel close on
/// the current runtime, without flushing queued publishes.
pub struct RabbitmqHandler {
    config: Arc<HandlerConfig>,
    observer: Arc<dyn Observer>,
    channels: Arc<ChannelManager>,
    inspector: QueueInspector,
    chain: ConsumerPool,
    trash: Option<ConsumerPool>,
    session: RwLock<Option<Session>>,
    /// Serializes prepare and destroy
    lifecycle: Mutex<()>,
}

impl RabbitmqHandler {
    /// Build a handler that logs through `tracing`. Nothing is contacted
    /// until [`prepare`](Self::prepare).
    pub fn new(config: HandlerConfig, connector: Arc<dyn Connector>) -> BridgeResult<Self> {
        Self::with_observer(config, connector, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        config: HandlerConfig,
        connector: Arc<dyn Connector>,
        observer: Arc<dyn Observer>,
    ) -> BridgeResult<Self> {
        config.validate()?;

        let channels = Arc::new(ChannelManager::new(
            &config.uri,
            config.confirms,
            connector,
            Arc::clone(&observer),
        ));
        let chain = ConsumerPool::new(
            PoolKind::Chain,
            &config.queue,
            config.no_ack,
            config.max_consumers,
            &config.consumer_tag_prefix,
            Arc::clone(&observer),
        );
        let trash = config.recycler.as_ref().map(|recycler| {
            ConsumerPool::new(
                PoolKind::Trash,
                &recycler.queue,
                recycler.no_ack,
                recycler.max_consumers,
                &config.consumer_tag_prefix,
                Arc::clone(&observer),
            )
        });

        Ok(Self {
            inspector: QueueInspector::new(Arc::clone(&channels)),
            config: Arc::new(config),
            observer,
            channels,
            chain,
            trash,
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn is_prepared(&self) -> bool {
        self.read_session(|session| session.is_some())
    }

    /// Connect, declare the topology and start the publisher.
    ///
    /// Calling it again on a prepared handler re-runs the declarations;
    /// after a connection loss it opens a fresh connection.
    #[instrument(skip(self), fields(exchange = %self.config.exchange, queue = %self.config.queue))]
    pub async fn prepare(&self) -> BridgeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let channel = self.channels.open().await?;
        TopologyBinder::new(&self.config)
            .bind(channel.as_ref())
            .await?;

        let stale = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            match session.as_ref() {
                Some(current) if Arc::ptr_eq(&current.channel, &channel) => None,
                _ => {
                    let (publisher, worker) = Publisher::start(
                        Arc::clone(&channel),
                        &self.config.exchange,
                        &self.config.routing_key,
                        Arc::clone(&self.observer),
                    );
                    session.replace(Session {
                        channel,
                        publisher,
                        worker,
                    })
                }
            }
        };
        if let Some(stale) = stale {
            stale.worker.abort();
        }

        self.observer.observe(BridgeEvent::Prepared);
        Ok(())
    }

    /// Cancel every registration, then close the channel and the connection.
    ///
    /// Unacknowledged deliveries return to the broker. Safe to call on a
    /// handler that was never prepared or is already destroyed.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> BridgeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = &session {
            session.publisher.flush().await;
        }

        let channel = self.channels.channel().await.ok();
        self.chain.destroy(channel.as_deref()).await;
        if let Some(trash) = &self.trash {
            trash.destroy(channel.as_deref()).await;
        }
        drop(channel);
        self.channels.close().await;

        if let Some(session) = session {
            session.worker.abort();
            self.observer.observe(BridgeEvent::Destroyed);
        }
        Ok(())
    }

    /// Publish `message` with the default routing key and wait for the broker.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> BridgeResult<()> {
        self.publisher()?.publish(message).await
    }

    /// Queue `message` for publishing, optionally copying it to extra routing
    /// keys or replacing the routing key for this call.
    pub fn enqueue<T: Serialize + ?Sized>(
        &self,
        message: &T,
        options: EnqueueOptions,
        overrides: EnqueueOverrides,
    ) -> BridgeResult<()> {
        self.publisher()?.enqueue(message, &options, &overrides)
    }

    /// Register a pooled consumer on the main queue.
    pub async fn process<H: MessageHandler>(&self, handler: H) -> BridgeResult<Registration> {
        self.chain
            .register(
                &self.channels,
                Arc::new(handler),
                self.config.prefetch,
                false,
                self.chain_failure_policy(),
            )
            .await
    }

    /// Register a consumer on the main queue that sees one unacknowledged
    /// delivery at a time, so `handler` runs strictly in publish order.
    /// The next call waits for the previous [`Finish`], also with `no_ack`.
    ///
    /// Takes a slot from the main queue's quota like [`process`](Self::process).
    pub async fn consume<H: MessageHandler>(&self, handler: H) -> BridgeResult<Registration> {
        self.chain
            .register(
                &self.channels,
                Arc::new(handler),
                ORDERED_PREFETCH,
                true,
                self.chain_failure_policy(),
            )
            .await
    }

    /// Register a consumer on the trash queue.
    pub async fn recycle<H: MessageHandler>(&self, handler: H) -> BridgeResult<Registration> {
        let trash = self.trash.as_ref().ok_or(BridgeError::RecyclerNotConfigured)?;
        trash
            .register(
                &self.channels,
                Arc::new(handler),
                self.config.prefetch,
                false,
                FailurePolicy::Requeue,
            )
            .await
    }

    /// Cancel one registration by consumer tag. Returns `false` for unknown tags.
    pub async fn cancel(&self, consumer_tag: &str) -> BridgeResult<bool> {
        let channel = self.channels.channel().await?;
        if self.chain.cancel(channel.as_ref(), consumer_tag).await? {
            return Ok(true);
        }
        match &self.trash {
            Some(trash) => trash.cancel(channel.as_ref(), consumer_tag).await,
            None => Ok(false),
        }
    }

    pub async fn check_chain(&self) -> BridgeResult<QueueStatus> {
        self.inspector.check(&self.config.queue).await
    }

    pub async fn check_trash(&self) -> BridgeResult<QueueStatus> {
        self.inspector.check(self.trash_queue()?).await
    }

    /// Remove all ready messages from the main queue, returning how many.
    pub async fn purge_chain(&self) -> BridgeResult<u32> {
        self.inspector.purge(&self.config.queue).await
    }

    pub async fn purge_trash(&self) -> BridgeResult<u32> {
        self.inspector.purge(self.trash_queue()?).await
    }

    /// Call `hook` whenever the connection drops outside of a call.
    pub fn on_connection_lost(&self, hook: ConnectionLostHook) {
        self.channels.on_connection_lost(hook);
    }

    pub fn chain_pool(&self) -> &ConsumerPool {
        &self.chain
    }

    pub fn trash_pool(&self) -> Option<&ConsumerPool> {
        self.trash.as_ref()
    }

    fn publisher(&self) -> BridgeResult<Publisher> {
        self.read_session(|session| session.map(|s| s.publisher.clone()))
            .ok_or(BridgeError::NotPrepared)
    }

    fn trash_queue(&self) -> BridgeResult<&str> {
        self.config
            .recycler
            .as_ref()
            .map(|recycler| recycler.queue.as_str())
            .ok_or(BridgeError::RecyclerNotConfigured)
    }

    fn chain_failure_policy(&self) -> FailurePolicy {
        let (Some(recycler), Ok(publisher)) = (&self.config.recycler, self.publisher()) else {
            return FailurePolicy::Requeue;
        };
        FailurePolicy::Recycle(RecycleRoute {
            publisher,
            chain_routing_key: self.config.routing_key.clone(),
            trash_routing_key: recycler.routing_key().to_string(),
            limit: recycler.redelivered_limit,
            count_header: recycler.redelivered_count_name.clone(),
        })
    }

    fn read_session<R>(&self, f: impl FnOnce(Option<&Session>) -> R) -> R {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        f(session.as_ref())
    }
}

impl Drop for RabbitmqHandler {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(session) = session else {
            return;
        };
        info!(queue = %self.config.queue, "Handler dropped without destroy");
        session.worker.abort();
        self.chain.abort_all();
        if let Some(trash) = &self.trash {
            trash.abort_all();
        }
        drop(session.channel);
        match Handle::try_current() {
            Ok(runtime) => {
                let channels = Arc::clone(&self.channels);
                runtime.spawn(async move { channels.close().await });
            }
            Err(_) => warn!(queue = %self.config.queue, "No runtime left to close the channel"),
        }
    }
}
