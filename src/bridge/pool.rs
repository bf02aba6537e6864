//! Consumer pools: admission-controlled registries of subscriptions on one
//! queue. The main queue and the trash queue each get their own pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::channel::{classify, ChannelManager};
use super::delivery::{DeliveryContext, FailurePolicy, Finish, MessageHandler};
use crate::error::{BridgeError, BridgeResult};
use crate::observer::{BridgeEvent, Observer, PoolKind};
use crate::transport::{BrokerChannel, ConsumeOptions, Delivery, DeliveryStream};
use crate::types::DeliveryInfo;

/// A successful subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    /// Identifier for cancelling this subscription
    pub consumer_tag: String,
    pub queue: String,
    pub pool: PoolKind,
}

struct ActiveConsumer {
    task: JoinHandle<()>,
}

struct PoolInner {
    kind: PoolKind,
    queue: String,
    no_ack: bool,
    max_consumers: Option<usize>,
    tag_prefix: String,
    active: AtomicUsize,
    registrations: DashMap<String, ActiveConsumer>,
    observer: Arc<dyn Observer>,
}

/// Holds one reserved slot until the registration is committed.
struct SlotPermit<'a> {
    active: &'a AtomicUsize,
    committed: bool,
}

impl SlotPermit<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Registry of active consumers on a single queue with an optional cap.
#[derive(Clone)]
pub struct ConsumerPool {
    inner: Arc<PoolInner>,
}

impl ConsumerPool {
    pub fn new(
        kind: PoolKind,
        queue: &str,
        no_ack: bool,
        max_consumers: Option<usize>,
        tag_prefix: &str,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind,
                queue: queue.to_string(),
                no_ack,
                max_consumers,
                tag_prefix: tag_prefix.to_string(),
                active: AtomicUsize::new(0),
                registrations: DashMap::new(),
                observer,
            }),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn max_consumers(&self) -> Option<usize> {
        self.inner.max_consumers
    }

    /// Registrations currently holding a slot.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.inner
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Subscribe `handler` to this pool's queue.
    ///
    /// The slot is taken before anything else happens, so a full pool
    /// answers without touching the broker. An `ordered` registration calls
    /// `handler` for the next delivery only after the previous [`Finish`]
    /// was consumed or dropped; prefetch alone does not hold without acks.
    #[instrument(skip(self, channels, handler, failure), fields(pool = %self.inner.kind))]
    pub(crate) async fn register(
        &self,
        channels: &ChannelManager,
        handler: Arc<dyn MessageHandler>,
        prefetch: u16,
        ordered: bool,
        failure: FailurePolicy,
    ) -> BridgeResult<Registration> {
        let inner = &self.inner;
        let permit = self.try_reserve()?;

        let channel = channels.channel().await?;
        let consumer_tag = format!(
            "{}-{}-{}",
            inner.tag_prefix,
            inner.kind,
            Uuid::new_v4().simple()
        );
        let options = ConsumeOptions {
            no_ack: inner.no_ack,
            prefetch,
        };
        let stream = channel
            .consume(&inner.queue, &consumer_tag, options)
            .await
            .map_err(|e| classify(channel.as_ref(), e, BridgeError::Consume))?;
        permit.commit();

        let ctx = Arc::new(DeliveryContext {
            pool: inner.kind,
            observer: Arc::clone(&inner.observer),
            runtime: Handle::current(),
            failure,
        });
        let (ready, gate) = oneshot::channel();
        let turns = ordered.then(|| Arc::new(Semaphore::new(1)));
        let task = tokio::spawn(run_consumer(
            Arc::clone(inner),
            consumer_tag.clone(),
            stream,
            handler,
            ctx,
            gate,
            turns,
        ));
        inner
            .registrations
            .insert(consumer_tag.clone(), ActiveConsumer { task });
        let _ = ready.send(());

        inner.observer.observe(BridgeEvent::ConsumerRegistered {
            pool: inner.kind,
            consumer_tag: consumer_tag.clone(),
            active: self.active(),
        });
        Ok(Registration {
            consumer_tag,
            queue: inner.queue.clone(),
            pool: inner.kind,
        })
    }

    /// Cancel one registration. Returns `false` when the tag is not held by
    /// this pool.
    ///
    /// The slot is given back only once the broker confirmed the cancel; on
    /// error the registration stays active and keeps its slot.
    pub async fn cancel(&self, channel: &dyn BrokerChannel, consumer_tag: &str) -> BridgeResult<bool> {
        if !self.inner.registrations.contains_key(consumer_tag) {
            return Ok(false);
        }
        channel
            .cancel(consumer_tag)
            .await
            .map_err(|e| classify(channel, e, BridgeError::Consume))?;

        // the ended stream may have released the slot already
        if let Some((_, consumer)) = self.inner.registrations.remove(consumer_tag) {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            consumer.task.abort();
        }
        self.inner.observer.observe(BridgeEvent::ConsumerCancelled {
            pool: self.inner.kind,
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(true)
    }

    /// Cancel every registration and reset the count to zero.
    ///
    /// Broker-side cancellation is best effort: `channel` is `None` or closed
    /// when the connection is already gone, in which case the broker has
    /// dropped the subscriptions itself.
    pub async fn destroy(&self, channel: Option<&dyn BrokerChannel>) {
        let tags = self.consumer_tags();
        for tag in tags {
            let Some((_, consumer)) = self.inner.registrations.remove(&tag) else {
                continue;
            };
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            if let Some(channel) = channel.filter(|ch| ch.is_open()) {
                if let Err(e) = channel.cancel(&tag).await {
                    warn!(consumer_tag = %tag, error = %e, "Cancelling consumer failed");
                }
            }
            consumer.task.abort();
            self.inner.observer.observe(BridgeEvent::ConsumerCancelled {
                pool: self.inner.kind,
                consumer_tag: tag,
            });
        }
        debug!(pool = %self.inner.kind, active = self.active(), "Pool destroyed");
    }

    /// Stop every consumer task without talking to the broker. For teardown
    /// paths that cannot await; closing the channel ends the subscriptions.
    pub(crate) fn abort_all(&self) {
        for tag in self.consumer_tags() {
            if let Some((_, consumer)) = self.inner.registrations.remove(&tag) {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                consumer.task.abort();
            }
        }
    }

    fn try_reserve(&self) -> BridgeResult<SlotPermit<'_>> {
        let inner = &self.inner;
        let reserved = inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                match inner.max_consumers {
                    Some(max) if active >= max => None,
                    _ => Some(active + 1),
                }
            });
        match (reserved, inner.max_consumers) {
            (Ok(_), _) => Ok(SlotPermit {
                active: &inner.active,
                committed: false,
            }),
            (Err(_), Some(max_consumers)) => {
                inner.observer.observe(BridgeEvent::QuotaRejected {
                    pool: inner.kind,
                    max_consumers,
                });
                Err(BridgeError::QuotaExceeded { max_consumers })
            }
            // unreachable without a limit
            (Err(_), None) => Err(BridgeError::QuotaExceeded { max_consumers: 0 }),
        }
    }
}

impl PoolInner {
    /// Drop a registration and give its slot back. Only the first caller for
    /// a tag gets `true`.
    fn release(&self, consumer_tag: &str) -> bool {
        match self.registrations.remove(consumer_tag) {
            Some(_) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn deliver(
        &self,
        consumer_tag: &str,
        handler: &dyn MessageHandler,
        ctx: &Arc<DeliveryContext>,
        delivery: Delivery,
        turn: Option<OwnedSemaphorePermit>,
    ) {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            headers,
            payload,
            acker,
        } = delivery;

        let acker = (!self.no_ack).then_some(acker);
        let finish = Finish::new(Arc::clone(ctx), delivery_tag, acker, turn, &payload, &headers);
        let info = DeliveryInfo {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            headers,
            received_at: Utc::now(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(payload, info, finish)));
        if outcome.is_err() {
            self.observer.observe(BridgeEvent::HandlerPanicked {
                pool: self.kind,
                delivery_tag,
            });
        }
    }
}

async fn run_consumer(
    inner: Arc<PoolInner>,
    consumer_tag: String,
    mut stream: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    ctx: Arc<DeliveryContext>,
    gate: oneshot::Receiver<()>,
    turns: Option<Arc<Semaphore>>,
) {
    // the registration must exist before the stream can end and remove it
    let _ = gate.await;

    while let Some(next) = stream.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(consumer_tag = %consumer_tag, error = %e, "Consumer stream failed");
                break;
            }
        };
        let turn = match &turns {
            Some(turns) => match Arc::clone(turns).acquire_owned().await {
                Ok(turn) => Some(turn),
                Err(_) => break,
            },
            None => None,
        };
        inner.deliver(&consumer_tag, handler.as_ref(), &ctx, delivery, turn);
    }

    if inner.release(&consumer_tag) {
        debug!(consumer_tag = %consumer_tag, "Consumer stream ended, slot released");
    }
}
