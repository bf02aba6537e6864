//! Message handlers and the completion token handed to them.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use super::publisher::Publisher;
use crate::observer::{BridgeEvent, Observer, PoolKind};
use crate::transport::{Acker, CC_HEADER};
use crate::types::{DeliveryInfo, HeaderValue, Headers};

/// Processes deliveries for one registration.
///
/// Called once per delivery, never concurrently for the same registration.
/// The [`Finish`] token may be moved elsewhere (another task, a batch) and
/// settled later.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, payload: Vec<u8>, info: DeliveryInfo, finish: Finish);
}

impl<F> MessageHandler for F
where
    F: Fn(Vec<u8>, DeliveryInfo, Finish) + Send + Sync + 'static,
{
    fn handle(&self, payload: Vec<u8>, info: DeliveryInfo, finish: Finish) {
        self(payload, info, finish)
    }
}

/// Where a failed delivery goes.
#[derive(Clone)]
pub(crate) enum FailurePolicy {
    /// Back to the front of its own queue
    Requeue,
    /// Republished with a bumped redelivery count, to the trash queue once the
    /// limit is passed
    Recycle(RecycleRoute),
}

#[derive(Clone)]
pub(crate) struct RecycleRoute {
    pub publisher: Publisher,
    pub chain_routing_key: String,
    pub trash_routing_key: String,
    pub limit: u32,
    pub count_header: String,
}

/// Shared by every delivery of one registration.
pub(crate) struct DeliveryContext {
    pub pool: PoolKind,
    pub observer: Arc<dyn Observer>,
    pub runtime: Handle,
    pub failure: FailurePolicy,
}

struct Retained {
    payload: Vec<u8>,
    headers: Headers,
}

/// Single-use completion signal for one delivery.
///
/// Consuming the token settles the delivery with the broker. Dropping it
/// without calling any method withholds the acknowledgment, so the broker
/// redelivers the message once the channel closes.
///
/// On ordered registrations the token also holds the registration's turn:
/// the next delivery is not handed out until this one is consumed or dropped,
/// with or without acknowledgments.
pub struct Finish {
    delivery_tag: u64,
    acker: Option<Box<dyn Acker>>,
    ctx: Arc<DeliveryContext>,
    retained: Option<Retained>,
    turn: Option<OwnedSemaphorePermit>,
}

impl Finish {
    pub(crate) fn new(
        ctx: Arc<DeliveryContext>,
        delivery_tag: u64,
        acker: Option<Box<dyn Acker>>,
        turn: Option<OwnedSemaphorePermit>,
        payload: &[u8],
        headers: &Headers,
    ) -> Self {
        let retained = match ctx.failure {
            FailurePolicy::Recycle(_) => Some(Retained {
                payload: payload.to_vec(),
                headers: headers.clone(),
            }),
            FailurePolicy::Requeue => None,
        };
        Self {
            delivery_tag,
            acker,
            ctx,
            retained,
            turn,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge the delivery. With acknowledgments disabled this only
    /// marks the handler as done.
    pub fn done(self) {
        let Some(acker) = self.acker else {
            return;
        };
        let ctx = self.ctx;
        let delivery_tag = self.delivery_tag;
        ctx.runtime.clone().spawn(async move {
            settle(&ctx, delivery_tag, acker.as_ref(), Settlement::Ack).await;
        });
    }

    /// Put the delivery back on its queue.
    pub fn requeue(self) {
        let Some(acker) = self.acker else {
            return;
        };
        let ctx = self.ctx;
        let delivery_tag = self.delivery_tag;
        ctx.runtime.clone().spawn(async move {
            settle(&ctx, delivery_tag, acker.as_ref(), Settlement::Requeue).await;
        });
    }

    /// Report that processing failed.
    ///
    /// Main-queue deliveries of a handler with a recycler are republished
    /// with their redelivery count incremented, to the main routing key while
    /// the count stays within the limit and to the trash queue after that.
    /// Everything else is requeued.
    pub fn fail(self, reason: impl Into<String>) {
        let reason = reason.into();
        let Finish {
            delivery_tag,
            acker,
            ctx,
            retained,
            turn,
        } = self;
        drop(turn);
        warn!(pool = %ctx.pool, delivery_tag, reason = %reason, "Message handling failed");

        let route = match &ctx.failure {
            FailurePolicy::Recycle(route) => Some(route.clone()),
            FailurePolicy::Requeue => None,
        };
        match (route, retained, acker) {
            (Some(route), Some(retained), acker) => {
                ctx.runtime.clone().spawn(async move {
                    recycle(&ctx, delivery_tag, acker, &route, retained).await;
                });
            }
            (_, _, Some(acker)) => {
                ctx.runtime.clone().spawn(async move {
                    settle(&ctx, delivery_tag, acker.as_ref(), Settlement::Requeue).await;
                });
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
}

async fn settle(ctx: &DeliveryContext, delivery_tag: u64, acker: &dyn Acker, how: Settlement) {
    let result = match how {
        Settlement::Ack => acker.ack().await,
        Settlement::Requeue => acker.nack(true).await,
    };
    match (result, how) {
        (Ok(()), Settlement::Ack) => ctx.observer.observe(BridgeEvent::Acked {
            pool: ctx.pool,
            delivery_tag,
        }),
        (Ok(()), Settlement::Requeue) => ctx.observer.observe(BridgeEvent::Requeued {
            pool: ctx.pool,
            delivery_tag,
        }),
        (Err(e), _) => {
            warn!(pool = %ctx.pool, delivery_tag, error = %e, ?how, "Settling delivery failed")
        }
    }
}

async fn recycle(
    ctx: &DeliveryContext,
    delivery_tag: u64,
    acker: Option<Box<dyn Acker>>,
    route: &RecycleRoute,
    retained: Retained,
) {
    let Retained {
        payload,
        mut headers,
    } = retained;

    let count = headers
        .get(&route.count_header)
        .and_then(HeaderValue::as_int)
        .map_or(0, |count| count.max(0))
        .saturating_add(1);
    let (target, routing_key) = if count <= i64::from(route.limit) {
        (PoolKind::Chain, route.chain_routing_key.clone())
    } else {
        (PoolKind::Trash, route.trash_routing_key.clone())
    };
    // the copies already went out with the first publish
    headers.remove(CC_HEADER);
    headers.insert(route.count_header.clone(), HeaderValue::Int(count));

    match route.publisher.send(routing_key, payload, headers).await {
        Ok(()) => {
            if let Some(acker) = &acker {
                settle(ctx, delivery_tag, acker.as_ref(), Settlement::Ack).await;
            }
            ctx.observer.observe(BridgeEvent::Recycled {
                delivery_tag,
                target,
                redelivered_count: u32::try_from(count).unwrap_or(u32::MAX),
            });
        }
        Err(e) => {
            warn!(delivery_tag, error = %e, "Recycling failed, requeueing instead");
            if let Some(acker) = &acker {
                settle(ctx, delivery_tag, acker.as_ref(), Settlement::Requeue).await;
            }
        }
    }
}
