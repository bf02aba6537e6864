//! End-to-end handler scenarios against the in-process broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_test::assert_ok;

use amqp_bridge::transport::Connector;
use amqp_bridge::{
    BridgeError, BrokerError, DeliveryInfo, EnqueueOptions, EnqueueOverrides, ExchangeType,
    Finish, HandlerConfig, MemoryBroker, RabbitmqHandler, RecyclerConfig,
};

const EXCHANGE: &str = "tdd-recoverable-exchange";
const ROUTING_KEY: &str = "tdd-recoverable";
const QUEUE: &str = "tdd-recoverable-queue";
const TRASH: &str = "tdd-recoverable-trash";

fn config() -> HandlerConfig {
    HandlerConfig::new("memory://tdd", EXCHANGE, ROUTING_KEY, QUEUE)
        .with_recycler(RecyclerConfig::new(TRASH))
}

async fn prepared(broker: &MemoryBroker, config: HandlerConfig) -> RabbitmqHandler {
    let handler = RabbitmqHandler::new(config, Arc::new(broker.clone())).unwrap();
    assert_ok!(handler.prepare().await);
    handler
}

fn acking(_: Vec<u8>, _: DeliveryInfo, finish: Finish) {
    finish.done();
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Declare and bind an extra queue on the handler's exchange.
async fn bind_extra_queue(broker: &MemoryBroker, queue: &str, routing_key: &str) {
    let channel = broker
        .connect("memory://tdd", Arc::new(|_: BrokerError| {}))
        .await
        .unwrap();
    channel.declare_queue(queue, true).await.unwrap();
    channel.bind_queue(queue, EXCHANGE, routing_key).await.unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn unlimited_pool_accepts_every_registration() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    for _ in 0..10 {
        handler.process(acking).await.unwrap();
    }
    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 10);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn pool_rejects_registrations_past_its_limit() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config().with_max_consumers(7)).await;

    let mut rejected = Vec::new();
    for _ in 0..10 {
        if let Err(err) = handler.process(acking).await {
            rejected.push(err);
        }
    }
    assert_eq!(rejected.len(), 3);
    assert!(rejected.iter().all(|err| err.max_consumers() == Some(7)));
    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 7);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn unlimited_recycler_accepts_every_registration() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    for _ in 0..10 {
        handler.recycle(acking).await.unwrap();
    }
    assert_eq!(handler.check_trash().await.unwrap().consumer_count, 10);
    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 0);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn recycler_rejects_registrations_past_its_limit() {
    let broker = MemoryBroker::new();
    let config = config().with_recycler(RecyclerConfig::new(TRASH).with_max_consumers(8));
    let handler = prepared(&broker, config).await;

    let results = join_all((0..10).map(|_| handler.recycle(acking))).await;
    let accepted = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(accepted, 8);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(|err| matches!(err, BridgeError::QuotaExceeded { max_consumers: 8 })));
    assert_eq!(handler.check_trash().await.unwrap().consumer_count, 8);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn main_and_recycler_quotas_are_independent() {
    let broker = MemoryBroker::new();
    let config = config()
        .with_max_consumers(7)
        .with_recycler(RecyclerConfig::new(TRASH).with_max_consumers(8));
    let handler = prepared(&broker, config).await;

    for _ in 0..7 {
        handler.process(acking).await.unwrap();
    }
    assert_eq!(handler.process(acking).await.unwrap_err().max_consumers(), Some(7));

    for _ in 0..8 {
        handler.recycle(acking).await.unwrap();
    }
    assert_eq!(handler.recycle(acking).await.unwrap_err().max_consumers(), Some(8));

    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 7);
    assert_eq!(handler.check_trash().await.unwrap().consumer_count, 8);
    handler.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_never_exceeds_the_limit() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(prepared(&broker, config().with_max_consumers(5)).await);

    let attempts = (0..64).map(|_| {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.process(acking).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let accepted = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(accepted, 5);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(BridgeError::is_quota_exceeded));
    assert_eq!(handler.chain_pool().active(), 5);
    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 5);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn consume_counts_against_the_main_quota() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config().with_max_consumers(1)).await;

    handler.consume(acking).await.unwrap();
    assert!(handler.process(acking).await.unwrap_err().is_quota_exceeded());
    handler.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consume_delivers_in_publish_order_one_at_a_time() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        handler
            .consume(move |payload: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                let message: Value = serde_json::from_slice(&payload).unwrap();
                seen.lock().unwrap().push(message["code"].as_i64().unwrap());

                // finish from another task after a delay
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    finish.done();
                });
            })
            .await
            .unwrap();
    }

    for code in 0..10 {
        handler.publish(&json!({ "code": code })).await.unwrap();
    }

    wait_until("ten ordered deliveries", Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 10
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    handler.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consume_without_acks_still_waits_for_finish() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config().with_no_ack(true)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&seen);
        let in_flight = Arc::clone(&in_flight);
        let max_in_flight = Arc::clone(&max_in_flight);
        handler
            .consume(move |payload: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                let message: Value = serde_json::from_slice(&payload).unwrap();
                seen.lock().unwrap().push(message["code"].as_i64().unwrap());

                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    finish.done();
                });
            })
            .await
            .unwrap();
    }

    for code in 0..10 {
        handler.publish(&json!({ "code": code })).await.unwrap();
    }

    wait_until("ten deliveries without acks", Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 10
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count(), 0);
    handler.destroy().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_thousand_messages_are_delivered_exactly_once() {
    const BATCHES: usize = 5_000;
    const BATCH_SIZE: usize = 10;

    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    let pending: Arc<Mutex<HashSet<usize>>> =
        Arc::new(Mutex::new((0..BATCHES * BATCH_SIZE).collect()));
    let duplicates = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let pending = Arc::clone(&pending);
        let duplicates = Arc::clone(&duplicates);
        handler
            .process(move |payload: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                let message: Value = serde_json::from_slice(&payload).unwrap();
                let index = message["index"].as_u64().unwrap() as usize;
                if !pending.lock().unwrap().remove(&index) {
                    duplicates.fetch_add(1, Ordering::SeqCst);
                }
                finish.done();
            })
            .await
            .unwrap();
    }

    let publisher = &handler;
    for batch in 0..BATCHES {
        let publishes = (0..BATCH_SIZE).map(|offset| {
            let index = batch * BATCH_SIZE + offset;
            let message = json!({ "batch": batch, "index": index });
            async move { publisher.publish(&message).await }
        });
        for result in join_all(publishes).await {
            result.unwrap();
        }
    }

    wait_until("every message to be handled", Duration::from_secs(60), || {
        pending.lock().unwrap().is_empty()
    })
    .await;
    wait_until("every ack to land", Duration::from_secs(10), || {
        broker.unacked_count() == 0
    })
    .await;
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(handler.check_chain().await.unwrap().message_count, 0);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn large_messages_pass_unchanged() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    let large: Value = (0..1000)
        .map(|i| (format!("field_{i}"), json!(format!("value number {i}"))))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let received = Arc::new(Mutex::new(None));
    {
        let received = Arc::clone(&received);
        handler
            .consume(move |payload: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                *received.lock().unwrap() = Some(serde_json::from_slice::<Value>(&payload).unwrap());
                finish.done();
            })
            .await
            .unwrap();
    }
    handler.publish(&large).await.unwrap();

    wait_until("the large message", Duration::from_secs(5), || {
        received.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(received.lock().unwrap().take(), Some(large));
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn purge_is_idempotent() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    for code in 0..5 {
        handler.publish(&json!({ "code": code })).await.unwrap();
    }
    assert_eq!(handler.check_chain().await.unwrap().message_count, 5);

    assert_eq!(handler.purge_chain().await.unwrap(), 5);
    assert_eq!(handler.check_chain().await.unwrap().message_count, 0);
    assert_eq!(handler.purge_chain().await.unwrap(), 0);
    assert_eq!(handler.check_chain().await.unwrap().message_count, 0);
    assert_eq!(handler.purge_trash().await.unwrap(), 0);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn consumer_count_tracks_live_registrations() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    let mut tags = Vec::new();
    for _ in 0..3 {
        tags.push(handler.process(acking).await.unwrap().consumer_tag);
    }
    assert!(handler.cancel(&tags[1]).await.unwrap());

    let status = handler.check_chain().await.unwrap();
    assert_eq!(status.consumer_count, 2);
    assert_eq!(status.consumer_count as usize, handler.chain_pool().active());

    handler.destroy().await.unwrap();
    assert_eq!(handler.chain_pool().active(), 0);

    handler.prepare().await.unwrap();
    assert_eq!(handler.check_chain().await.unwrap().consumer_count, 0);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn cc_copies_the_message_to_another_queue() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;
    bind_extra_queue(&broker, "tdd-backup", "tdd-backup").await;

    handler
        .enqueue(
            &json!({ "code": 42 }),
            EnqueueOptions::cc("tdd-backup"),
            EnqueueOverrides::default(),
        )
        .unwrap();

    wait_until("the CC copy", Duration::from_secs(5), || {
        broker.queue_status("tdd-backup").map(|s| s.message_count) == Some(1)
    })
    .await;
    assert_eq!(handler.check_chain().await.unwrap().message_count, 1);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn routing_key_override_redirects_one_message() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;
    bind_extra_queue(&broker, "tdd-other", "tdd-other-key").await;

    handler
        .enqueue(
            &json!({ "code": 1 }),
            EnqueueOptions::default(),
            EnqueueOverrides::routing_key("tdd-other-key"),
        )
        .unwrap();
    handler
        .enqueue(&json!({ "code": 2 }), EnqueueOptions::default(), EnqueueOverrides::default())
        .unwrap();

    wait_until("both messages", Duration::from_secs(5), || {
        broker.queue_status("tdd-other").map(|s| s.message_count) == Some(1)
            && broker.queue_status(QUEUE).map(|s| s.message_count) == Some(1)
    })
    .await;
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let broker = MemoryBroker::new();

    let never_prepared = RabbitmqHandler::new(config(), Arc::new(broker.clone())).unwrap();
    never_prepared.destroy().await.unwrap();
    never_prepared.destroy().await.unwrap();

    let handler = prepared(&broker, config()).await;
    handler.process(acking).await.unwrap();
    handler.destroy().await.unwrap();
    handler.destroy().await.unwrap();
    assert_eq!(broker.open_channels(), 0);
    assert!(matches!(handler.publish(&"late").await, Err(BridgeError::NotPrepared)));
}

#[tokio::test]
async fn destroy_returns_unacknowledged_messages() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;

    // never finishes, keeping every delivery unacknowledged
    let held = Arc::new(Mutex::new(Vec::new()));
    {
        let held = Arc::clone(&held);
        handler
            .process(move |_: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                held.lock().unwrap().push(finish);
            })
            .await
            .unwrap();
    }
    for code in 0..3 {
        handler.publish(&json!({ "code": code })).await.unwrap();
    }
    wait_until("three deliveries", Duration::from_secs(5), || broker.unacked_count() == 3).await;

    handler.destroy().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_status(QUEUE).unwrap().message_count, 3);

    let redelivered = Arc::new(Mutex::new(Vec::new()));
    let successor = prepared(&broker, config()).await;
    {
        let redelivered = Arc::clone(&redelivered);
        successor
            .consume(move |payload: Vec<u8>, info: DeliveryInfo, finish: Finish| {
                let message: Value = serde_json::from_slice(&payload).unwrap();
                redelivered
                    .lock()
                    .unwrap()
                    .push((message["code"].as_i64().unwrap(), info.redelivered));
                finish.done();
            })
            .await
            .unwrap();
    }
    wait_until("redelivery", Duration::from_secs(5), || {
        redelivered.lock().unwrap().len() == 3
    })
    .await;
    assert_eq!(
        *redelivered.lock().unwrap(),
        vec![(0, true), (1, true), (2, true)]
    );
    successor.destroy().await.unwrap();
}

#[tokio::test]
async fn lost_connection_surfaces_as_connection_error() {
    let broker = MemoryBroker::new();
    let handler = prepared(&broker, config()).await;
    let lost = Arc::new(AtomicUsize::new(0));
    {
        let lost = Arc::clone(&lost);
        handler.on_connection_lost(Arc::new(move |err: &BridgeError| {
            assert!(err.is_fatal());
            lost.fetch_add(1, Ordering::SeqCst);
        }));
    }

    broker.disconnect();
    assert_eq!(lost.load(Ordering::SeqCst), 1);
    assert!(matches!(handler.publish(&"x").await, Err(BridgeError::Connection(_))));
    assert!(matches!(handler.check_chain().await, Err(BridgeError::Connection(_))));
    assert!(matches!(handler.process(acking).await, Err(BridgeError::Connection(_))));
    assert_eq!(handler.chain_pool().active(), 0);

    handler.prepare().await.unwrap();
    handler.publish(&"after reconnect").await.unwrap();
    assert_eq!(handler.check_chain().await.unwrap().message_count, 1);
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn unreachable_broker_fails_prepare() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let handler = RabbitmqHandler::new(config(), Arc::new(broker.clone())).unwrap();
    let err = handler.prepare().await.unwrap_err();
    assert!(matches!(err, BridgeError::Connection(_)));
    assert!(err.is_fatal());
    handler.destroy().await.unwrap();
}

#[tokio::test]
async fn conflicting_topology_fails_prepare() {
    let broker = MemoryBroker::new();
    let channel = broker
        .connect("memory://tdd", Arc::new(|_: BrokerError| {}))
        .await
        .unwrap();
    channel
        .declare_exchange(EXCHANGE, ExchangeType::Fanout, true)
        .await
        .unwrap();

    let handler = RabbitmqHandler::new(config(), Arc::new(broker.clone())).unwrap();
    assert!(matches!(handler.prepare().await, Err(BridgeError::Topology(_))));
    // the refused channel is gone; a retry reconnects and hits the same conflict
    assert!(matches!(handler.prepare().await, Err(BridgeError::Topology(_))));
    assert!(!handler.is_prepared());
    handler.destroy().await.unwrap();
    assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn failed_messages_cycle_through_the_recycler() {
    let broker = MemoryBroker::new();
    let config = config().with_recycler(RecyclerConfig::new(TRASH).with_redelivered_limit(1));
    let handler = prepared(&broker, config).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = Arc::clone(&attempts);
        handler
            .process(move |_: Vec<u8>, _: DeliveryInfo, finish: Finish| {
                attempts.fetch_add(1, Ordering::SeqCst);
                finish.fail("downstream unavailable");
            })
            .await
            .unwrap();
    }
    let trashed = Arc::new(Mutex::new(Vec::new()));
    {
        let trashed = Arc::clone(&trashed);
        handler
            .recycle(move |payload: Vec<u8>, info: DeliveryInfo, finish: Finish| {
                let count = info.redelivered_count("x-redelivered-count");
                trashed.lock().unwrap().push((payload, count));
                finish.done();
            })
            .await
            .unwrap();
    }

    handler.publish(&json!({ "code": 9 })).await.unwrap();

    wait_until("the trash delivery", Duration::from_secs(5), || {
        !trashed.lock().unwrap().is_empty()
    })
    .await;
    let (payload, count) = trashed.lock().unwrap()[0].clone();
    assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap(), json!({ "code": 9 }));
    assert_eq!(count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    handler.destroy().await.unwrap();
}
