//! Publisher: serializes outbound messages and writes them through a single
//! ordered worker per handler.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::channel::classify;
use crate::error::{BridgeError, BridgeResult};
use crate::observer::{BridgeEvent, Observer};
use crate::transport::{BrokerChannel, CC_HEADER};
use crate::types::{HeaderValue, Headers};

/// Per-call publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Extra routing keys that receive a copy of the message
    pub cc: Vec<String>,
}

impl EnqueueOptions {
    pub fn cc(routing_key: &str) -> Self {
        Self {
            cc: vec![routing_key.to_string()],
        }
    }

    pub fn with_cc(mut self, routing_key: &str) -> Self {
        self.cc.push(routing_key.to_string());
        self
    }
}

/// Per-call replacements for handler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOverrides {
    /// Used instead of the handler's routing key for this call only
    pub routing_key: Option<String>,
}

impl EnqueueOverrides {
    pub fn routing_key(routing_key: &str) -> Self {
        Self {
            routing_key: Some(routing_key.to_string()),
        }
    }
}

struct Outbound {
    routing_key: String,
    payload: Vec<u8>,
    headers: Headers,
    reply: Option<oneshot::Sender<BridgeResult<()>>>,
}

enum Command {
    Publish(Outbound),
    /// Answered once everything queued before it has been written
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the publish worker of one prepared handler.
#[derive(Clone)]
pub struct Publisher {
    routing_key: String,
    sender: mpsc::UnboundedSender<Command>,
}

impl Publisher {
    /// Spawn the worker loop writing to `exchange` through `channel`.
    pub(crate) fn start(
        channel: Arc<dyn BrokerChannel>,
        exchange: &str,
        routing_key: &str,
        observer: Arc<dyn Observer>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            channel,
            exchange.to_string(),
            receiver,
            observer,
        ));
        (
            Self {
                routing_key: routing_key.to_string(),
                sender,
            },
            worker,
        )
    }

    /// Publish with the default routing key and wait for the broker.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> BridgeResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.send(self.routing_key.clone(), payload, Headers::new())
            .await
    }

    /// Queue a message without waiting for the broker.
    ///
    /// Encoding problems are returned here; broker failures are reported to
    /// the observer by the worker.
    pub fn enqueue<T: Serialize + ?Sized>(
        &self,
        message: &T,
        options: &EnqueueOptions,
        overrides: &EnqueueOverrides,
    ) -> BridgeResult<()> {
        let payload = serde_json::to_vec(message)?;
        let routing_key = overrides
            .routing_key
            .clone()
            .unwrap_or_else(|| self.routing_key.clone());
        let mut headers = Headers::new();
        if !options.cc.is_empty() {
            headers.insert(CC_HEADER.to_string(), HeaderValue::List(options.cc.clone()));
        }
        self.submit(Command::Publish(Outbound {
            routing_key,
            payload,
            headers,
            reply: None,
        }))
    }

    /// Publish already encoded bytes and wait for the broker.
    pub(crate) async fn send(
        &self,
        routing_key: String,
        payload: Vec<u8>,
        headers: Headers,
    ) -> BridgeResult<()> {
        let (reply, result) = oneshot::channel();
        self.submit(Command::Publish(Outbound {
            routing_key,
            payload,
            headers,
            reply: Some(reply),
        }))?;
        result
            .await
            .map_err(|_| BridgeError::Publish("publisher stopped before replying".into()))?
    }

    /// Wait until every message queued so far has been written.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.submit(Command::Flush(done)).is_ok() {
            let _ = flushed.await;
        }
    }

    pub fn default_routing_key(&self) -> &str {
        &self.routing_key
    }

    fn submit(&self, command: Command) -> BridgeResult<()> {
        self.sender.send(command).map_err(|_| BridgeError::NotPrepared)
    }
}

async fn run_worker(
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    observer: Arc<dyn Observer>,
) {
    while let Some(command) = receiver.recv().await {
        let outbound = match command {
            Command::Publish(outbound) => outbound,
            Command::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let result = channel
            .publish(
                &exchange,
                &outbound.routing_key,
                outbound.payload,
                outbound.headers,
            )
            .await
            .map_err(|e| classify(channel.as_ref(), e, BridgeError::Publish));

        match &result {
            Ok(()) => observer.observe(BridgeEvent::Published {
                routing_key: outbound.routing_key.clone(),
            }),
            Err(e) => observer.observe(BridgeEvent::PublishFailed {
                routing_key: outbound.routing_key.clone(),
                reason: e.to_string(),
            }),
        }
        if let Some(reply) = outbound.reply {
            let _ = reply.send(result);
        }
    }
    debug!(exchange = %exchange, "Publish worker stopped");
}
