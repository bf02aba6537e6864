//! AMQP 0-9-1 transport over `lapin`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldArray, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use super::{
    Acker, BrokerChannel, ConsumeOptions, Connector, Delivery, DeliveryStream, FailureHook,
};
use crate::error::BrokerError;
use crate::types::{ExchangeType, HeaderValue, Headers, QueueStatus};

/// Check that `uri` is a well-formed AMQP URI without connecting.
pub fn validate_uri(uri: &str) -> Result<(), BrokerError> {
    AMQPUri::from_str(uri)
        .map(|_| ())
        .map_err(|e| BrokerError::new(format!("invalid AMQP uri: {e}")))
}

/// Opens `lapin` connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    #[instrument(skip(self, uri, on_failure))]
    async fn connect(
        &self,
        uri: &str,
        on_failure: FailureHook,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        validate_uri(uri)?;
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        connection.on_error(move |err| {
            error!(error = %err, "AMQP connection failed");
            on_failure(BrokerError::from(err));
        });
        let channel = connection.create_channel().await?;

        info!(channel = channel.id(), "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            consume_lock: Mutex::new(()),
        }))
    }
}

/// A `lapin` channel together with the connection that owns it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    /// `basic.qos` applies to the next `basic.consume` on the channel, so the
    /// pair must not interleave with another registration
    consume_lock: Mutex<()>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<QueueStatus, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(QueueStatus {
            queue: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(to_field_table(&headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;

        if confirm.is_nack() {
            return Err(BrokerError::new("publisher confirm NACK"));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let _guard = self.consume_lock.lock().await;
        self.channel
            .basic_qos(options.prefetch, BasicQosOptions { global: false })
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch = options.prefetch, "basic.consume ok");

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueStatus, BrokerError> {
        let status = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(QueueStatus {
            queue: status.name().to_string(),
            message_count: status.message_count(),
            consumer_count: status.consumer_count(),
        })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let purged = self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(purged)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(200, "bridge destroyed").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "bridge destroyed").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers,
        payload: delivery.data,
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        let value = match value {
            HeaderValue::Int(int) => AMQPValue::LongLongInt(*int),
            HeaderValue::Text(text) => AMQPValue::LongString(text.clone().into()),
            HeaderValue::List(items) => AMQPValue::FieldArray(FieldArray::from(
                items
                    .iter()
                    .map(|item| AMQPValue::LongString(item.clone().into()))
                    .collect::<Vec<_>>(),
            )),
        };
        table.insert(name.clone().into(), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| header_value(value).map(|v| (name.to_string(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::ShortString(_) | AMQPValue::LongString(_) => text_value(value).map(HeaderValue::Text),
        AMQPValue::FieldArray(items) => Some(HeaderValue::List(
            items.as_slice().iter().filter_map(text_value).collect(),
        )),
        _ => None,
    }
}

fn text_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(text) => Some(text.to_string()),
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        _ => None,
    }
}
