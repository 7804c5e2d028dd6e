//! AMQP 0-9-1 backend built on lapin

use crate::messaging::config::BrokerConfig;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::message::{Delivery, OutboundMessage, ATTEMPT_HEADER};
use crate::messaging::traits::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::Arc;

const REPLY_SUCCESS: u16 = 200;

/// Opens AMQP connections from broker configuration
pub struct AmqpConnector {
    url: String,
    connection_name: String,
    prefetch_count: u16,
    publisher_confirms: bool,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> MessagingResult<Self> {
        let url = config
            .url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| MessagingError::ConfigurationError("broker.url is not set".to_string()))?;

        Ok(Self {
            url,
            connection_name: config.connection_name.clone(),
            prefetch_count: config.prefetch_count,
            publisher_confirms: config.publisher_confirms,
        })
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> MessagingResult<Box<dyn BrokerConnection>> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("AMQP connection failed: {}", e)))?;

        Ok(Box::new(AmqpConnection {
            connection,
            prefetch_count: self.prefetch_count,
            publisher_confirms: self.publisher_confirms,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    prefetch_count: u16,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::Channel(format!("AMQP channel open failed: {}", e)))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Channel(format!("AMQP basic.qos failed: {}", e)))?;

        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| MessagingError::Channel(format!("AMQP confirm.select failed: {}", e)))?;
        }

        Ok(Arc::new(AmqpChannel {
            channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.connection
            .close(REPLY_SUCCESS, "dispatcher shutdown")
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("AMQP connection close failed: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> MessagingResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Topology(format!("exchange {}: {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Topology(format!("queue {}: {}", name, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> MessagingResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::Topology(format!(
                    "binding {} -> {} ({}): {}",
                    exchange, queue, routing_key, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> MessagingResult<bool> {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(ATTEMPT_HEADER), AMQPValue::LongUInt(message.attempt));

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.message_id))
            .with_timestamp(message.timestamp.timestamp().max(0) as u64)
            .with_kind(ShortString::from(message.event_type))
            .with_content_type(ShortString::from(message.content_type))
            .with_delivery_mode(if message.persistent { 2 } else { 1 })
            .with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("AMQP publish failed: {}", e)))?;

        if !self.publisher_confirms {
            return Ok(true);
        }

        let confirmation = confirm
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("AMQP publisher confirm failed: {}", e)))?;
        Ok(confirmation.is_ack())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<Box<dyn DeliveryStream>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("queue {}: {}", queue, e)))?;

        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> MessagingResult<()> {
        self.channel
            .close(REPLY_SUCCESS, "dispatcher shutdown")
            .await
            .map_err(|e| MessagingError::Channel(format!("AMQP channel close failed: {}", e)))
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<MessagingResult<Delivery>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(convert_delivery)
                .map_err(|e| MessagingError::Channel(format!("AMQP consumer error: {}", e))),
        )
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let attempt = properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == ATTEMPT_HEADER)
                .and_then(|(_, value)| attempt_from_header(value))
        })
        .unwrap_or(1);

    let mut converted = Delivery::new(
        delivery.data.clone(),
        delivery.delivery_tag,
        Box::new(AmqpAcker {
            acker: delivery.acker.clone(),
        }),
    );
    converted.message_id = properties.message_id().as_ref().map(|id| id.as_str().to_string());
    converted.timestamp = properties
        .timestamp()
        .as_ref()
        .copied()
        .and_then(|ts| i64::try_from(ts).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
    converted.event_type = properties.kind().as_ref().map(|kind| kind.as_str().to_string());
    converted.redelivered = delivery.redelivered;
    converted.attempt = attempt;
    converted
}

fn attempt_from_header(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::AckFailed(format!("AMQP ack failed: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::AckFailed(format!("AMQP nack failed: {}", e)))
    }
}
