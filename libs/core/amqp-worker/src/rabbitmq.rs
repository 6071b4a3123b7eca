//! RabbitMQ transport backed by lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties};

use crate::endpoint::{AmqpScheme, ConnectionEndpoint};
use crate::error::TransportError;
use crate::message::RawMessage;
use crate::session::{DisconnectSignal, LossSource};
use crate::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, IncomingDelivery, Subscription,
};

/// Header consulted when the `message_id` property is absent
pub const MESSAGE_ID_HEADER: &str = "x-message-id";

/// Opens lapin connections
#[derive(Clone, Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the RabbitMQ management UI
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        let name: String = name.into();
        self.properties = self.properties.with_connection_name(name.into());
        self
    }
}

fn to_uri(endpoint: &ConnectionEndpoint) -> AMQPUri {
    let heartbeat = u16::try_from(endpoint.heartbeat.as_secs()).unwrap_or(u16::MAX);

    AMQPUri {
        scheme: match endpoint.scheme {
            AmqpScheme::Amqp => AMQPScheme::AMQP,
            AmqpScheme::Amqps => AMQPScheme::AMQPS,
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(heartbeat),
            ..Default::default()
        },
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        endpoint: &ConnectionEndpoint,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect_uri(to_uri(endpoint), self.properties.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        Ok(Box::new(LapinChannel { channel }))
    }

    fn on_disconnect(&self, signal: DisconnectSignal) {
        self.connection.on_error(move |err| {
            signal.notify(LossSource::Connection, err.to_string());
        });
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))
    }

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Topology(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..Default::default()
        };

        let consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let deliveries = consumer
            .map(|next| {
                next.map(into_incoming)
                    .map_err(|e| TransportError::Channel(e.to_string()))
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn on_disconnect(&self, signal: DisconnectSignal) {
        self.channel.on_error(move |err| {
            signal.notify(LossSource::Channel, err.to_string());
        });
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }
}

fn into_incoming(delivery: Delivery) -> IncomingDelivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .or_else(|| header_message_id(delivery.properties.headers()));

    let message = RawMessage {
        body: delivery.data,
        message_id,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    };

    IncomingDelivery {
        message,
        acker: Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

fn header_message_id(headers: &Option<FieldTable>) -> Option<String> {
    headers
        .as_ref()?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == MESSAGE_ID_HEADER)
        .and_then(|(_, value)| match value {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        })
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn nack(&self) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue: false,
        };

        self.acker
            .nack(options)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }
}
