//! Broker transport seam
//!
//! The consumer talks to the broker only through these traits. `rabbitmq`
//! implements them on top of lapin; `testing` provides an in-memory broker.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::endpoint::ConnectionEndpoint;
use crate::error::TransportError;
use crate::message::RawMessage;
use crate::session::DisconnectSignal;

/// Stream of deliveries for one subscription; ends when the subscription does
pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery, TransportError>>;

/// A delivery together with the handle that settles it
pub struct IncomingDelivery {
    pub message: RawMessage,
    pub acker: Box<dyn Acknowledger>,
}

/// Settles one delivery on the channel it arrived on
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Negative acknowledgement without requeue
    async fn nack(&self) -> Result<(), TransportError>;
}

/// An active queue subscription
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Opens broker connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &ConnectionEndpoint,
    ) -> Result<Box<dyn BrokerConnection>, TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    /// Route unexpected connection errors and closes to `signal`
    fn on_disconnect(&self, signal: DisconnectSignal);

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Assert a durable queue, creating it if missing
    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Subscribe with manual acknowledgement and a broker-assigned tag
    async fn consume(&self, queue: &str) -> Result<Subscription, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Route unexpected channel errors and closes to `signal`
    fn on_disconnect(&self, signal: DisconnectSignal);

    async fn close(&self) -> Result<(), TransportError>;
}
