//! Connection session
//!
//! A session bundles one connection, one channel and one subscription. It is
//! built as a unit by [`Session::establish`] and torn down as a unit; a half
//! built session never escapes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;
use crate::endpoint::ConnectionEndpoint;
use crate::error::TransportError;
use crate::transport::{BrokerChannel, BrokerConnection, Connector, DeliveryStream};

/// Which observer reported the loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossSource {
    Connection,
    Channel,
    Subscription,
}

impl LossSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossSource::Connection => "connection",
            LossSource::Channel => "channel",
            LossSource::Subscription => "subscription",
        }
    }
}

/// Emitted at most once per session when the broker link goes away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossEvent {
    pub epoch: u64,
    pub source: LossSource,
    pub reason: String,
}

struct SignalState {
    epoch: u64,
    fired: AtomicBool,
    detached: AtomicBool,
    tx: mpsc::UnboundedSender<LossEvent>,
}

/// One-shot loss latch shared by every observer of a session
///
/// Observers may fire from any thread, including the AMQP client's own
/// I/O threads. Only the first notification is forwarded, and nothing is
/// forwarded once the session has been detached for teardown.
#[derive(Clone)]
pub struct DisconnectSignal {
    inner: Arc<SignalState>,
}

impl DisconnectSignal {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<LossEvent>) -> Self {
        Self {
            inner: Arc::new(SignalState {
                epoch,
                fired: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Returns true if this call forwarded the loss
    pub fn notify(&self, source: LossSource, reason: impl Into<String>) -> bool {
        if self.inner.detached.load(Ordering::SeqCst) {
            return false;
        }
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        let event = LossEvent {
            epoch: self.inner.epoch,
            source,
            reason: reason.into(),
        };
        self.inner.tx.send(event).is_ok()
    }

    /// Stop forwarding; called before a session is deliberately closed
    pub fn detach(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DisconnectSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisconnectSignal")
            .field("epoch", &self.epoch())
            .field("fired", &self.has_fired())
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// A fully established broker session
pub struct Session {
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
    consumer_tag: Option<String>,
    signal: DisconnectSignal,
}

impl Session {
    /// Connect, open a channel, apply prefetch, assert the durable queue,
    /// register loss observers and subscribe, in that order
    ///
    /// Anything opened before a failing step is closed before the error is
    /// returned.
    pub async fn establish<C>(
        connector: &C,
        endpoint: &ConnectionEndpoint,
        config: &ConsumerConfig,
        signal: DisconnectSignal,
    ) -> Result<(Self, DeliveryStream), TransportError>
    where
        C: Connector + ?Sized,
    {
        let queue = config.queue_name.as_str();

        let connection = connector.connect(endpoint).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                discard(connection, None, queue).await;
                return Err(e);
            }
        };

        if let Err(e) = prepare_topology(channel.as_ref(), config).await {
            discard(connection, Some(channel), queue).await;
            return Err(e);
        }

        connection.on_disconnect(signal.clone());
        channel.on_disconnect(signal.clone());

        let subscription = match channel.consume(queue).await {
            Ok(subscription) => subscription,
            Err(e) => {
                signal.detach();
                discard(connection, Some(channel), queue).await;
                return Err(e);
            }
        };

        debug!(
            queue = %queue,
            epoch = signal.epoch(),
            consumer_tag = %subscription.consumer_tag,
            "Session established"
        );

        let session = Self {
            connection,
            channel,
            consumer_tag: Some(subscription.consumer_tag),
            signal,
        };

        Ok((session, subscription.deliveries))
    }

    pub fn epoch(&self) -> u64 {
        self.signal.epoch()
    }

    pub fn disconnect_signal(&self) -> &DisconnectSignal {
        &self.signal
    }

    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Cancel the subscription so no new deliveries arrive
    ///
    /// The channel stays open so in-flight messages can still be settled.
    /// A second call is a no-op.
    pub async fn cancel_subscription(&mut self) -> Result<(), TransportError> {
        match self.consumer_tag.take() {
            Some(tag) => self.channel.cancel(&tag).await,
            None => Ok(()),
        }
    }

    /// Detach loss observers, then close channel and connection
    ///
    /// Close failures are logged and swallowed; the link may already be gone.
    pub async fn teardown(self, queue: &str) {
        self.signal.detach();
        discard(self.connection, Some(self.channel), queue).await;
    }
}

async fn prepare_topology(
    channel: &dyn BrokerChannel,
    config: &ConsumerConfig,
) -> Result<(), TransportError> {
    if let Some(prefetch) = config.prefetch {
        channel.set_prefetch(prefetch).await?;
    }
    channel.declare_durable_queue(&config.queue_name).await
}

async fn discard(
    connection: Box<dyn BrokerConnection>,
    channel: Option<Box<dyn BrokerChannel>>,
    queue: &str,
) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            debug!(queue = %queue, error = %e, "Error closing channel");
        }
    }
    if let Err(e) = connection.close().await {
        warn!(queue = %queue, error = %e, "Error closing connection");
    }
}
