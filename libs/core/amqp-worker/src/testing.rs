//! In-memory broker for consumer tests
//!
//! Implements the transport traits without a network. Failures can be
//! scripted per operation and link losses injected on demand, while every
//! connect, subscribe and settle is recorded for assertions.
//!
//! Closing a connection or channel fires its loss observers, as real AMQP
//! clients do, so tests also prove that teardown detaches them first.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::endpoint::ConnectionEndpoint;
use crate::error::TransportError;
use crate::message::RawMessage;
use crate::session::{DisconnectSignal, LossSource};
use crate::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, IncomingDelivery, Subscription,
};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledMessage {
    pub message_id: Option<String>,
    pub delivery_tag: u64,
    pub outcome: Settlement,
}

#[derive(Default)]
struct Link {
    open: bool,
    connection_observers: Vec<DisconnectSignal>,
    channel_open: bool,
    channel_observers: Vec<DisconnectSignal>,
}

struct ActiveSubscription {
    connection_id: u64,
    consumer_tag: String,
    next_delivery_tag: u64,
    tx: mpsc::UnboundedSender<Result<IncomingDelivery, TransportError>>,
}

#[derive(Default)]
struct BrokerState {
    fail_connects: u32,
    fail_declares: u32,
    fail_consumes: u32,
    fail_cancels: u32,
    fail_settles: u32,
    connect_times: Vec<Instant>,
    next_connection_id: u64,
    links: HashMap<u64, Link>,
    declared: Vec<String>,
    prefetch: Vec<u16>,
    consume_calls: u32,
    cancel_calls: u32,
    next_consumer_tag: u64,
    subscription: Option<ActiveSubscription>,
    backlog: VecDeque<RawMessage>,
    settled: Vec<SettledMessage>,
}

/// Shared handle to the in-memory broker; clones see the same state
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// Reject the next `n` queue declarations
    pub fn fail_next_declares(&self, n: u32) {
        self.lock().fail_declares = n;
    }

    pub fn fail_next_consumes(&self, n: u32) {
        self.lock().fail_consumes = n;
    }

    /// Fail the next `n` subscription cancels; the subscription stays live
    pub fn fail_next_cancels(&self, n: u32) {
        self.lock().fail_cancels = n;
    }

    /// Fail the next `n` acks or nacks while the channel stays open
    pub fn fail_next_settles(&self, n: u32) {
        self.lock().fail_settles = n;
    }

    /// Publish a message without a message id
    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.enqueue(RawMessage::new(body, 0));
    }

    pub fn publish_with_id(&self, body: impl Into<Vec<u8>>, message_id: impl Into<String>) {
        self.enqueue(RawMessage::new(body, 0).with_message_id(message_id));
    }

    fn enqueue(&self, message: RawMessage) {
        let mut state = self.lock();
        state.backlog.push_back(message);
        self.flush(&mut state);
    }

    fn flush(&self, state: &mut BrokerState) {
        while let Some(subscription) = state.subscription.as_mut() {
            let Some(mut message) = state.backlog.pop_front() else {
                return;
            };

            subscription.next_delivery_tag += 1;
            message.delivery_tag = subscription.next_delivery_tag;

            let delivery = IncomingDelivery {
                acker: Box::new(MemoryAcker {
                    broker: self.clone(),
                    connection_id: subscription.connection_id,
                    message_id: message.message_id.clone(),
                    delivery_tag: message.delivery_tag,
                }),
                message,
            };

            if subscription.tx.send(Ok(delivery)).is_err() {
                state.subscription = None;
            }
        }
    }

    /// Drop the broker link: fires connection and channel observers
    pub fn sever_connection(&self, reason: &str) {
        let Some(id) = self.latest_open_connection() else {
            return;
        };

        let signals = {
            let mut state = self.lock();
            end_subscription_on(&mut state, id);
            let link = state.links.entry(id).or_default();
            link.open = false;
            link.channel_open = false;
            let mut signals: Vec<(LossSource, DisconnectSignal)> = link
                .connection_observers
                .iter()
                .map(|s| (LossSource::Connection, s.clone()))
                .collect();
            signals.extend(
                link.channel_observers
                    .iter()
                    .map(|s| (LossSource::Channel, s.clone())),
            );
            signals
        };

        for (source, signal) in signals {
            signal.notify(source, reason);
        }
    }

    /// Close only the channel of the latest connection
    pub fn sever_channel(&self, reason: &str) {
        let Some(id) = self.latest_open_connection() else {
            return;
        };

        let signals = {
            let mut state = self.lock();
            end_subscription_on(&mut state, id);
            let link = state.links.entry(id).or_default();
            link.channel_open = false;
            link.channel_observers.clone()
        };

        for signal in signals {
            signal.notify(LossSource::Channel, reason);
        }
    }

    /// Broker-side consumer cancel: the delivery stream ends, links stay up
    pub fn cancel_subscription_remotely(&self) {
        self.lock().subscription = None;
    }

    fn latest_open_connection(&self) -> Option<u64> {
        self.lock()
            .links
            .iter()
            .filter(|(_, link)| link.open)
            .map(|(id, _)| *id)
            .max()
    }

    pub fn connects(&self) -> usize {
        self.lock().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().links.values().filter(|link| link.open).count()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    pub fn prefetch_values(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    pub fn consume_calls(&self) -> u32 {
        self.lock().consume_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        self.lock().cancel_calls
    }

    pub fn has_subscription(&self) -> bool {
        self.lock().subscription.is_some()
    }

    pub fn settled(&self) -> Vec<SettledMessage> {
        self.lock().settled.clone()
    }

    fn settled_with(&self, outcome: Settlement) -> Vec<SettledMessage> {
        self.lock()
            .settled
            .iter()
            .filter(|m| m.outcome == outcome)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<SettledMessage> {
        self.settled_with(Settlement::Ack)
    }

    pub fn nacked(&self) -> Vec<SettledMessage> {
        self.settled_with(Settlement::Nack)
    }

    fn settle(
        &self,
        connection_id: u64,
        message_id: Option<String>,
        delivery_tag: u64,
        outcome: Settlement,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let channel_open = state
            .links
            .get(&connection_id)
            .map(|link| link.channel_open)
            .unwrap_or(false);
        if !channel_open {
            return Err(TransportError::Closed);
        }

        if state.fail_settles > 0 {
            state.fail_settles -= 1;
            return Err(TransportError::Channel("settle refused".into()));
        }

        state.settled.push(SettledMessage {
            message_id,
            delivery_tag,
            outcome,
        });
        Ok(())
    }
}

fn end_subscription_on(state: &mut BrokerState, connection_id: u64) {
    if state
        .subscription
        .as_ref()
        .is_some_and(|s| s.connection_id == connection_id)
    {
        state.subscription = None;
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        _endpoint: &ConnectionEndpoint,
    ) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let mut state = self.lock();
        state.connect_times.push(Instant::now());

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.links.insert(
            id,
            Link {
                open: true,
                ..Default::default()
            },
        );

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.broker.lock();
        let link = state
            .links
            .get_mut(&self.id)
            .filter(|link| link.open)
            .ok_or_else(|| TransportError::Channel("connection is closed".into()))?;
        link.channel_open = true;

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
        }))
    }

    fn on_disconnect(&self, signal: DisconnectSignal) {
        if let Some(link) = self.broker.lock().links.get_mut(&self.id) {
            link.connection_observers.push(signal);
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let signals = {
            let mut state = self.broker.lock();
            end_subscription_on(&mut state, self.id);
            let Some(link) = state.links.get_mut(&self.id) else {
                return Err(TransportError::Closed);
            };
            if !link.open {
                return Err(TransportError::Closed);
            }
            link.open = false;
            link.channel_open = false;
            link.connection_observers.clone()
        };

        for signal in signals {
            signal.notify(LossSource::Connection, "connection closed");
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection_id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        match state.links.get(&self.connection_id) {
            Some(link) if link.channel_open => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;
        state.prefetch.push(count);
        Ok(())
    }

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;

        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            return Err(TransportError::Topology(format!(
                "PRECONDITION_FAILED - cannot declare queue '{queue}'"
            )));
        }

        state.declared.push(queue.to_string());
        Ok(())
    }

    async fn consume(&self, _queue: &str) -> Result<Subscription, TransportError> {
        let mut state = self.broker.lock();
        self.ensure_open(&state)?;

        if state.fail_consumes > 0 {
            state.fail_consumes -= 1;
            return Err(TransportError::Subscribe("consume refused".into()));
        }

        state.consume_calls += 1;
        state.next_consumer_tag += 1;
        let consumer_tag = format!("amq.ctag-{}", state.next_consumer_tag);

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscription = Some(ActiveSubscription {
            connection_id: self.connection_id,
            consumer_tag: consumer_tag.clone(),
            next_delivery_tag: 0,
            tx,
        });
        self.broker.flush(&mut state);

        Ok(Subscription {
            consumer_tag,
            deliveries: UnboundedReceiverStream::new(rx).boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.cancel_calls += 1;

        if state.fail_cancels > 0 {
            state.fail_cancels -= 1;
            return Err(TransportError::Channel("cancel refused".into()));
        }

        if state
            .subscription
            .as_ref()
            .is_some_and(|s| s.consumer_tag == consumer_tag)
        {
            state.subscription = None;
        }
        Ok(())
    }

    fn on_disconnect(&self, signal: DisconnectSignal) {
        if let Some(link) = self.broker.lock().links.get_mut(&self.connection_id) {
            link.channel_observers.push(signal);
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let signals = {
            let mut state = self.broker.lock();
            end_subscription_on(&mut state, self.connection_id);
            let Some(link) = state.links.get_mut(&self.connection_id) else {
                return Err(TransportError::Closed);
            };
            if !link.channel_open {
                return Err(TransportError::Closed);
            }
            link.channel_open = false;
            link.channel_observers.clone()
        };

        for signal in signals {
            signal.notify(LossSource::Channel, "channel closed");
        }
        Ok(())
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    connection_id: u64,
    message_id: Option<String>,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.broker.settle(
            self.connection_id,
            self.message_id.clone(),
            self.delivery_tag,
            Settlement::Ack,
        )
    }

    async fn nack(&self) -> Result<(), TransportError> {
        self.broker.settle(
            self.connection_id,
            self.message_id.clone(),
            self.delivery_tag,
            Settlement::Nack,
        )
    }
}
