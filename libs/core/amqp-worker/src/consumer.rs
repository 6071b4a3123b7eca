//! Resilient consumer
//!
//! Lifecycle:
//!
//! ```text
//! Idle/Stopped --start--> Connecting --session up--> Running
//!                              ^                        |
//!                              +---- connection lost ---+
//! Running/Connecting --stop--> ShuttingDown --drained--> Stopped
//! ```
//!
//! Every `start()` bumps a generation counter. Backoff sleeps and session
//! installs check it, so a stop (or a stop followed by a new start) reliably
//! cancels connect work that belongs to an older run.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use strum::{Display, IntoStaticStr};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{JitterSource, ThreadRngJitter};
use crate::callback::ProcessingCallback;
use crate::config::ConsumerConfig;
use crate::endpoint::ConnectionEndpoint;
use crate::error::{ConsumerError, ConsumerResult, TransportError};
use crate::in_flight::{DrainOutcome, InFlightTracker};
use crate::metrics::ConsumerMetrics;
use crate::session::{DisconnectSignal, LossEvent, LossSource, Session};
use crate::transport::{Connector, DeliveryStream, IncomingDelivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    fn is_terminating(&self) -> bool {
        matches!(self, ConsumerState::ShuttingDown | ConsumerState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifecycle {
    state: ConsumerState,
    generation: u64,
}

/// A queue consumer that survives broker restarts
///
/// Cloning is cheap and every clone controls the same consumer, so one clone
/// can be moved into a signal handler while another keeps serving.
pub struct ResilientConsumer<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ResilientConsumer<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    endpoint: ConnectionEndpoint,
    config: ConsumerConfig,
    callback: Arc<dyn ProcessingCallback>,
    lifecycle: watch::Sender<Lifecycle>,
    session: Mutex<Option<Session>>,
    /// Epoch of the installed session, 0 when there is none
    active_epoch: AtomicU64,
    next_epoch: AtomicU64,
    in_flight: InFlightTracker,
    jitter: StdMutex<Box<dyn JitterSource>>,
    loss_tx: mpsc::UnboundedSender<LossEvent>,
    loss_rx: StdMutex<Option<mpsc::UnboundedReceiver<LossEvent>>>,
    metrics: ConsumerMetrics,
}

impl<C: Connector> ResilientConsumer<C> {
    pub fn new(
        connector: C,
        endpoint: ConnectionEndpoint,
        config: ConsumerConfig,
        callback: impl ProcessingCallback + 'static,
    ) -> ConsumerResult<Self> {
        Self::with_jitter(connector, endpoint, config, callback, ThreadRngJitter)
    }

    /// Like [`new`](Self::new) with an explicit jitter source
    pub fn with_jitter(
        connector: C,
        endpoint: ConnectionEndpoint,
        config: ConsumerConfig,
        callback: impl ProcessingCallback + 'static,
        jitter: impl JitterSource + 'static,
    ) -> ConsumerResult<Self> {
        config.validate()?;

        let (lifecycle, _) = watch::channel(Lifecycle {
            state: ConsumerState::Idle,
            generation: 0,
        });
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let metrics = ConsumerMetrics::new(config.queue_name.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                endpoint,
                config,
                callback: Arc::new(callback),
                lifecycle,
                session: Mutex::new(None),
                active_epoch: AtomicU64::new(0),
                next_epoch: AtomicU64::new(0),
                in_flight: InFlightTracker::new(),
                jitter: StdMutex::new(Box::new(jitter)),
                loss_tx,
                loss_rx: StdMutex::new(Some(loss_rx)),
                metrics,
            }),
        })
    }

    /// Connect and subscribe, retrying up to `max_retries` times
    ///
    /// Valid from `Idle` or `Stopped`. Calling it while already connecting or
    /// running logs a warning and returns `Ok(())`. Once running, connection
    /// losses are recovered in the background with unlimited retries.
    pub async fn start(&self) -> ConsumerResult<()> {
        let shared = &self.shared;
        let queue = shared.config.queue_name.as_str();

        let Some(generation) = shared.begin_start() else {
            let state = shared.state();
            if state == ConsumerState::ShuttingDown {
                warn!(queue = %queue, "Cannot start consumer while it is shutting down");
                return Err(ConsumerError::Cancelled);
            }
            warn!(queue = %queue, state = %state, "Consumer already started");
            return Ok(());
        };

        Shared::ensure_supervisor(shared);
        info!(queue = %queue, endpoint = %shared.endpoint, "Starting consumer");

        match shared.connect_with_retries(generation).await {
            Ok(()) => {
                info!(queue = %queue, "Consumer started successfully");
                Ok(())
            }
            Err(e) => {
                shared.abandon_start(generation);
                Err(e)
            }
        }
    }

    /// Stop consuming and wait for in-flight messages
    ///
    /// Cancels the subscription, waits up to the drain timeout for handlers
    /// to settle their messages, then closes the session. Idempotent.
    pub async fn stop(&self) {
        let shared = &self.shared;
        let queue = shared.config.queue_name.as_str();

        let mut previous = None;
        shared.transition(|l| match l.state {
            ConsumerState::Running | ConsumerState::Connecting => {
                previous = Some(l.state);
                l.state = ConsumerState::ShuttingDown;
                true
            }
            _ => false,
        });

        let Some(previous) = previous else {
            shared.stop_inactive().await;
            return;
        };

        info!(
            queue = %queue,
            from = %previous,
            in_flight = shared.in_flight.len(),
            "Stopping consumer"
        );

        {
            let mut slot = shared.session.lock().await;
            if let Some(session) = slot.as_mut() {
                match session.cancel_subscription().await {
                    Ok(()) => debug!(queue = %queue, "Consumer subscription cancelled"),
                    Err(e) => warn!(queue = %queue, error = %e, "Error cancelling consumer subscription"),
                }
            }
        }

        shared.drain().await;

        let session = shared.session.lock().await.take();
        shared.active_epoch.store(0, Ordering::SeqCst);
        if let Some(session) = session {
            session.teardown(queue).await;
        }

        shared.transition(|l| {
            l.state = ConsumerState::Stopped;
            true
        });
        info!(queue = %queue, "Consumer stopped");
    }

    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.config.queue_name
    }

    pub fn endpoint(&self) -> &ConnectionEndpoint {
        &self.shared.endpoint
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.len()
    }

    pub fn in_flight_ids(&self) -> Vec<String> {
        self.shared.in_flight.ids()
    }

    /// Tag of the live subscription, if any
    pub async fn consumer_tag(&self) -> Option<String> {
        let slot = self.shared.session.lock().await;
        slot.as_ref()
            .and_then(|session| session.consumer_tag())
            .map(str::to_string)
    }

    /// Resolve once the consumer reaches `target`
    pub async fn wait_for_state(&self, target: ConsumerState) {
        let mut rx = self.shared.lifecycle.subscribe();
        let _ = rx.wait_for(|l| l.state == target).await.map(|_| ());
    }
}

impl<C: Connector> Shared<C> {
    fn state(&self) -> ConsumerState {
        self.lifecycle.borrow().state
    }

    fn transition(&self, change: impl FnOnce(&mut Lifecycle) -> bool) -> bool {
        self.lifecycle.send_if_modified(change)
    }

    /// Move Idle/Stopped to Connecting under a fresh generation
    fn begin_start(&self) -> Option<u64> {
        let mut generation = None;
        self.transition(|l| match l.state {
            ConsumerState::Idle | ConsumerState::Stopped => {
                l.state = ConsumerState::Connecting;
                l.generation += 1;
                generation = Some(l.generation);
                true
            }
            _ => false,
        });
        generation
    }

    fn abandon_start(&self, generation: u64) {
        self.transition(|l| {
            if l.generation == generation && l.state == ConsumerState::Connecting {
                l.state = ConsumerState::Stopped;
                true
            } else {
                false
            }
        });
    }

    fn is_connecting(&self, generation: u64) -> bool {
        let current = *self.lifecycle.borrow();
        current.generation == generation && current.state == ConsumerState::Connecting
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let receiver = self
            .loss_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(rx) = receiver {
            tokio::spawn(supervise(Arc::downgrade(self), rx));
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let mut jitter = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
        self.config.backoff.next_delay(attempt, &mut **jitter)
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let mut jitter = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
        self.config.backoff.reconnect_delay(attempt, &mut **jitter)
    }

    /// Sleep for `delay`; false if shutdown or a newer start interrupted it
    async fn sleep_while_current(&self, generation: u64, delay: Duration) -> bool {
        let mut rx = self.lifecycle.subscribe();
        let interrupted = async move {
            let _ = rx
                .wait_for(|l| l.generation != generation || l.state.is_terminating())
                .await
                .map(|_| ());
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => self.is_connecting(generation),
            _ = interrupted => false,
        }
    }

    async fn establish(&self) -> Result<(Session, DeliveryStream), TransportError> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let signal = DisconnectSignal::new(epoch, self.loss_tx.clone());
        self.metrics.connect_attempt();
        Session::establish(&self.connector, &self.endpoint, &self.config, signal).await
    }

    async fn connect_with_retries(self: &Arc<Self>, generation: u64) -> ConsumerResult<()> {
        let queue = self.config.queue_name.as_str();
        let max_retries = self.config.backoff.max_retries;
        let mut attempt: u32 = 0;

        loop {
            if !self.is_connecting(generation) {
                return Err(ConsumerError::Cancelled);
            }

            info!(
                queue = %queue,
                attempt = attempt + 1,
                max_retries,
                "Attempting to connect to RabbitMQ"
            );

            match self.establish().await {
                Ok((session, deliveries)) => {
                    return self.install(generation, session, deliveries).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        error!(
                            queue = %queue,
                            attempts = attempt,
                            error = %e,
                            "Failed to connect consumer, retries exhausted"
                        );
                        return Err(ConsumerError::RetriesExhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = self.next_delay(attempt - 1);
                    warn!(
                        queue = %queue,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to connect consumer, retrying"
                    );

                    if !self.sleep_while_current(generation, delay).await {
                        return Err(ConsumerError::Cancelled);
                    }
                }
            }
        }
    }

    /// Publish a freshly established session if `generation` is still connecting
    ///
    /// The state check and the slot update happen under the session lock, so
    /// a concurrent `stop()` either sees the new session or makes us discard it.
    async fn install(
        self: &Arc<Self>,
        generation: u64,
        session: Session,
        deliveries: DeliveryStream,
    ) -> ConsumerResult<()> {
        let queue = self.config.queue_name.as_str();
        let mut slot = self.session.lock().await;

        let promoted = self.transition(|l| {
            if l.generation == generation && l.state == ConsumerState::Connecting {
                l.state = ConsumerState::Running;
                true
            } else {
                false
            }
        });

        if !promoted {
            drop(slot);
            debug!(queue = %queue, "Discarding session established during shutdown");
            session.teardown(queue).await;
            return Err(ConsumerError::Cancelled);
        }

        let epoch = session.epoch();
        let signal = session.disconnect_signal().clone();
        let replaced = slot.replace(session);
        self.active_epoch.store(epoch, Ordering::SeqCst);
        drop(slot);

        if let Some(replaced) = replaced {
            replaced.teardown(queue).await;
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(dispatch(weak, epoch, signal, deliveries));
        Ok(())
    }

    /// Handle one loss event from the supervisor
    async fn recover(self: &Arc<Self>, event: LossEvent) {
        let queue = self.config.queue_name.as_str();

        let (generation, lost) = {
            let mut slot = self.session.lock().await;
            if slot.as_ref().map(Session::epoch) != Some(event.epoch) {
                debug!(queue = %queue, epoch = event.epoch, "Ignoring loss of a replaced session");
                return;
            }

            let mut generation = None;
            self.transition(|l| {
                if l.state == ConsumerState::Running {
                    l.state = ConsumerState::Connecting;
                    generation = Some(l.generation);
                    true
                } else {
                    false
                }
            });

            let Some(generation) = generation else {
                debug!(queue = %queue, state = %self.state(), "Ignoring connection loss while not running");
                return;
            };

            self.active_epoch.store(0, Ordering::SeqCst);
            (generation, slot.take())
        };

        warn!(
            queue = %queue,
            source = event.source.as_str(),
            reason = %event.reason,
            "RabbitMQ connection lost, reconnecting"
        );
        self.metrics.connection_lost(event.source.as_str());

        if let Some(lost) = lost {
            lost.teardown(queue).await;
        }

        let mut attempt: u32 = 0;
        loop {
            let delay = self.reconnect_delay(attempt);
            debug!(
                queue = %queue,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            if !self.sleep_while_current(generation, delay).await {
                info!(queue = %queue, "Reconnect abandoned, consumer is shutting down");
                return;
            }

            info!(queue = %queue, attempt = attempt + 1, "Attempting to reconnect consumer");

            match self.establish().await {
                Ok((session, deliveries)) => {
                    if self.install(generation, session, deliveries).await.is_ok() {
                        self.metrics.reconnected();
                        info!(queue = %queue, attempts = attempt + 1, "Consumer reconnected successfully");
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        queue = %queue,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to reconnect consumer"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn handle_delivery(self: Arc<Self>, epoch: u64, delivery: IncomingDelivery) {
        let queue = self.config.queue_name.as_str();
        let IncomingDelivery { message, acker } = delivery;

        // Tracked before the state check so a concurrent drain either sees
        // this message or sees the consumer already terminating here.
        let message_id = message.identifier();
        let guard = self.in_flight.track(message_id.as_str());

        if self.state().is_terminating() {
            drop(guard);
            debug!(
                queue = %queue,
                delivery_tag = message.delivery_tag,
                "Consumer is shutting down, skipping message"
            );
            self.metrics.message_skipped();
            return;
        }

        self.metrics.message_received();
        self.metrics.in_flight(self.in_flight.len());

        debug!(
            queue = %queue,
            message_id = %message_id,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "Processing message"
        );

        let started = Instant::now();
        let result = self.callback.process(&message).await;

        if let Err(e) = &result {
            error!(
                queue = %queue,
                message_id = %message_id,
                callback = self.callback.name(),
                error = %e,
                "Error processing message"
            );
        }

        if self.active_epoch.load(Ordering::SeqCst) != epoch {
            warn!(
                queue = %queue,
                message_id = %message_id,
                "Session closed before message was settled, leaving it to broker redelivery"
            );
        } else if result.is_ok() {
            match acker.ack().await {
                Ok(()) => {
                    self.metrics.message_acked(started.elapsed());
                    debug!(queue = %queue, message_id = %message_id, "Message acknowledged");
                }
                Err(e) => {
                    self.metrics.settle_failed();
                    warn!(queue = %queue, message_id = %message_id, error = %e, "Failed to acknowledge message");
                }
            }
        } else {
            match acker.nack().await {
                Ok(()) => self.metrics.message_nacked(),
                Err(e) => {
                    self.metrics.settle_failed();
                    warn!(queue = %queue, message_id = %message_id, error = %e, "Failed to reject message");
                }
            }
        }

        drop(guard);
        self.metrics.in_flight(self.in_flight.len());
    }

    async fn drain(&self) {
        let queue = self.config.queue_name.as_str();
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(queue = %queue, in_flight = pending, "Waiting for in-flight messages to complete");
        }

        match self
            .in_flight
            .wait_for_drain(self.config.drain_timeout, self.config.drain_poll_interval)
            .await
        {
            DrainOutcome::Drained => debug!(queue = %queue, "In-flight messages drained"),
            DrainOutcome::TimedOut { remaining } => warn!(
                queue = %queue,
                remaining,
                ids = ?self.in_flight.ids(),
                "Timed out waiting for in-flight messages, abandoning them"
            ),
        }
    }

    /// `stop()` when there is nothing running to cancel
    async fn stop_inactive(&self) {
        let queue = self.config.queue_name.as_str();

        match self.state() {
            ConsumerState::ShuttingDown => {
                debug!(queue = %queue, "Shutdown already in progress, waiting for it");
                let mut rx = self.lifecycle.subscribe();
                let _ = rx
                    .wait_for(|l| l.state != ConsumerState::ShuttingDown)
                    .await
                    .map(|_| ());
            }
            _ if self.in_flight.is_empty() => {
                debug!(queue = %queue, "Consumer is not running, nothing to stop");
            }
            _ => self.drain().await,
        }
    }
}

/// Serially apply loss events for as long as the consumer exists
async fn supervise<C: Connector>(
    shared: Weak<Shared<C>>,
    mut events: mpsc::UnboundedReceiver<LossEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.recover(event).await;
    }
}

/// Hand deliveries of one session to concurrent handlers
async fn dispatch<C: Connector>(
    shared: Weak<Shared<C>>,
    epoch: u64,
    signal: DisconnectSignal,
    mut deliveries: DeliveryStream,
) {
    while let Some(next) = deliveries.next().await {
        let Some(consumer) = shared.upgrade() else {
            return;
        };

        match next {
            Ok(delivery) => {
                tokio::spawn(consumer.handle_delivery(epoch, delivery));
            }
            Err(e) => {
                warn!(
                    queue = %consumer.config.queue_name,
                    epoch,
                    error = %e,
                    "Delivery stream failed"
                );
                signal.notify(LossSource::Subscription, e.to_string());
                return;
            }
        }
    }

    let Some(consumer) = shared.upgrade() else {
        return;
    };
    if consumer.state() == ConsumerState::Running
        && consumer.active_epoch.load(Ordering::SeqCst) == epoch
    {
        signal.notify(LossSource::Subscription, "delivery stream ended");
    }
    debug!(queue = %consumer.config.queue_name, epoch, "Delivery stream closed");
}
