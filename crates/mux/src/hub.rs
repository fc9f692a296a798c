use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::rendezvous::call;
use crate::rendezvous::AwaitDone;
use crate::rendezvous::Rendezvous;
use crate::sink::BoxSink;
use crate::sink::Sink;
use crate::sink::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("timed out submitting value after {0:?}")]
    Timeout(Duration),
    #[error("mux is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long `submit` waits for room in the hub's queue.
    pub submit_timeout: Duration,
    /// How long the hub waits for one sink to accept one value before
    /// skipping that sink for that value.
    pub delivery_timeout: Duration,
    /// Capacity of the hub's command queue.
    pub buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(1),
            buffer: 16,
        }
    }
}

type SubscriberId = u64;

enum Command<T> {
    Publish(T),
    Subscribe(Rendezvous<BoxSink<T>, SubscriberId>),
    Unsubscribe(AwaitDone<SubscriberId>),
    Close(AwaitDone<()>),
}

/// Fan-out hub owning a dynamic set of sinks.
///
/// The subscriber set lives inside a dedicated task; publishing, subscribing,
/// and unsubscribing are all messages to that task, so they are observed in
/// one total order.
pub struct Mux<T> {
    name: Arc<str>,
    commands: mpsc::Sender<Command<T>>,
    submit_timeout: Duration,
}

impl<T> Clone for Mux<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            commands: self.commands.clone(),
            submit_timeout: self.submit_timeout,
        }
    }
}

impl<T> fmt::Debug for Mux<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("name", &self.name)
            .field("submit_timeout", &self.submit_timeout)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Mux<T> {
    /// Creates the hub and spawns its owning task on the current runtime.
    pub fn new(name: impl Into<Arc<str>>, config: MuxConfig) -> Self {
        let name = name.into();
        let (commands, rx) = mpsc::channel(config.buffer.max(1));
        let hub = Hub {
            name: Arc::clone(&name),
            sinks: BTreeMap::new(),
            next_id: 0,
            delivery_timeout: config.delivery_timeout,
        };
        tokio::spawn(hub.run(rx));
        Self {
            name,
            commands,
            submit_timeout: config.submit_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `value` for delivery to every current subscriber.
    ///
    /// Waits at most the configured submit timeout for room in the queue. An
    /// accepted value is delivered to every reading subscriber; a rejected one
    /// is delivered to nobody. Subscribers that fail to take an accepted value
    /// are handled by the hub and do not affect the result.
    pub async fn submit(&self, value: T) -> Result<(), MuxError> {
        let limit = self.submit_timeout;
        match self
            .commands
            .send_timeout(Command::Publish(value), limit)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(MuxError::Closed),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(mux = %self.name, "timed out submitting value after {limit:?}");
                Err(MuxError::Timeout(limit))
            }
        }
    }

    /// Registers `sink`; returns once the hub has recorded the registration.
    ///
    /// Every value submitted after this returns is delivered to `sink`.
    pub async fn subscribe(&self, sink: impl Sink<T>) -> Result<Subscription, MuxError> {
        let sink: BoxSink<T> = Box::new(sink);
        let id = call(&self.commands, sink, Command::Subscribe)
            .await
            .map_err(|_| MuxError::Closed)?;
        debug!(mux = %self.name, subscriber = id, "subscribed");

        let commands = self.commands.clone();
        let name = Arc::clone(&self.name);
        let cancel = async move {
            if call(&commands, id, Command::Unsubscribe).await.is_ok() {
                debug!(mux = %name, subscriber = id, "unsubscribed");
            }
        };
        Ok(Subscription {
            cancel: cancel.boxed(),
        })
    }

    /// Stops the hub and closes every sink. Closing twice is a no-op.
    pub async fn close(&self) {
        let _ = call(&self.commands, (), Command::Close).await;
    }
}

/// Handle returned by [`Mux::subscribe`].
///
/// Dropping the handle leaves the sink subscribed; call
/// [`Subscription::cancel`] to remove it.
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    cancel: BoxFuture<'static, ()>,
}

impl Subscription {
    /// Unsubscribes; once this returns the sink has been dropped.
    pub async fn cancel(self) {
        self.cancel.await;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

/// Subscriptions cancelled together, in the order they were added.
#[derive(Debug, Default)]
pub struct Subscriptions(Vec<Subscription>);

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.0.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub async fn cancel_all(self) {
        for subscription in self.0 {
            subscription.cancel().await;
        }
    }
}

struct Hub<T> {
    name: Arc<str>,
    sinks: BTreeMap<SubscriberId, BoxSink<T>>,
    next_id: SubscriberId,
    delivery_timeout: Duration,
}

impl<T: Clone + Send + 'static> Hub<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command<T>>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Publish(value) => self.deliver(value).await,
                Command::Subscribe(request) => {
                    let (sink, reply) = request.into_parts();
                    let id = self.next_id;
                    self.next_id += 1;
                    self.sinks.insert(id, sink);
                    reply.send(id);
                }
                Command::Unsubscribe(request) => {
                    self.sinks.remove(request.value());
                    request.done();
                }
                Command::Close(request) => {
                    self.sinks.clear();
                    request.done();
                    break;
                }
            }
        }
        debug!(mux = %self.name, "mux stopped");
    }

    /// Offers `value` to every sink concurrently. A sink that misses the
    /// delivery timeout is skipped for this value; a closed sink is dropped.
    async fn deliver(&mut self, value: T) {
        let limit = self.delivery_timeout;
        let deliveries = self.sinks.iter_mut().map(|(id, sink)| {
            let value = value.clone();
            async move { (*id, timeout(limit, sink.submit(value)).await) }
        });

        let mut closed = Vec::new();
        for (id, result) in join_all(deliveries).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(SinkError::Closed)) => {
                    debug!(mux = %self.name, subscriber = id, "dropping closed subscriber");
                    closed.push(id);
                }
                Err(_) => {
                    warn!(
                        mux = %self.name,
                        subscriber = id,
                        "subscriber did not accept value within {limit:?}, skipping it"
                    );
                }
            }
        }
        for id in closed {
            self.sinks.remove(&id);
        }
    }
}
