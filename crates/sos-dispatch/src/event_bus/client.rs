use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use sos_protocol::Topic;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{Subscription, Transport};
use super::{BusError, MessageHandler};
use crate::config::BusSettings;

/// Handle to the message bus. Cheap to clone; clones share the connection
/// and the set of listener tasks.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    settings: BusSettings,
    connected: AtomicBool,
    listeners: Mutex<Listeners>,
}

struct Listeners {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BusClient {
    pub fn new(transport: Arc<dyn Transport>, settings: BusSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                connected: AtomicBool::new(false),
                listeners: Mutex::new(Listeners {
                    shutdown: CancellationToken::new(),
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Ping the transport and mark the client connected. Calling it on a
    /// healthy connection is a no-op.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.is_connected() {
            if self.inner.transport.ping().await.is_ok() {
                debug!("message bus already connected");
                return Ok(());
            }
            warn!("message bus connection lost, reconnecting");
        }

        if let Err(e) = self.inner.transport.ping().await {
            self.inner.connected.store(false, Ordering::Release);
            error!(error = %e, "failed to connect to message bus");
            return Err(e.into());
        }

        {
            let mut listeners = self.inner.listeners.lock().await;
            if listeners.shutdown.is_cancelled() {
                listeners.shutdown = CancellationToken::new();
            }
        }

        self.inner.connected.store(true, Ordering::Release);
        info!("connected to message bus");
        Ok(())
    }

    /// Serialize `payload` and publish it on `T`'s topic. Fire-and-forget:
    /// success means the transport accepted it, not that anyone consumed it.
    pub async fn publish<T: Topic>(&self, payload: &T::Payload) -> Result<(), BusError> {
        self.publish_raw(T::NAME, payload).await
    }

    /// Publish on a topic outside the typed set.
    pub async fn publish_raw<P>(&self, topic: &str, payload: &P) -> Result<(), BusError>
    where
        P: Serialize + ?Sized,
    {
        if !self.is_connected() {
            error!(topic, "cannot publish, message bus not connected");
            return Err(BusError::Unavailable);
        }

        let json = serde_json::to_string(payload).map_err(|e| {
            error!(topic, error = %e, "failed to serialize bus payload");
            BusError::Serialization(e)
        })?;

        debug!(topic, payload = %json, "publishing message");
        self.inner
            .transport
            .publish(topic, json)
            .await
            .map_err(|e| {
                error!(topic, error = %e, "failed to publish message");
                BusError::Transport(e)
            })
    }

    /// Start a listener that feeds every decoded `T` payload to `handler`.
    /// The first subscribe happens before this returns, so nothing published
    /// afterwards is missed.
    pub async fn subscribe<T, H>(&self, handler: Arc<H>) -> Result<(), BusError>
    where
        T: Topic,
        H: MessageHandler<T::Payload>,
    {
        if !self.is_connected() {
            error!(topic = T::NAME, "cannot subscribe, message bus not connected");
            return Err(BusError::Unavailable);
        }

        let subscription = self.inner.transport.subscribe(T::NAME).await?;

        let mut listeners = self.inner.listeners.lock().await;
        let listener = Listener {
            topic: T::NAME,
            transport: Arc::clone(&self.inner.transport),
            settings: self.inner.settings.clone(),
            shutdown: listeners.shutdown.clone(),
        };
        let task = tokio::spawn(listener.run::<T, H>(subscription, handler));
        listeners.tasks.push((T::NAME, task));

        info!(topic = T::NAME, "subscription listener started");
        Ok(())
    }

    pub async fn listener_count(&self) -> usize {
        let listeners = self.inner.listeners.lock().await;
        listeners
            .tasks
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .count()
    }

    /// Stop every listener, waiting up to the configured timeout for each,
    /// then close the transport.
    pub async fn disconnect(&self) {
        info!("disconnecting from message bus");
        self.inner.connected.store(false, Ordering::Release);

        let tasks = {
            let mut listeners = self.inner.listeners.lock().await;
            listeners.shutdown.cancel();
            std::mem::take(&mut listeners.tasks)
        };

        if !tasks.is_empty() {
            info!(count = tasks.len(), "waiting for listener tasks to stop");
        }

        let timeout = self.inner.settings.listener_shutdown_timeout();
        join_all(tasks.into_iter().map(|(topic, mut task)| async move {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(topic, error = %e, "listener task failed"),
                Err(_) => {
                    warn!(topic, "listener did not stop in time, aborting");
                    task.abort();
                }
            }
        }))
        .await;

        self.inner.transport.close().await;
        info!("message bus disconnected");
    }
}

// ============================================================================
// Listener
// ============================================================================

struct Listener {
    topic: &'static str,
    transport: Arc<dyn Transport>,
    settings: BusSettings,
    shutdown: CancellationToken,
}

impl Listener {
    async fn run<T, H>(self, mut subscription: Box<dyn Subscription>, handler: Arc<H>)
    where
        T: Topic,
        H: MessageHandler<T::Payload>,
    {
        info!(topic = self.topic, "listener running");

        'listen: loop {
            let err = loop {
                let next = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break 'listen,
                    next = subscription.next_message() => next,
                };

                match next {
                    // Delivery runs outside the select so an in-flight
                    // handler always completes.
                    Ok(raw) => deliver::<T, H>(handler.as_ref(), &raw).await,
                    Err(e) => break e,
                }
            };

            warn!(topic = self.topic, error = %err, "subscription lost, re-subscribing");
            match self.resubscribe().await {
                Some(fresh) => subscription = fresh,
                None => break,
            }
        }

        info!(topic = self.topic, "listener stopped");
    }

    /// Retry the subscription with capped exponential backoff. Returns `None`
    /// on shutdown or once the attempt budget is spent.
    async fn resubscribe(&self) -> Option<Box<dyn Subscription>> {
        let mut delay = self.settings.resubscribe_initial_delay();
        let max_delay = self.settings.resubscribe_max_delay();

        for attempt in 1..=self.settings.max_resubscribe_attempts {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.transport.subscribe(self.topic).await {
                Ok(subscription) => {
                    info!(topic = self.topic, attempt, "re-subscribed");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(topic = self.topic, attempt, error = %e, "re-subscribe failed");
                    delay = (delay * 2).min(max_delay);
                }
            }
        }

        error!(
            topic = self.topic,
            attempts = self.settings.max_resubscribe_attempts,
            "giving up on topic, listener exiting"
        );
        None
    }
}

async fn deliver<T, H>(handler: &H, raw: &str)
where
    T: Topic,
    H: MessageHandler<T::Payload>,
{
    debug!(topic = T::NAME, payload = %raw, "received message");

    let payload = match serde_json::from_str::<T::Payload>(raw) {
        Ok(payload) => payload,
        Err(e) => {
            error!(topic = T::NAME, error = %e, payload = %raw, "failed to decode message, dropping");
            return;
        }
    };

    match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(topic = T::NAME, error = %e, "handler failed to process message"),
        Err(_) => error!(topic = T::NAME, "handler panicked while processing message"),
    }
}
