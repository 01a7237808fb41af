use super::transitions::{NotificationDispatcher, TransitionTable};
use crate::domain::event::{ChangeEvent, EntityKey};
use crate::domain::ids::ConsumerId;
use crate::domain::ports::{NotificationSinkRef, PushTransportRef};
use crate::domain::quote::ViewerRole;
use crate::error::Result;
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Refetch callback run after every change signal.
pub type ChangeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

type Senders = Arc<StdMutex<HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>>>;

/// Disposable handle for one listener; pass it back to [`SubscriptionHub::unsubscribe`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    consumer: ConsumerId,
    key: EntityKey,
}

impl SubscriptionHandle {
    /// The key this listener is attached to.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// The consumer that owns this listener.
    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }
}

struct Listener {
    consumer: ConsumerId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// One transport subscription per key, fanned out to its local listeners.
struct Channel {
    senders: Senders,
    listeners: HashMap<u64, Listener>,
    pump_token: CancellationToken,
    pump: JoinHandle<()>,
}

/// Push subscriptions over `(table, filter)` keys with signal-only semantics.
///
/// Every delivered mutation triggers the listener's refetch callback; the payload is only
/// read to pick a status-change notification from the transition table. Signals that
/// arrive while a refetch runs are coalesced into one follow-up refetch, so a listener
/// never has more than one refetch in flight.
pub struct SubscriptionHub {
    transport: PushTransportRef,
    sink: NotificationSinkRef,
    table: Arc<TransitionTable>,
    channels: Mutex<HashMap<EntityKey, Channel>>,
    next_id: AtomicU64,
}

impl SubscriptionHub {
    /// Creates a new `SubscriptionHub`.
    ///
    /// # Arguments
    ///
    /// * `transport` - Source of change events; one stream is opened per key.
    /// * `sink` - Receives the transition notices.
    /// * `table` - Maps status transitions to notices per viewer role.
    pub fn new(transport: PushTransportRef, sink: NotificationSinkRef, table: TransitionTable) -> Self {
        Self {
            transport,
            sink,
            table: Arc::new(table),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attaches `on_change` to `key` for `consumer`.
    ///
    /// A consumer holds at most one listener per key: subscribing again replaces the
    /// previous listener.
    pub async fn subscribe<F, Fut>(
        &self,
        consumer: &ConsumerId,
        key: EntityKey,
        role: ViewerRole,
        on_change: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let on_change: ChangeCallback = Arc::new(move || on_change().boxed());
        let mut channels = self.channels.lock().await;

        let previous = channels.get(&key).and_then(|channel| {
            channel
                .listeners
                .iter()
                .find(|(_, listener)| listener.consumer == *consumer)
                .map(|(id, _)| *id)
        });
        if let Some(previous) = previous {
            debug!(%key, %consumer, "replacing existing listener");
            self.detach(&mut channels, &key, previous).await?;
        }

        if !channels.contains_key(&key) {
            let stream = self.transport.open(&key).await?;
            let senders: Senders = Arc::default();
            let pump_token = CancellationToken::new();
            let pump = tokio::spawn(pump(key.clone(), stream, Arc::clone(&senders), pump_token.clone()));
            debug!(%key, "opened push channel");
            channels.insert(
                key.clone(),
                Channel {
                    senders,
                    listeners: HashMap::new(),
                    pump_token,
                    pump,
                },
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let dispatcher = NotificationDispatcher::new(role, Arc::clone(&self.table), Arc::clone(&self.sink));
        let task = tokio::spawn(listen(key.clone(), receiver, dispatcher, on_change, token.clone()));

        if let Some(channel) = channels.get_mut(&key) {
            channel
                .senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, sender);
            channel.listeners.insert(
                id,
                Listener {
                    consumer: consumer.clone(),
                    token,
                    task,
                },
            );
        }

        Ok(SubscriptionHandle {
            id,
            consumer: consumer.clone(),
            key,
        })
    }

    /// Releases the listener. Once this returns no callback fires for it again.
    ///
    /// Unsubscribing a handle that was already replaced or released is a no-op.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut channels = self.channels.lock().await;
        self.detach(&mut channels, &handle.key, handle.id).await
    }

    /// Releases every listener and closes every transport channel.
    pub async fn shutdown(&self) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let listeners: Vec<(EntityKey, u64)> = channels
            .iter()
            .flat_map(|(key, channel)| channel.listeners.keys().map(|id| (key.clone(), *id)))
            .collect();
        for (key, id) in listeners {
            self.detach(&mut channels, &key, id).await?;
        }
        Ok(())
    }

    /// Number of listeners attached to `key`.
    pub async fn listener_count(&self, key: &EntityKey) -> usize {
        self.channels
            .lock()
            .await
            .get(key)
            .map_or(0, |channel| channel.listeners.len())
    }

    async fn detach(
        &self,
        channels: &mut HashMap<EntityKey, Channel>,
        key: &EntityKey,
        id: u64,
    ) -> Result<()> {
        let Some(channel) = channels.get_mut(key) else {
            return Ok(());
        };
        let Some(listener) = channel.listeners.remove(&id) else {
            return Ok(());
        };
        channel
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        listener.token.cancel();
        if let Err(err) = listener.task.await {
            warn!(%key, error = %err, "listener task ended abnormally");
        }
        debug!(%key, consumer = %listener.consumer, "listener detached");

        if channel.listeners.is_empty()
            && let Some(channel) = channels.remove(key)
        {
            channel.pump_token.cancel();
            if let Err(err) = channel.pump.await {
                warn!(%key, error = %err, "push pump ended abnormally");
            }
            self.transport.close(key).await?;
            debug!(%key, "closed push channel");
        }
        Ok(())
    }
}

/// Forwards transport events to every listener of the channel.
async fn pump(
    key: EntityKey,
    mut stream: BoxStream<'static, ChangeEvent>,
    senders: Senders,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            debug!(%key, "push stream ended");
            break;
        };
        let listeners = senders.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in listeners.values() {
            let _ = sender.send(event.clone());
        }
    }
}

async fn listen(
    key: EntityKey,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    mut dispatcher: NotificationDispatcher,
    on_change: ChangeCallback,
    token: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(first) = first else { break };

        let mut batch = vec![first];
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }
        if token.is_cancelled() {
            break;
        }
        for event in &batch {
            dispatcher.dispatch(event);
        }

        debug!(%key, signals = batch.len(), "refetching after change signal");
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = on_change() => {}
        }
    }
}
