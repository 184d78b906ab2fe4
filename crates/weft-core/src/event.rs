use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per bus before slow subscribers lag.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Typed publish/subscribe bus.
///
/// Any number of subscribers may listen. Publishing never blocks and never
/// fails: with no subscribers the event is dropped, and a subscriber that
/// falls more than `capacity` events behind skips the oldest ones.
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget delivery. Returns how many subscribers received it.
    pub fn publish(&self, event: E) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!("event dropped, no subscribers");
                0
            }
        }
    }

    /// Register a new subscriber. It sees events published after this call.
    pub fn subscribe(&self) -> EventSubscription<E> {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Receiving half of an [`EventBus`] subscription.
pub struct EventSubscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> EventSubscription<E> {
    /// Wait for the next event. Returns `None` once every publisher is gone.
    ///
    /// Lagged events are skipped silently.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
