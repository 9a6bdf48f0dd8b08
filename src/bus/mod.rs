//! Message Bus Module
//!
//! The `MessageBus` brokers traffic between channel adapters and agents:
//! bounded `inbound` and `outbound` queues plus a best-effort observer
//! fan-out used by auxiliary surfaces such as dashboards.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Channel   │────>│  MessageBus │────>│ Agent Loop  │
//! │  (adapter)  │     │  (inbound)  │     │             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │ observers        │
//!        │                   ▼                  ▼
//!        └──────────── outbound queue ◄─────────┘
//! ```
//!
//! Queue delivery is lossless: a publish blocks while the queue is full and
//! fails only once the bus is closed. Observer delivery is best-effort: a
//! full observer buffer drops the event for that observer alone.

pub mod message;

pub use message::{AuxiliaryEvent, BusEvent, BusEventPayload, InboundMessage, OutboundMessage};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, YoctoError};

/// Capacity of the inbound and outbound queues.
const QUEUE_CAPACITY: usize = 100;

/// Capacity of each observer's private event buffer.
const OBSERVER_CAPACITY: usize = 50;

struct ObserverSlot {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
}

/// A subscription handle returned by [`MessageBus::subscribe`].
///
/// Receive events with [`BusObserver::recv`]. Dropping the handle without
/// unsubscribing leaves a dead slot that is skipped on delivery; call
/// [`MessageBus::unsubscribe`] to remove it eagerly.
pub struct BusObserver {
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
}

impl BusObserver {
    /// Receive the next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Receive without waiting; `None` when the buffer is empty.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

/// The central message bus for routing messages between channels and agents.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    observers: Arc<Mutex<Vec<ObserverSlot>>>,
    next_observer_id: Arc<AtomicU64>,
    closed: CancellationToken,
}

impl MessageBus {
    /// Create a new bus with the default queue capacity (100 each way).
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    /// Create a new bus with a custom queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer_id: Arc::new(AtomicU64::new(1)),
            closed: CancellationToken::new(),
        }
    }

    /// Publish an inbound message, blocking while the queue is full.
    ///
    /// After a successful enqueue every observer is notified; observers with
    /// full buffers miss the event individually.
    ///
    /// # Errors
    /// [`YoctoError::BusClosed`] once [`MessageBus::close`] has been called.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(YoctoError::BusClosed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => return Err(YoctoError::BusClosed),
            sent = self.inbound_tx.send(msg.clone()) => {
                sent.map_err(|_| YoctoError::BusClosed)?;
            }
        }
        self.notify_observers(BusEvent::inbound(msg)).await;
        Ok(())
    }

    /// Consume the next inbound message.
    ///
    /// Returns `None` when the token fires or the bus is closed.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = self.closed.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Publish an outbound message, blocking while the queue is full.
    ///
    /// # Errors
    /// [`YoctoError::BusClosed`] once [`MessageBus::close`] has been called.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(YoctoError::BusClosed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => return Err(YoctoError::BusClosed),
            sent = self.outbound_tx.send(msg.clone()) => {
                sent.map_err(|_| YoctoError::BusClosed)?;
            }
        }
        self.notify_observers(BusEvent::outbound(msg)).await;
        Ok(())
    }

    /// Consume the next outbound message.
    ///
    /// Returns `None` when the token fires or the bus is closed.
    pub async fn consume_outbound(&self, cancel: &CancellationToken) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = self.closed.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Fan an auxiliary event out to observers without touching the queues.
    ///
    /// Used for connectivity changes, QR codes and similar breadcrumbs.
    pub async fn publish_auxiliary(&self, event: AuxiliaryEvent) {
        self.notify_observers(BusEvent::auxiliary(event)).await;
    }

    /// Register an observer that receives copies of all bus events.
    pub async fn subscribe(&self) -> BusObserver {
        let (tx, rx) = mpsc::channel(OBSERVER_CAPACITY);
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().await.push(ObserverSlot { id, tx });
        BusObserver { id, rx }
    }

    /// Remove an observer. Calling this twice for the same handle is a no-op
    /// the second time.
    pub async fn unsubscribe(&self, observer: &BusObserver) {
        let mut observers = self.observers.lock().await;
        observers.retain(|slot| slot.id != observer.id);
    }

    /// Close the bus: subsequent publishes fail with `BusClosed` and blocked
    /// consumers wake with `None`. Queued messages are not delivered.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the bus has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn notify_observers(&self, event: BusEvent) {
        let observers = self.observers.lock().await;
        for slot in observers.iter() {
            // Non-blocking: a full or gone observer misses this event only.
            if let Err(e) = slot.tx.try_send(event.clone()) {
                trace!(observer = slot.id, error = %e, "dropping bus event for observer");
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MessageBus {
    /// Clones share the same queues, observer list and close state.
    fn clone(&self) -> Self {
        Self {
            inbound_tx: self.inbound_tx.clone(),
            inbound_rx: Arc::clone(&self.inbound_rx),
            outbound_tx: self.outbound_tx.clone(),
            outbound_rx: Arc::clone(&self.outbound_rx),
            observers: Arc::clone(&self.observers),
            next_observer_id: Arc::clone(&self.next_observer_id),
            closed: self.closed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_inbound_flow() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello");

        bus.publish_inbound(msg).await.unwrap();
        let received = bus.consume_inbound(&cancel).await.unwrap();

        assert_eq!(received.content, "Hello");
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.session_key, "telegram:chat456");
    }

    #[tokio::test]
    async fn test_bus_outbound_flow() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        let msg = OutboundMessage::new("telegram", "chat456", "Response");

        bus.publish_outbound(msg).await.unwrap();
        let received = bus.consume_outbound(&cancel).await.unwrap();

        assert_eq!(received.content, "Response");
        assert_eq!(received.chat_id, "chat456");
    }

    #[tokio::test]
    async fn test_bus_preserves_publish_order() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();

        for i in 0..5 {
            let msg = InboundMessage::new("telegram", "user", "chat", &format!("Message {}", i));
            bus.publish_inbound(msg).await.unwrap();
        }
        for i in 0..5 {
            let received = bus.consume_inbound(&cancel).await.unwrap();
            assert_eq!(received.content, format!("Message {}", i));
        }
    }

    #[tokio::test]
    async fn test_consume_cancelled() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(bus.consume_inbound(&cancel).await.is_none());
        assert!(bus.consume_outbound(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_consume_wakes_on_cancel() {
        let bus = Arc::new(MessageBus::new());
        let cancel = CancellationToken::new();

        let bus2 = Arc::clone(&bus);
        let cancel2 = cancel.clone();
        let consumer = tokio::spawn(async move { bus2.consume_inbound(&cancel2).await });

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(tokio::time::Duration::from_millis(200), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = MessageBus::new();
        bus.close();
        assert!(bus.is_closed());

        let msg = InboundMessage::new("test", "u", "c", "late");
        assert!(matches!(
            bus.publish_inbound(msg).await,
            Err(YoctoError::BusClosed)
        ));
        let out = OutboundMessage::new("test", "c", "late");
        assert!(matches!(
            bus.publish_outbound(out).await,
            Err(YoctoError::BusClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_consumer() {
        let bus = Arc::new(MessageBus::new());
        let cancel = CancellationToken::new();

        let bus2 = Arc::clone(&bus);
        let consumer = tokio::spawn(async move { bus2.consume_inbound(&cancel).await });

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        bus.close();

        let result = tokio::time::timeout(tokio::time::Duration::from_millis(200), consumer)
            .await
            .expect("consumer should wake on close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_observer_sees_events_in_order() {
        let bus = MessageBus::new();
        let cancel = CancellationToken::new();
        let mut observer = bus.subscribe().await;

        bus.publish_inbound(InboundMessage::new("cli", "u", "c", "one"))
            .await
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("cli", "c", "two"))
            .await
            .unwrap();
        bus.publish_auxiliary(AuxiliaryEvent::new("whatsapp", "connected"))
            .await;

        let first = observer.recv().await.unwrap();
        assert!(matches!(first.payload, BusEventPayload::Inbound { .. }));
        let second = observer.recv().await.unwrap();
        assert!(matches!(second.payload, BusEventPayload::Outbound { .. }));
        let third = observer.recv().await.unwrap();
        assert!(matches!(third.payload, BusEventPayload::Auxiliary { .. }));

        // Main queues were untouched by the auxiliary publish.
        assert!(bus.consume_inbound(&cancel).await.is_some());
        assert!(bus.consume_outbound(&cancel).await.is_some());
    }

    #[tokio::test]
    async fn test_slow_observer_drops_do_not_affect_others() {
        let bus = MessageBus::new();
        let mut fast = bus.subscribe().await;
        let mut slow = bus.subscribe().await;

        // First wave fits both buffers; drain only the fast observer.
        for i in 0..50 {
            bus.publish_auxiliary(AuxiliaryEvent::new("test", &format!("e{}", i)))
                .await;
        }
        let mut fast_events = Vec::new();
        while let Some(event) = fast.try_recv() {
            fast_events.push(event);
        }
        assert_eq!(fast_events.len(), 50);

        // Second wave overflows the undrained slow observer only.
        for i in 50..60 {
            bus.publish_auxiliary(AuxiliaryEvent::new("test", &format!("e{}", i)))
                .await;
        }
        while let Some(event) = fast.try_recv() {
            fast_events.push(event);
        }
        // The fast observer saw everything, in publish order.
        assert_eq!(fast_events.len(), 60);
        let numbers: Vec<usize> = fast_events
            .iter()
            .map(|event| match &event.payload {
                BusEventPayload::Auxiliary { auxiliary } => {
                    auxiliary.event[1..].parse().unwrap()
                }
                _ => panic!("unexpected payload"),
            })
            .collect();
        assert_eq!(numbers, (0..60).collect::<Vec<_>>());

        // The slow observer kept its first 50 and dropped the tail.
        let mut slow_count = 0;
        while slow.try_recv().is_some() {
            slow_count += 1;
        }
        assert_eq!(slow_count, 50);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = MessageBus::new();
        let observer = bus.subscribe().await;

        bus.unsubscribe(&observer).await;
        bus.unsubscribe(&observer).await; // no-op the second time

        // Publishing after unsubscribe should not panic or deliver.
        bus.publish_auxiliary(AuxiliaryEvent::new("test", "ping"))
            .await;
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_receives_nothing_new() {
        let bus = MessageBus::new();
        let mut observer = bus.subscribe().await;
        bus.unsubscribe(&observer).await;

        bus.publish_auxiliary(AuxiliaryEvent::new("test", "ping"))
            .await;
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bus_clone_shares_queues() {
        let bus1 = MessageBus::new();
        let bus2 = bus1.clone();
        let cancel = CancellationToken::new();

        bus1.publish_inbound(InboundMessage::new("cli", "u", "c", "shared"))
            .await
            .unwrap();
        let received = bus2.consume_inbound(&cancel).await.unwrap();
        assert_eq!(received.content, "shared");

        bus2.close();
        assert!(bus1.is_closed());
    }

    #[tokio::test]
    async fn test_bus_concurrent_producers() {
        let bus = Arc::new(MessageBus::new());
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for p in 0..4 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let msg =
                        InboundMessage::new("test", "user", "chat", &format!("p{}-{}", p, i));
                    bus.publish_inbound(msg).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut count = 0;
        while count < 40 {
            assert!(bus.consume_inbound(&cancel).await.is_some());
            count += 1;
        }
    }
}
