//! Process-wide typed event bus.
//!
//! Subscriptions are keyed by the event's concrete type. Delivery is
//! asynchronous: every subscriber drains its own FIFO queue on a dedicated
//! task, so an emit never blocks and a slow subscriber never delays another.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;

type Erased = Arc<dyn Any + Send + Sync>;

struct Subscriber {
    id: u64,
    once: bool,
    tx: mpsc::UnboundedSender<Erased>,
}

/// Returned by [`Bus::subscribe`]; pass back to [`Bus::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    type_id: TypeId,
    id: u64,
}

#[derive(Default)]
pub struct Bus {
    subscribers: Mutex<HashMap<TypeId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

static BUS: OnceLock<Bus> = OnceLock::new();

pub fn bus() -> &'static Bus {
    BUS.get_or_init(Bus::default)
}

impl Bus {
    /// Registers `cb` for every future emit of `T`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<T, F>(&self, cb: F) -> Handle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(cb, false)
    }

    /// Like [`Bus::subscribe`] but the registration is dropped after the
    /// first delivery.
    pub fn subscribe_once<T, F>(&self, cb: F) -> Handle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.register(cb, true)
    }

    fn register<T, F>(&self, cb: F, once: bool) -> Handle
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Erased>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(event) = event.downcast_ref::<T>() {
                    let event = event.clone();
                    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| cb(event))) {
                        tracing::error!(panic = ?panic, "event subscriber panicked");
                    }
                }
            }
        });

        let type_id = TypeId::of::<T>();
        self.lock().entry(type_id).or_default().push(Subscriber { id, once, tx });
        Handle { type_id, id }
    }

    pub fn unsubscribe(&self, handle: Handle) {
        let mut subs = self.lock();
        if let Some(list) = subs.get_mut(&handle.type_id) {
            list.retain(|sub| sub.id != handle.id);
            if list.is_empty() {
                subs.remove(&handle.type_id);
            }
        }
    }

    /// Queues `event` for every current subscriber of `T` and returns
    /// immediately. Within one subscription events arrive in emit order;
    /// across subscriptions the order is undefined.
    pub fn emit<T: Clone + Send + Sync + 'static>(&self, event: T) {
        let erased: Erased = Arc::new(event);
        let mut subs = self.lock();
        let type_id = TypeId::of::<T>();
        if let Some(list) = subs.get_mut(&type_id) {
            list.retain(|sub| {
                let delivered = sub.tx.send(erased.clone()).is_ok();
                delivered && !sub.once
            });
            if list.is_empty() {
                subs.remove(&type_id);
            }
        }
    }

    /// Drops every subscription. Intended for tests.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Subscriber>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect<T: PartialEq>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
        let mut out = Vec::new();
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn emits_reach_every_subscriber() {
        #[derive(Clone, PartialEq, Debug)]
        struct Ping(u32);

        let bus = Bus::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.subscribe::<Ping, _>(move |p| {
            let _ = tx_a.send(p.0);
        });
        bus.subscribe::<Ping, _>(move |p| {
            let _ = tx_b.send(p.0);
        });

        bus.emit(Ping(7));

        assert_eq!(collect(&mut rx_a, 1).await, vec![7]);
        assert_eq!(collect(&mut rx_b, 1).await, vec![7]);
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscription() {
        #[derive(Clone)]
        struct Tick(u32);

        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe::<Tick, _>(move |t| {
            let _ = tx.send(t.0);
        });

        for i in 0..50 {
            bus.emit(Tick(i));
        }

        assert_eq!(collect(&mut rx, 50).await, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn once_subscription_fires_a_single_time() {
        #[derive(Clone)]
        struct Fire;

        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_once::<Fire, _>(move |_| {
            let _ = tx.send(());
        });

        bus.emit(Fire);
        bus.emit(Fire);

        assert_eq!(collect(&mut rx, 1).await.len(), 1);
        // sender side is gone after the once delivery
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        #[derive(Clone)]
        struct Beat;

        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = bus.subscribe::<Beat, _>(move |_| {
            let _ = tx.send(());
        });
        bus.unsubscribe(handle);

        bus.emit(Beat);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscriber_panic_does_not_poison_the_bus() {
        #[derive(Clone)]
        struct Boom(u32);

        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe::<Boom, _>(|b| {
            if b.0 == 0 {
                panic!("subscriber failure");
            }
        });
        bus.subscribe::<Boom, _>(move |b| {
            let _ = tx.send(b.0);
        });

        bus.emit(Boom(0));
        bus.emit(Boom(1));

        assert_eq!(collect(&mut rx, 2).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn reset_clears_all_subscriptions() {
        #[derive(Clone)]
        struct Gone;

        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe::<Gone, _>(move |_| {
            let _ = tx.send(());
        });
        bus.reset();

        bus.emit(Gone);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
