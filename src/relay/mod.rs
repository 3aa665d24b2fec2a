//! Distribution relay: fans bus updates out to per-symbol client connections.
//!
//! Each connection owns a bounded queue. Delivery never waits on a client: a
//! full or closed queue gets the connection dropped from the registry, and a
//! symbol whose last connection goes away is removed entirely.

mod server;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{SignalBus, SignalEntry};
use crate::config::RelayMode;

pub use server::RelayServer;

type Registry = HashMap<String, HashMap<u64, mpsc::Sender<SignalEntry>>>;

/// Receiving half of a client subscription.
#[derive(Debug)]
pub struct ClientFeed {
    pub id: u64,
    pub symbol: String,
    pub rx: mpsc::Receiver<SignalEntry>,
}

/// Registry of live client subscriptions.
pub struct Relay {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    client_buffer: usize,
}

impl Relay {
    pub fn new(client_buffer: usize) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            client_buffer: client_buffer.max(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave the map half-updated
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection for `symbol`.
    pub fn connect(&self, symbol: &str) -> ClientFeed {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.client_buffer);

        self.registry()
            .entry(symbol.to_string())
            .or_default()
            .insert(id, tx);

        debug!(symbol, id, "Client connected");
        ClientFeed {
            id,
            symbol: symbol.to_string(),
            rx,
        }
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn disconnect(&self, symbol: &str, id: u64) {
        let mut registry = self.registry();
        if let Some(connections) = registry.get_mut(symbol) {
            connections.remove(&id);
            if connections.is_empty() {
                registry.remove(symbol);
            }
        }
        debug!(symbol, id, "Client disconnected");
    }

    /// Push `entry` to every connection for its symbol. Returns how many
    /// connections accepted it.
    pub fn dispatch(&self, entry: &SignalEntry) -> usize {
        let mut registry = self.registry();
        let Some(connections) = registry.get_mut(&entry.symbol) else {
            return 0;
        };

        let before = connections.len();
        connections.retain(|id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(symbol = %entry.symbol, id, "Client too slow, dropping connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let delivered = connections.len();

        if connections.is_empty() {
            registry.remove(&entry.symbol);
        }
        if delivered < before {
            debug!(symbol = %entry.symbol, dropped = before - delivered, "Pruned connections");
        }
        delivered
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.registry().get(symbol).map_or(0, |c| c.len())
    }

    /// Symbols with at least one live connection.
    pub fn symbols(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    /// Forward bus updates until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mode: RelayMode,
        bus: Arc<dyn SignalBus>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(?mode, "📡 Relay started");
        match mode {
            RelayMode::Pubsub => self.run_pubsub(bus, shutdown).await,
            RelayMode::Poll => self.run_poll(bus, poll_interval, shutdown).await,
        }
        info!("Relay stopped");
    }

    async fn run_pubsub(&self, bus: Arc<dyn SignalBus>, mut shutdown: watch::Receiver<bool>) {
        let mut updates = bus.subscribe();

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(entry) => {
                        self.dispatch(&entry);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Relay lagged behind the bus, resyncing");
                        self.resync(bus.as_ref()).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Bus notifications closed");
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Push the latest entry of every subscribed symbol.
    async fn resync(&self, bus: &dyn SignalBus) {
        match bus.get_all().await {
            Ok(entries) => {
                for symbol in self.symbols() {
                    if let Some(entry) = entries.get(&symbol) {
                        self.dispatch(entry);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Relay resync failed"),
        }
    }

    async fn run_poll(
        &self,
        bus: Arc<dyn SignalBus>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(bus.as_ref(), &mut last_seen).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Forward entries whose `updated_at` changed since the previous poll.
    async fn poll_once(&self, bus: &dyn SignalBus, last_seen: &mut HashMap<String, DateTime<Utc>>) {
        let symbols = self.symbols();
        last_seen.retain(|symbol, _| symbols.contains(symbol));

        for symbol in symbols {
            let entry = match bus.get(&symbol).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%symbol, error = %e, "Relay poll failed");
                    continue;
                }
            };
            if last_seen.get(&symbol) == Some(&entry.updated_at) {
                continue;
            }
            last_seen.insert(symbol, entry.updated_at);
            self.dispatch(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Admission, MemoryBus};
    use crate::market::{Category, Decision, Instrument};
    use tokio_test::{assert_err, assert_ok};

    fn entry(symbol: &str, reason: &str) -> SignalEntry {
        SignalEntry::new(
            &Instrument::new(symbol, Category::Crypto),
            Decision::none(reason),
            Admission::Allowed,
            Utc::now(),
        )
    }

    #[test]
    fn test_connect_disconnect_drops_empty_symbol() {
        let relay = Relay::new(4);
        let a = relay.connect("BTC-USD");
        let b = relay.connect("BTC-USD");
        assert_eq!(relay.subscriber_count("BTC-USD"), 2);

        relay.disconnect("BTC-USD", a.id);
        assert_eq!(relay.subscriber_count("BTC-USD"), 1);

        relay.disconnect("BTC-USD", b.id);
        assert!(relay.symbols().is_empty());

        // Unknown connection is a no-op
        relay.disconnect("BTC-USD", 999);
    }

    #[tokio::test]
    async fn test_dispatch_only_to_matching_symbol() {
        let relay = Relay::new(4);
        let mut btc = relay.connect("BTC-USD");
        let mut eth = relay.connect("ETH-USD");

        assert_eq!(relay.dispatch(&entry("BTC-USD", "AI Hold")), 1);

        let received = assert_ok!(btc.rx.try_recv());
        assert_eq!(received.symbol, "BTC-USD");
        assert_err!(eth.rx.try_recv());
    }

    #[tokio::test]
    async fn test_slow_client_removed_without_blocking_others() {
        let relay = Relay::new(1);
        let _slow = relay.connect("BTC-USD");
        let mut fast = relay.connect("BTC-USD");

        assert_eq!(relay.dispatch(&entry("BTC-USD", "first")), 2);
        assert_ok!(fast.rx.try_recv());

        // Slow client never read; its queue is full
        assert_eq!(relay.dispatch(&entry("BTC-USD", "second")), 1);
        assert_eq!(relay.subscriber_count("BTC-USD"), 1);
        assert_eq!(assert_ok!(fast.rx.try_recv()).decision, Decision::none("second"));
    }

    #[tokio::test]
    async fn test_closed_client_removed() {
        let relay = Relay::new(4);
        let feed = relay.connect("ETH-USD");
        drop(feed);

        assert_eq!(relay.dispatch(&entry("ETH-USD", "AI Hold")), 0);
        assert!(relay.symbols().is_empty());
    }

    #[tokio::test]
    async fn test_pubsub_forwards_bus_updates_in_order() {
        let bus = Arc::new(MemoryBus::new(16));
        let relay = Arc::new(Relay::new(8));
        let mut feed = relay.connect("BTC-USD");
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(relay.clone().run(
            RelayMode::Pubsub,
            bus.clone(),
            Duration::from_millis(10),
            rx,
        ));
        tokio::task::yield_now().await;
        // Give the relay time to subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.put(entry("BTC-USD", "one")).await.unwrap();
        bus.put(entry("ETH-USD", "other")).await.unwrap();
        bus.put(entry("BTC-USD", "two")).await.unwrap();

        let first = feed.rx.recv().await.unwrap();
        let second = feed.rx.recv().await.unwrap();
        assert_eq!(first.decision, Decision::none("one"));
        assert_eq!(second.decision, Decision::none("two"));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_forwards_changes_once() {
        let bus = MemoryBus::new(16);
        let relay = Relay::new(8);
        let mut feed = relay.connect("ETH-USD");
        let mut last_seen = HashMap::new();

        bus.put(entry("ETH-USD", "AI Hold")).await.unwrap();
        relay.poll_once(&bus, &mut last_seen).await;
        relay.poll_once(&bus, &mut last_seen).await;

        assert_ok!(feed.rx.try_recv());
        assert_err!(feed.rx.try_recv());

        bus.put(entry("ETH-USD", "changed")).await.unwrap();
        relay.poll_once(&bus, &mut last_seen).await;
        assert_eq!(
            assert_ok!(feed.rx.try_recv()).decision,
            Decision::none("changed")
        );
    }
}
