//! In-process signal bus.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use super::{BusError, SignalBus, SignalEntry};

/// Single-node bus backed by a map and a broadcast channel.
pub struct MemoryBus {
    entries: RwLock<HashMap<String, SignalEntry>>,
    notify: broadcast::Sender<SignalEntry>,
}

impl MemoryBus {
    pub fn new(notify_capacity: usize) -> Self {
        let (notify, _) = broadcast::channel(notify_capacity.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            notify,
        }
    }
}

#[async_trait]
impl SignalBus for MemoryBus {
    async fn put(&self, entry: SignalEntry) -> Result<(), BusError> {
        self.entries
            .write()
            .await
            .insert(entry.symbol.clone(), entry.clone());

        // No receivers is not an error
        if self.notify.send(entry).is_err() {
            debug!("No bus subscribers");
        }
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<SignalEntry>, BusError> {
        Ok(self.entries.read().await.get(symbol).cloned())
    }

    async fn get_all(&self) -> Result<HashMap<String, SignalEntry>, BusError> {
        Ok(self.entries.read().await.clone())
    }

    async fn clear(&self) -> Result<(), BusError> {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        info!(removed, "Signal bus cleared");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEntry> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Admission;
    use crate::market::{Category, Decision, Instrument};
    use chrono::Utc;

    fn entry(symbol: &str, reason: &str) -> SignalEntry {
        SignalEntry::new(
            &Instrument::new(symbol, Category::Crypto),
            Decision::none(reason),
            Admission::Allowed,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let bus = MemoryBus::new(16);

        bus.put(entry("BTC-USD", "first")).await.unwrap();
        bus.put(entry("BTC-USD", "second")).await.unwrap();

        let stored = bus.get("BTC-USD").await.unwrap().unwrap();
        assert_eq!(stored.decision, Decision::none("second"));
        assert!(bus.get("ETH-USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notification_matches_stored_entry() {
        let bus = MemoryBus::new(16);
        let mut rx = bus.subscribe();

        let written = entry("ETH-USD", "AI Hold");
        bus.put(written.clone()).await.unwrap();

        let notified = rx.recv().await.unwrap();
        assert_eq!(notified, written);
        assert_eq!(bus.get("ETH-USD").await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_get_all_and_clear() {
        let bus = MemoryBus::new(16);
        bus.put(entry("BTC-USD", "hold")).await.unwrap();
        bus.put(entry("ETH-USD", "hold")).await.unwrap();

        let all = bus.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("ETH-USD"));

        bus.clear().await.unwrap();
        assert!(bus.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_without_subscribers() {
        let bus = MemoryBus::new(1);
        assert!(bus.put(entry("SOL-USD", "hold")).await.is_ok());
    }
}
