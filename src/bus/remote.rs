//! Redis-backed signal bus shared between nodes.
//!
//! Entries live in the `market_signals` hash keyed by symbol. Every put is
//! published on `signal:{symbol}` and `signal:all`; local subscribers are fed
//! from a listener on `signal:all`, so writes from any node reach them.

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{BusError, SignalBus, SignalEntry};

const SIGNALS_KEY: &str = "market_signals";
const ALL_CHANNEL: &str = "signal:all";
const MAX_LISTENER_BACKOFF: Duration = Duration::from_secs(30);

fn symbol_channel(symbol: &str) -> String {
    format!("signal:{}", symbol)
}

/// Reconnect delay for the notification listener, doubling up to a cap.
#[derive(Debug)]
struct ListenerBackoff {
    next: Duration,
}

impl ListenerBackoff {
    const INITIAL: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }

    /// Called once a subscription is live again.
    fn reset(&mut self) {
        self.next = Self::INITIAL;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_LISTENER_BACKOFF);
        delay
    }
}

pub struct RedisBus {
    conn: ConnectionManager,
    notify: broadcast::Sender<SignalEntry>,
    listener: JoinHandle<()>,
}

impl RedisBus {
    /// Connect and start the notification listener.
    pub async fn connect(redis_url: &str, notify_capacity: usize) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| anyhow!("Redis connection timeout after 5 seconds"))??;

        let (notify, _) = broadcast::channel(notify_capacity.max(1));
        let listener = tokio::spawn(Self::listen(client, notify.clone()));

        info!("Signal bus connected to Redis at {}", redis_url);
        Ok(Self {
            conn,
            notify,
            listener,
        })
    }

    /// Forward `signal:all` messages to local subscribers, reconnecting with
    /// exponential backoff.
    async fn listen(client: Client, notify: broadcast::Sender<SignalEntry>) {
        let mut backoff = ListenerBackoff::new();

        loop {
            match Self::forward(&client, &notify, &mut backoff).await {
                Ok(()) => warn!("Redis notification stream ended, resubscribing"),
                Err(e) => error!(error = %e, "Redis notification listener failed"),
            }
            sleep(backoff.next_delay()).await;
        }
    }

    async fn forward(
        client: &Client,
        notify: &broadcast::Sender<SignalEntry>,
        backoff: &mut ListenerBackoff,
    ) -> Result<(), BusError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(ALL_CHANNEL).await?;
        debug!("Subscribed to {}", ALL_CHANNEL);
        backoff.reset();

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable bus notification");
                    continue;
                }
            };
            match serde_json::from_str::<SignalEntry>(&payload) {
                Ok(entry) => {
                    let _ = notify.send(entry);
                }
                Err(e) => warn!(error = %e, "Malformed bus notification"),
            }
        }
        Ok(())
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl SignalBus for RedisBus {
    async fn put(&self, entry: SignalEntry) -> Result<(), BusError> {
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();

        let stored: Result<(), redis::RedisError> =
            conn.hset(SIGNALS_KEY, &entry.symbol, &payload).await;

        let published: Result<(), redis::RedisError> = redis::pipe()
            .publish(symbol_channel(&entry.symbol), &payload)
            .ignore()
            .publish(ALL_CHANNEL, &payload)
            .ignore()
            .query_async(&mut conn)
            .await;

        if let Err(e) = published {
            warn!(symbol = %entry.symbol, error = %e, "Failed to publish signal");
        }
        stored?;
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<SignalEntry>, BusError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(SIGNALS_KEY, symbol).await?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    async fn get_all(&self) -> Result<HashMap<String, SignalEntry>, BusError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(SIGNALS_KEY).await?;

        let entries: HashMap<String, SignalEntry> = raw
            .into_iter()
            .filter_map(|(symbol, payload)| match serde_json::from_str(&payload) {
                Ok(entry) => Some((symbol, entry)),
                Err(e) => {
                    warn!(%symbol, error = %e, "Skipping malformed bus entry");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    async fn clear(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(SIGNALS_KEY).await?;
        info!("Signal bus cleared");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEntry> {
        self.notify.subscribe()
    }
}
