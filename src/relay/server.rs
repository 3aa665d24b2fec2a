//! WebSocket entry point: `/ws/market/{symbol}`.

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::Relay;
use crate::bus::{SignalBus, SignalEntry};

const MARKET_PATH_PREFIX: &str = "/ws/market/";

/// Extract the symbol from a request path, percent-decoded.
fn symbol_from_path(path: &str) -> Option<String> {
    let raw = path.strip_prefix(MARKET_PATH_PREFIX)?;
    let raw = raw.split('?').next().unwrap_or(raw);
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    urlencoding::decode(raw).ok().map(|s| s.into_owned())
}

/// Accepts client connections and binds each to one symbol's feed.
pub struct RelayServer {
    relay: Arc<Relay>,
    bus: Arc<dyn SignalBus>,
    send_timeout: Duration,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>, bus: Arc<dyn SignalBus>, send_timeout: Duration) -> Self {
        Self {
            relay,
            bus,
            send_timeout,
        }
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn serve(self: Arc<Self>, addr: &str, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay server on {}", addr))?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("🌐 Relay server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                            debug!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Relay server stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut symbol = None;
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            match symbol_from_path(req.uri().path()) {
                Some(s) => {
                    symbol = Some(s);
                    Ok(resp)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("unknown endpoint".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        })
        .await
        .context("WebSocket handshake failed")?;

        let Some(symbol) = symbol else {
            return Ok(());
        };

        // Register before reading the snapshot so no update falls in between
        let mut feed = self.relay.connect(&symbol);
        info!(%peer, %symbol, id = feed.id, "Client subscribed");

        let (mut sink, mut incoming) = ws.split();
        let mut last_sent = None;

        match self.bus.get(&symbol).await {
            Ok(Some(snapshot)) => {
                last_sent = Some(snapshot.updated_at);
                if let Err(e) = self.send(&mut sink, &snapshot).await {
                    self.relay.disconnect(&symbol, feed.id);
                    return Err(e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%symbol, error = %e, "Snapshot unavailable"),
        }

        let result = loop {
            tokio::select! {
                update = feed.rx.recv() => {
                    let Some(entry) = update else {
                        // Relay dropped this connection
                        break Ok(());
                    };
                    if last_sent.is_some_and(|ts| entry.updated_at <= ts) {
                        continue;
                    }
                    last_sent = Some(entry.updated_at);
                    if let Err(e) = self.send(&mut sink, &entry).await {
                        break Err(e);
                    }
                }
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(_)) => {}
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        break Ok(());
                    }
                }
            }
        };

        self.relay.disconnect(&symbol, feed.id);
        info!(%peer, %symbol, "Client unsubscribed");
        result
    }

    async fn send<S>(&self, sink: &mut S, entry: &SignalEntry) -> Result<()>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let payload = serde_json::to_string(entry)?;
        timeout(self.send_timeout, sink.send(Message::Text(payload.into())))
            .await
            .context("Client send timed out")??;
        Ok(())
    }
}
