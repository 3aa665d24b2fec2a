//! HTTP inference endpoint client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{DecisionContext, DecisionProvider};
use crate::market::{Category, Decision, Instrument};

#[derive(Debug, Serialize)]
struct DecideRequest<'a> {
    symbol: &'a str,
    category: Category,
    balance: Decimal,
    timestamp: i64,
}

/// Asks a remote model service for a decision via `POST {endpoint}/decide`.
///
/// The response body is a `Decision` in its tagged wire form, e.g.
/// `{"action":"LONG","entry":"1.1","stop":"1.09","target":"1.12","confidence":72.5}`.
pub struct HttpDecisionProvider {
    client: Client,
    endpoint: String,
}

impl HttpDecisionProvider {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DecisionProvider for HttpDecisionProvider {
    #[instrument(skip(self, instrument, ctx), fields(symbol = %instrument.symbol))]
    async fn decide(&self, instrument: &Instrument, ctx: &DecisionContext) -> Result<Decision> {
        let url = format!("{}/decide", self.endpoint);
        let request = DecideRequest {
            symbol: &instrument.symbol,
            category: instrument.category,
            balance: ctx.balance,
            timestamp: ctx.now.timestamp(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send decide request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Decision endpoint error {}: {}", status, body);
        }

        let decision: Decision = response
            .json()
            .await
            .context("Failed to parse decide response")?;

        debug!(action = %decision.action(), "Decision received");
        Ok(decision)
    }
}
