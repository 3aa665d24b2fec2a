//! Telegram Bot API alert sink.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{AlertSink, SignalAlert};
use crate::market::Action;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

/// Sends alerts as HTML chat messages.
pub struct TelegramAlertSink {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramAlertSink {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn escape_html(text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    /// Render the chat message for an alert.
    pub fn format_message(alert: &SignalAlert) -> String {
        let icon = if alert.action == Action::Long {
            "🟢"
        } else {
            "🔴"
        };
        let analysis = if alert.rationale.is_empty() {
            "Technical Signal".to_string()
        } else {
            Self::escape_html(&alert.rationale)
        };

        format!(
            "<b>{icon} NEW SIGNAL: {symbol}</b>\n\n\
             <b>Action:</b> {action}\n\
             <b>Price:</b> {entry}\n\
             <b>TP:</b> {target}\n\
             <b>SL:</b> {stop}\n\
             <b>Confidence:</b> {confidence:.1}%\n\n\
             📊 <b>Analysis:</b>\n{analysis}",
            icon = icon,
            symbol = Self::escape_html(&alert.symbol),
            action = alert.action,
            entry = alert.entry,
            target = alert.target,
            stop = alert.stop,
            confidence = alert.confidence,
            analysis = analysis,
        )
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, alert: &SignalAlert) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let request = SendMessage {
            chat_id: &self.chat_id,
            text: Self::format_message(alert),
            parse_mode: "HTML",
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send Telegram message")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error {}: {}", status, body);
        }

        debug!(symbol = %alert.symbol, "Telegram alert sent");
        Ok(())
    }
}
