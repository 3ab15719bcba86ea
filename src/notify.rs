//! Operator notifications: throttled sync summaries and immediate error
//! reports, delivered through Telegram.

use crate::{
    config,
    database::Database,
    stats::{Summary, SyncStatsAggregator},
};
use alloy_primitives::U256;
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use serde_json::json;
use std::time::Duration;

const PLAYER_METHODS: &[&str] = &["commit", "reveal"];
const HOUSE_METHODS: &[&str] = &["multiPostRandomness"];

/// Something that delivers a text message. The text may contain simple HTML
/// markup.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>>;
}

pub struct Telegram {
    client: reqwest::Client,
    api_base: String,
    chat_id: String,
}

impl Telegram {
    pub fn new(config: &config::Telegram, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            api_base: format!("https://api.telegram.org/bot{}", config.bot_token),
            chat_id: config.chat_id.clone(),
        })
    }

    /// The Telegram transport, if notifications are enabled and credentials
    /// are configured.
    pub fn from_config(
        config: &config::Notifications,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Transport>>> {
        if !config.enabled || !config.telegram.is_configured() {
            tracing::info!("telegram notifications disabled");
            return Ok(None);
        }
        Ok(Some(Box::new(Self::new(&config.telegram, timeout)?)))
    }
}

impl Transport for Telegram {
    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let response = self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
                .context("send telegram message")?;
            anyhow::ensure!(
                response.status().is_success(),
                "telegram responded with {}",
                response.status()
            );
            Ok(())
        }
        .boxed()
    }
}

pub struct NotificationGateway {
    transport: Option<Box<dyn Transport>>,
    stats: SyncStatsAggregator,
    send_start: bool,
    send_completion: bool,
    send_error: bool,
}

impl NotificationGateway {
    pub fn new(
        config: &config::Notifications,
        transport: Option<Box<dyn Transport>>,
        stats: SyncStatsAggregator,
    ) -> Self {
        Self {
            transport,
            stats,
            send_start: config.send_start,
            send_completion: config.send_completion,
            send_error: config.send_error,
        }
    }

    pub async fn notify_start(&self) {
        if !self.send_start {
            return;
        }
        let message = format!(
            "🚀 <b>Games Sync Started</b>\n⏰ Time: {}",
            self.stats.now().format("%Y-%m-%d %H:%M:%S")
        );
        self.send(&message).await;
    }

    /// Records the stats of a finished cycle, and sends a summary of all
    /// cycles since the last one when it is due. Only storage errors are
    /// returned; delivery failures are logged.
    pub async fn notify_cycle(
        &self,
        db: &mut dyn Database,
        new_games: u64,
        updated_games: u64,
        duration: Duration,
    ) -> Result<()> {
        self.stats
            .record(db, new_games, updated_games, duration)
            .await?;
        if !self.send_completion || !self.stats.should_flush(db).await? {
            return Ok(());
        }

        let since = self.stats.last_flush(db).await?;
        let summary = self.stats.aggregate(db, since).await?;
        let costs = if summary.total_new > 0 || summary.total_updated > 0 {
            average_costs(db).await?
        } else {
            None
        };
        self.send(&summary_message(&summary, costs)).await;
        self.stats.mark_flushed(db).await
    }

    /// Sends a failure report right away, bypassing aggregation.
    pub async fn notify_error(&self, error: &str) {
        if !self.send_error {
            return;
        }
        let message = format!(
            "❌ <b>Games Sync Failed</b>\n⏰ Time: {}\n🚨 Error: {}",
            self.stats.now().format("%Y-%m-%d %H:%M:%S"),
            error
        );
        self.send(&message).await;
    }

    async fn send(&self, text: &str) {
        let Some(transport) = &self.transport else {
            tracing::debug!(text, "notifications disabled, not sending");
            return;
        };
        match transport.send(text).await {
            Ok(()) => tracing::info!("notification sent"),
            Err(err) => tracing::error!(?err, "failed to send notification"),
        }
    }
}

/// Average fees of player and house transactions, when there are both.
async fn average_costs(db: &mut dyn Database) -> Result<Option<(U256, U256)>> {
    let player = db
        .average_fee(PLAYER_METHODS)
        .await
        .context("average player fee")?;
    let house = db
        .average_fee(HOUSE_METHODS)
        .await
        .context("average house fee")?;
    Ok(player.zip(house))
}

fn summary_message(summary: &Summary, costs: Option<(U256, U256)>) -> String {
    if summary.total_new == 0 && summary.total_updated == 0 {
        return format!(
            "No games\nPeriod: {}\n{} syncs",
            summary.time_range, summary.sync_count
        );
    }
    let mut message = format!(
        "{} new games\n{} games updated\n{} syncs",
        summary.total_new, summary.total_updated, summary.sync_count
    );
    if let Some((player, house)) = costs {
        message.push_str(&format!(
            "\n\n{} avg player costs\n{} avg house costs",
            format_eth(player),
            format_eth(house)
        ));
    }
    message
}

/// Formats wei as ETH rounded to 4 decimals.
pub fn format_eth(wei: U256) -> String {
    let unit = U256::from(10_u64.pow(14));
    let scaled = wei.saturating_add(unit / U256::from(2)) / unit;
    let (whole, fraction) = scaled.div_rem(U256::from(10_000));
    format!("{whole}.{:04}", fraction.to::<u64>())
}
