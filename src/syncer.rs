//! The sync service: reconciles games, ingests transactions and reports to
//! the notification gateway, once per cycle.

use crate::{
    database::Database, games::GameReconciler, notify::NotificationGateway,
    transactions::TransactionIngestor,
};
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::time;

pub struct Syncer {
    database: Box<dyn Database>,
    games: GameReconciler,
    transactions: TransactionIngestor,
    notifications: NotificationGateway,
}

/// What a single cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Cycle {
    pub new_games: u64,
    pub updated_games: u64,
    pub transactions: u64,
    pub duration: Duration,
}

impl Syncer {
    pub fn new(
        database: Box<dyn Database>,
        games: GameReconciler,
        transactions: TransactionIngestor,
        notifications: NotificationGateway,
    ) -> Self {
        Self {
            database,
            games,
            transactions,
            notifications,
        }
    }

    /// Runs sync cycles forever, `interval` apart. A failed cycle is reported
    /// and retried on the next tick.
    pub async fn run(mut self, interval: Duration) -> Result<()> {
        self.notifications.notify_start().await;
        loop {
            if let Err(err) = self.sync().await {
                tracing::error!(?err, "sync cycle failed");
            }
            time::sleep(interval).await;
        }
    }

    /// Runs one sync cycle. Errors are reported through the notification
    /// gateway before being returned.
    pub async fn sync(&mut self) -> Result<Cycle> {
        match self.cycle().await {
            Ok(cycle) => {
                tracing::info!(
                    new_games = cycle.new_games,
                    updated_games = cycle.updated_games,
                    transactions = cycle.transactions,
                    duration = ?cycle.duration,
                    "sync cycle completed"
                );
                if let Err(err) = self
                    .notifications
                    .notify_cycle(
                        self.database.as_mut(),
                        cycle.new_games,
                        cycle.updated_games,
                        cycle.duration,
                    )
                    .await
                {
                    tracing::warn!(?err, "failed to record sync stats");
                }
                Ok(cycle)
            }
            Err(err) => {
                self.notifications.notify_error(&format!("{err:#}")).await;
                Err(err)
            }
        }
    }

    async fn cycle(&mut self) -> Result<Cycle> {
        let start = Instant::now();
        let games = self.games.sync(self.database.as_mut()).await?;
        let transactions = self.transactions.ingest(self.database.as_mut()).await?;
        Ok(Cycle {
            new_games: games.inserted as u64,
            updated_games: games.updated as u64,
            transactions: transactions as u64,
            duration: start.elapsed(),
        })
    }

    /// Refreshes a single game.
    pub async fn sync_game(&mut self, game_id: u64) -> Result<()> {
        let counts = self
            .games
            .reconcile_game(self.database.as_mut(), game_id)
            .await?;
        tracing::info!(game_id, inserted = counts.inserted, "refreshed game");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::Contract,
        config,
        database::Sqlite,
        explorer::{Explorer, RawTransaction},
        notify::Transport,
        stats::{test_util::TestClock, SyncStatsAggregator},
    };
    use alloy_dyn_abi::DynSolValue;
    use alloy_primitives::Address;
    use futures::{future::BoxFuture, FutureExt};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    struct Games;

    impl Contract for Games {
        fn call<'a>(&'a self, method: &'a str, _: &'a [DynSolValue]) -> BoxFuture<'a, Result<Value>> {
            let game = json!({
                "gameId": "1",
                "gameState": "1",
                "playerAddress": "0x0101010101010101010101010101010101010101",
                "playerCommit": "0xabcd",
                "commitTimestamp": "1700000000",
            });
            let result = match method {
                "getGames" => Ok(json!([game])),
                _ => Err(anyhow::anyhow!("unexpected call")),
            };
            futures::future::ready(result).boxed()
        }
    }

    struct Transactions {
        page_size: u64,
    }

    impl Explorer for Transactions {
        fn page_size(&self) -> u64 {
            self.page_size
        }

        fn transactions(&self, _: Address, page: u64) -> BoxFuture<'_, Result<Vec<RawTransaction>>> {
            let entries = if page == 1 {
                vec![RawTransaction {
                    hash: Some("0x01".to_string()),
                    ..Default::default()
                }]
            } else {
                vec![]
            };
            futures::future::ready(Ok(entries)).boxed()
        }
    }

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<String>>>);

    impl Transport for Outbox {
        fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
            self.0.lock().unwrap().push(text.to_string());
            futures::future::ready(Ok(())).boxed()
        }
    }

    fn syncer(outbox: &Outbox, page_size: u64) -> Syncer {
        let clock = TestClock::new("2025-10-10T12:00:00Z".parse().unwrap());
        let notifications = config::Notifications {
            enabled: true,
            ..Default::default()
        };
        Syncer::new(
            Box::new(Sqlite::new_for_test()),
            GameReconciler::new(Box::new(Games), &config::Games::default()),
            TransactionIngestor::new(
                Box::new(Transactions { page_size }),
                Address::ZERO,
                "Game".to_string(),
                1,
            ),
            NotificationGateway::new(
                &notifications,
                Some(Box::new(outbox.clone())),
                SyncStatsAggregator::new(Box::new(clock), notifications.interval),
            ),
        )
    }

    #[tokio::test]
    async fn cycle_reconciles_ingests_and_reports() {
        let outbox = Outbox::default();
        let mut syncer = syncer(&outbox, 35);

        let cycle = syncer.sync().await.unwrap();
        assert_eq!(
            (cycle.new_games, cycle.updated_games, cycle.transactions),
            (1, 0, 1)
        );
        let cycle = syncer.sync().await.unwrap();
        assert_eq!(
            (cycle.new_games, cycle.updated_games, cycle.transactions),
            (0, 1, 0)
        );

        // The first cycle flushed a summary, the second one was throttled.
        assert_eq!(
            *outbox.0.lock().unwrap(),
            ["1 new games\n0 games updated\n1 syncs"]
        );
        assert_eq!(syncer.database.max_sequential_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_cycle_notifies() {
        let outbox = Outbox::default();
        let mut syncer = syncer(&outbox, 0);

        assert!(syncer.sync().await.is_err());
        let sent = outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("❌ <b>Games Sync Failed</b>"));
        assert!(sent[0].ends_with("🚨 Error: explorer page size must be positive"));
    }
}
