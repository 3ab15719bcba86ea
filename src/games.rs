//! Mirroring of on-chain games into the database.

use crate::{
    chain::Contract,
    config,
    database::{Database, Game, GameResult, GameState, UpsertCounts},
};
use alloy_dyn_abi::DynSolValue;
use alloy_primitives::U256;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

impl Game {
    /// The outcome of a game, once both cards are known. Cards are compared
    /// by numeric magnitude; a card that is not a decimal integer makes the
    /// outcome `Error`.
    pub fn result(&self) -> Option<GameResult> {
        let player = self.player_card.as_deref().filter(|card| !card.is_empty())?;
        let house = self.house_card.as_deref().filter(|card| !card.is_empty())?;
        let (Ok(player), Ok(house)) = (
            U256::from_str_radix(player, 10),
            U256::from_str_radix(house, 10),
        ) else {
            return Some(GameResult::Error);
        };
        Some(match player.cmp(&house) {
            Ordering::Greater => GameResult::PlayerWon,
            Ordering::Less => GameResult::HouseWon,
            Ordering::Equal => GameResult::Tie,
        })
    }

    /// Seconds from commit to reveal.
    pub fn total_time(&self) -> Option<i64> {
        let reveal = self.reveal_timestamp?;
        Some((reveal - self.commit_timestamp).num_seconds())
    }
}

/// Reconciles the local game table against the contract. The chain is
/// authoritative: every fetched game overwrites its stored row.
pub struct GameReconciler {
    contract: Box<dyn Contract>,
    page_size: u64,
    descending: bool,
    id_field: String,
}

impl GameReconciler {
    pub fn new(contract: Box<dyn Contract>, config: &config::Games) -> Self {
        Self {
            contract,
            page_size: config.page_size,
            descending: config.descending,
            id_field: config.id_field.clone(),
        }
    }

    /// Fetches the latest page of games and reconciles it. Failing to fetch
    /// the page is logged and reconciles nothing.
    pub async fn sync(&self, db: &mut dyn Database) -> Result<UpsertCounts> {
        let records = match self.fetch_page(0).await {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(?err, "failed to fetch games");
                return Ok(UpsertCounts::default());
            }
        };
        self.reconcile_page(db, &records).await
    }

    async fn fetch_page(&self, offset: u64) -> Result<Vec<Value>> {
        let args = [
            DynSolValue::from(U256::from(offset)),
            DynSolValue::from(U256::from(self.page_size)),
            DynSolValue::Bool(self.descending),
        ];
        let games = self.contract.call("getGames", &args).await?;
        let Value::Array(records) = games else {
            anyhow::bail!("getGames did not return a list");
        };
        tracing::debug!(offset, fetched = records.len(), "fetched games");
        Ok(records)
    }

    /// Refreshes a single game from `games(id)`.
    pub async fn reconcile_game(
        &self,
        db: &mut dyn Database,
        game_id: u64,
    ) -> Result<UpsertCounts> {
        let mut record = self
            .contract
            .call("games", &[DynSolValue::from(U256::from(game_id))])
            .await
            .with_context(|| format!("fetch game {game_id}"))?;
        let fields = record
            .as_object_mut()
            .context("games did not return named fields")?;
        fields.insert(self.id_field.clone(), Value::String(game_id.to_string()));
        self.reconcile_page(db, &[record]).await
    }

    /// Upserts a page of chain records. Malformed records are logged and
    /// skipped.
    pub async fn reconcile_page(
        &self,
        db: &mut dyn Database,
        records: &[Value],
    ) -> Result<UpsertCounts> {
        let games = records
            .iter()
            .filter_map(|record| match game_from_record(record, &self.id_field) {
                Ok(game) => Some(game),
                Err(err) => {
                    tracing::warn!(?err, %record, "skipping malformed game");
                    None
                }
            })
            .collect::<Vec<_>>();

        let counts = db.upsert_games(&games).await.context("upsert games")?;
        tracing::info!(
            fetched = records.len(),
            inserted = counts.inserted,
            updated = counts.updated,
            "reconciled games"
        );
        Ok(counts)
    }
}

/// Normalizes a chain record, keyed by the contract's field names, into a
/// game. Settlement fields a game has not reached yet are reported by the
/// chain as zero values and are left unset.
pub fn game_from_record(record: &Value, id_field: &str) -> Result<Game> {
    let required = |key: &str| field(record, key).with_context(|| format!("missing {key}"));

    let game_id = uint(required(id_field)?)
        .and_then(|id| u64::try_from(id).ok())
        .with_context(|| format!("invalid {id_field}"))?;
    let game_state = uint(required("gameState")?)
        .and_then(|state| u64::try_from(state).ok())
        .and_then(GameState::from_index)
        .context("invalid gameState")?;
    let player_address = text(required("playerAddress")?).context("invalid playerAddress")?;
    let player_commit = text(required("playerCommit")?).context("invalid playerCommit")?;
    let commit_timestamp = uint(required("commitTimestamp")?)
        .and_then(timestamp)
        .context("invalid commitTimestamp")?;

    let settled = game_state == GameState::Revealed;
    let settlement = |key: &str| {
        field(record, key)
            .and_then(text)
            .filter(|value| settled || !is_zero(value))
    };
    let optional_timestamp = |key: &str| {
        field(record, key)
            .and_then(uint)
            .filter(|seconds| !seconds.is_zero())
            .and_then(timestamp)
    };

    Ok(Game {
        game_id,
        game_state,
        player_address,
        player_commit,
        commit_timestamp,
        bet_amount: field(record, "betAmount").and_then(text),
        house_randomness: settlement("houseRandomness"),
        house_randomness_timestamp: optional_timestamp("houseRandomnessTimestamp"),
        player_secret: settlement("playerSecret"),
        player_card: settlement("playerCard"),
        house_card: settlement("houseCard"),
        reveal_timestamp: optional_timestamp("revealTimestamp"),
    })
}

fn field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    record.get(key).filter(|value| !value.is_null())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn uint(value: &Value) -> Option<U256> {
    match value {
        Value::String(value) => match value.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_str_radix(value, 10).ok(),
        },
        Value::Number(value) => value.as_u64().map(U256::from),
        _ => None,
    }
}

fn timestamp(seconds: U256) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(seconds).ok()?, 0)
}

/// Zero integers and all-zero hex strings.
fn is_zero(value: &str) -> bool {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    digits.chars().all(|c| c == '0')
}
