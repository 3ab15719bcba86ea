mod postgres;
mod sqlite;

pub use self::{postgres::Postgres, sqlite::Sqlite};
use alloy_primitives::U256;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::{collections::HashSet, time::Duration};
use url::Url;

/// On-chain lifecycle of a game. Advances monotonically on chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GameState {
    NotStarted = 0,
    PlayerCommitted = 1,
    HashPosted = 2,
    Revealed = 3,
    Forfeited = 4,
}

/// Locally derived outcome of a game.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GameResult {
    Error = 0,
    PlayerWon = 1,
    HouseWon = 2,
    Tie = 3,
}

/// A game as mirrored from the contract.
///
/// The derived `result` and `total_time` are not fields: they are computed
/// from the other fields whenever they are needed (see the `games` module),
/// and written next to the source fields when a game is stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Game {
    pub game_id: u64,
    pub game_state: GameState,
    pub player_address: String,
    pub player_commit: String,
    pub commit_timestamp: DateTime<Utc>,
    pub bet_amount: Option<String>,
    pub house_randomness: Option<String>,
    pub house_randomness_timestamp: Option<DateTime<Utc>>,
    pub player_secret: Option<String>,
    pub player_card: Option<String>,
    pub house_card: Option<String>,
    pub reveal_timestamp: Option<DateTime<Utc>>,
}

/// The outcome of upserting a batch of games.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// A contract transaction. Immutable once stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub sequential_id: u64,
    pub transaction_hash: String,
    pub method: String,
    pub from_address: String,
    pub to_address: String,
    /// Wei, as a decimal string.
    pub value: String,
    /// Wei, as a decimal string.
    pub fee: String,
    pub gas_used: String,
    pub gas_price: String,
    pub status: String,
    pub block_number: u64,
    pub confirmations: u64,
    pub timestamp: DateTime<Utc>,
    pub raw_input: String,
    pub decoded_input: Option<String>,
    pub function_signature_id: Option<i64>,
}

/// A function selector registry entry. `id` is assigned by the database.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionSignature {
    pub id: Option<i64>,
    pub contract_name: String,
    pub name: String,
    pub signature_str: String,
    pub signature_hex: String,
}

/// Statistics for a single sync cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncStat {
    pub timestamp: DateTime<Utc>,
    pub new_games: u64,
    pub updated_games: u64,
    pub duration: Duration,
}

/// Abstraction over the SQL backends.
///
/// All methods either succeed in full or error without having applied any
/// changes. This is accomplished by using SQL transactions.
pub trait Database: Send {
    /// Inserts games that don't exist yet and overwrites all fields of the
    /// ones that do, keyed by `game_id`.
    fn upsert_games<'a>(&'a mut self, games: &'a [Game]) -> BoxFuture<'a, Result<UpsertCounts>>;

    /// Reads a single game.
    fn game(&mut self, game_id: u64) -> BoxFuture<'_, Result<Option<Game>>>;

    /// Returns the highest stored transaction sequential ID, or 0 if there
    /// are no transactions.
    fn max_sequential_id(&mut self) -> BoxFuture<'_, Result<u64>>;

    /// The subset of `hashes` that is already stored.
    fn known_transaction_hashes<'a>(
        &'a mut self,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<HashSet<String>>>;

    /// Inserts new transactions, skipping any that conflict with an already
    /// stored transaction hash or sequential ID. Returns the number of rows
    /// inserted.
    fn insert_transactions<'a>(
        &'a mut self,
        transactions: &'a [Transaction],
    ) -> BoxFuture<'a, Result<usize>>;

    /// Computes the mean fee in wei of transactions calling one of `methods`.
    fn average_fee<'a>(&'a mut self, methods: &'a [&'a str]) -> BoxFuture<'a, Result<Option<U256>>>;

    /// Replaces all signatures of a contract. Transactions referencing a
    /// removed signature are detached from it.
    fn replace_signatures<'a>(
        &'a mut self,
        contract_name: &'a str,
        signatures: &'a [FunctionSignature],
    ) -> BoxFuture<'a, Result<()>>;

    /// Looks up a signature by selector, within `contract_name` if specified.
    fn find_signature<'a>(
        &'a mut self,
        signature_hex: &'a str,
        contract_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<FunctionSignature>>>;

    /// Appends a stat to an hourly bucket and sets the bucket's expiry.
    /// Expired buckets are dropped.
    fn record_sync_stat<'a>(
        &'a mut self,
        bucket: &'a str,
        stat: &'a SyncStat,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Reads the stats of a bucket, empty if it doesn't exist or expired.
    fn sync_stats<'a>(
        &'a mut self,
        bucket: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<SyncStat>>>;

    fn last_flush(&mut self) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>>;

    fn set_last_flush(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, Result<()>>;
}

/// Opens a database backend for the specified URL. Supported schemes are
/// `sqlite://` and `postgresql://` (or `postgres://`).
pub async fn open(url: &Url) -> Result<Box<dyn Database>> {
    match url.scheme() {
        "sqlite" => Ok(Box::new(Sqlite::open(url)?)),
        "postgres" | "postgresql" => Ok(Box::new(Postgres::connect(url.as_str()).await?)),
        scheme => anyhow::bail!("unsupported database scheme {scheme}"),
    }
}

impl GameState {
    pub fn from_index(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::NotStarted,
            1 => Self::PlayerCommitted,
            2 => Self::HashPosted,
            3 => Self::Revealed,
            4 => Self::Forfeited,
            _ => return None,
        })
    }
}

/// Epoch seconds to a UTC timestamp.
fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).context("timestamp out of range")
}

fn timestamp_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).context("timestamp out of range")
}

/// Mean of wei amounts stored as decimal strings, rounded down.
fn mean_wei<I, S>(fees: I) -> Result<Option<U256>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let (mut sum, mut count) = (U256::ZERO, 0_u64);
    for fee in fees {
        let fee = fee.as_ref();
        let fee = U256::from_str_radix(fee, 10).with_context(|| format!("invalid fee {fee}"))?;
        sum = sum.checked_add(fee).context("fee sum overflow")?;
        count += 1;
    }
    Ok((count > 0).then(|| sum / U256::from(count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_wei_is_exact() {
        assert_eq!(mean_wei::<_, &str>([]).unwrap(), None);
        assert_eq!(
            mean_wei(["21000000000000", "21000000000002"]).unwrap(),
            Some(U256::from(21_000_000_000_001_u64))
        );
        assert_eq!(
            mean_wei(["340282366920938463463374607431768211456", "0"]).unwrap(),
            Some(U256::from(1_u64) << 127)
        );
        assert!(mean_wei(["1.5"]).is_err());
    }

    #[test]
    fn game_state_indices() {
        assert_eq!(GameState::from_index(3), Some(GameState::Revealed));
        assert_eq!(GameState::from_index(5), None);
        assert_eq!(GameState::Forfeited as i64, 4);
    }
}
