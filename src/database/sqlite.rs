use crate::database::{
    self, Database, FunctionSignature, Game, GameState, SyncStat, Transaction, UpsertCounts,
};
use alloy_primitives::U256;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::{collections::HashSet, env, time::Duration};
use url::Url;

pub struct Sqlite {
    connection: Connection,
}

impl Sqlite {
    pub fn new(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(SCHEMA)
            .context("create tables")?;
        Ok(Self { connection })
    }

    /// Opens the database at a `sqlite://` URL:
    ///
    /// - `sqlite://` is an in-memory database
    /// - `sqlite:///games.db` is `games.db` relative to the working directory
    /// - `sqlite:////var/lib/gamesync/games.db` is an absolute path
    ///
    /// Query parameters are passed on as SQLite URI options, see
    /// <https://www.sqlite.org/uri.html>.
    pub fn open(url: &Url) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "sqlite", "not an sqlite:// URL");
        anyhow::ensure!(
            url.has_authority() && url.authority() == "",
            "sqlite:// URL requires empty authority"
        );
        anyhow::ensure!(
            url.fragment().is_none(),
            "sqlite:// URL does not support fragments"
        );

        let Some(path) = url.path().strip_prefix('/') else {
            tracing::debug!("opening in-memory database");
            return Self::new(Connection::open_in_memory()?);
        };

        // SQLite 3 supports connection strings as file:// URLs, convert our
        // `sqlite://` to that.
        let mut file = Url::from_file_path(env::current_dir()?.join(path))
            .ok()
            .context("invalid sqlite:// URL file path")?;
        if let Some(query) = url.query() {
            file.set_query(Some(query));
        }

        tracing::debug!("opening database {file}");
        let connection = Connection::open_with_flags(
            file.as_str(),
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
        )?;

        Self::new(connection)
    }

    #[cfg(test)]
    /// Create a temporary in memory database for tests.
    pub fn new_for_test() -> Self {
        Self::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[cfg(test)]
    /// Access to the connection. Useful for tests.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn upsert_games_(&mut self, games: &[Game]) -> Result<UpsertCounts> {
        let transaction = self.connection.transaction().context("transaction")?;
        let mut counts = UpsertCounts::default();
        {
            let mut exists = transaction
                .prepare_cached(GAME_EXISTS)
                .context("prepare game_exists")?;
            let mut upsert = transaction
                .prepare_cached(UPSERT_GAME)
                .context("prepare upsert_game")?;
            let now = Utc::now().timestamp();
            for game in games {
                let game_id = i64::try_from(game.game_id).context("game_id out of bounds")?;
                let existed: bool = exists
                    .query_row((game_id,), |row| row.get(0))
                    .context("query game_exists")?;
                upsert
                    .execute(params![
                        game_id,
                        game.game_state as i64,
                        game.player_address,
                        game.player_commit,
                        game.commit_timestamp.timestamp(),
                        game.bet_amount,
                        game.house_randomness,
                        game.house_randomness_timestamp.map(|t| t.timestamp()),
                        game.player_secret,
                        game.player_card,
                        game.house_card,
                        game.reveal_timestamp.map(|t| t.timestamp()),
                        game.result().map(|r| r as i64),
                        game.total_time(),
                        now,
                    ])
                    .context("execute upsert_game")?;
                if existed {
                    counts.updated += 1;
                } else {
                    counts.inserted += 1;
                }
            }
        }
        transaction.commit().context("commit")?;
        Ok(counts)
    }

    fn game_(&self, game_id: u64) -> Result<Option<Game>> {
        let game_id = i64::try_from(game_id).context("game_id out of bounds")?;
        let mut statement = self
            .connection
            .prepare_cached(GET_GAME)
            .context("prepare_cached")?;
        let row = statement
            .query_row((game_id,), GameRow::read)
            .optional()
            .context("query_row")?;
        row.map(GameRow::into_game).transpose()
    }

    fn max_sequential_id_(&self) -> Result<u64> {
        let max: i64 = self
            .connection
            .prepare_cached(MAX_SEQUENTIAL_ID)
            .context("prepare_cached")?
            .query_row((), |row| row.get(0))
            .context("query_row")?;
        max.try_into().context("sequential_id out of bounds")
    }

    fn known_transaction_hashes_(&self, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = (1..=hashes.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT transaction_hash FROM transactions WHERE transaction_hash IN ({placeholders});"
        );
        let mut statement = self.connection.prepare_cached(&sql).context("prepare")?;
        let known = statement
            .query_map(rusqlite::params_from_iter(hashes), |row| {
                row.get::<_, String>(0)
            })
            .context("query_map")?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("read hashes")?;
        Ok(known)
    }

    fn insert_transactions_(&mut self, transactions: &[Transaction]) -> Result<usize> {
        let transaction = self.connection.transaction().context("transaction")?;
        let mut inserted = 0;
        {
            let mut insert = transaction
                .prepare_cached(INSERT_TRANSACTION)
                .context("prepare insert_transaction")?;
            let now = Utc::now().timestamp();
            for tx in transactions {
                inserted += insert
                    .execute(params![
                        tx.transaction_hash,
                        i64::try_from(tx.sequential_id).context("sequential_id out of bounds")?,
                        tx.method,
                        tx.function_signature_id,
                        tx.from_address,
                        tx.to_address,
                        tx.value,
                        tx.fee,
                        tx.gas_used,
                        tx.gas_price,
                        tx.status,
                        i64::try_from(tx.confirmations).context("confirmations out of bounds")?,
                        i64::try_from(tx.block_number).context("block_number out of bounds")?,
                        tx.timestamp.timestamp(),
                        tx.raw_input,
                        tx.decoded_input,
                        now,
                    ])
                    .context("execute insert_transaction")?;
            }
        }
        transaction.commit().context("commit")?;
        Ok(inserted)
    }

    fn average_fee_(&self, methods: &[&str]) -> Result<Option<U256>> {
        if methods.is_empty() {
            return Ok(None);
        }
        let placeholders = (1..=methods.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT fee FROM transactions WHERE method IN ({placeholders});");
        let mut statement = self.connection.prepare_cached(&sql).context("prepare")?;
        let fees = statement
            .query_map(rusqlite::params_from_iter(methods), |row| {
                row.get::<_, String>(0)
            })
            .context("query_map")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read fees")?;
        database::mean_wei(fees)
    }

    fn replace_signatures_(
        &mut self,
        contract_name: &str,
        signatures: &[FunctionSignature],
    ) -> Result<()> {
        let transaction = self.connection.transaction().context("transaction")?;
        transaction
            .execute(DETACH_SIGNATURES, (contract_name,))
            .context("execute detach_signatures")?;
        transaction
            .execute(DELETE_SIGNATURES, (contract_name,))
            .context("execute delete_signatures")?;
        {
            let mut insert = transaction
                .prepare_cached(INSERT_SIGNATURE)
                .context("prepare insert_signature")?;
            for signature in signatures {
                insert
                    .execute((
                        contract_name,
                        &signature.name,
                        &signature.signature_str,
                        &signature.signature_hex,
                    ))
                    .context("execute insert_signature")?;
            }
        }
        transaction.commit().context("commit")
    }

    fn find_signature_(
        &self,
        signature_hex: &str,
        contract_name: Option<&str>,
    ) -> Result<Option<FunctionSignature>> {
        let read = |row: &Row| -> rusqlite::Result<FunctionSignature> {
            Ok(FunctionSignature {
                id: Some(row.get(0)?),
                contract_name: row.get(1)?,
                name: row.get(2)?,
                signature_str: row.get(3)?,
                signature_hex: row.get(4)?,
            })
        };
        let signature = match contract_name {
            Some(contract_name) => self
                .connection
                .prepare_cached(FIND_CONTRACT_SIGNATURE)
                .context("prepare_cached")?
                .query_row((signature_hex, contract_name), read),
            None => self
                .connection
                .prepare_cached(FIND_SIGNATURE)
                .context("prepare_cached")?
                .query_row((signature_hex,), read),
        };
        signature.optional().context("query_row")
    }

    fn record_sync_stat_(
        &mut self,
        bucket: &str,
        stat: &SyncStat,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = stat.timestamp.timestamp_millis();
        let window_start = (stat.timestamp - chrono::Duration::hours(24)).timestamp_millis();
        let transaction = self.connection.transaction().context("transaction")?;
        transaction
            .execute(DELETE_EXPIRED_STATS, (now,))
            .context("execute delete_expired_stats")?;
        transaction
            .execute(DELETE_EXPIRED_BUCKETS, (now,))
            .context("execute delete_expired_buckets")?;
        transaction
            .execute(UPSERT_BUCKET, (bucket, expires_at.timestamp_millis()))
            .context("execute upsert_bucket")?;
        transaction
            .execute(TRIM_BUCKET, (bucket, window_start))
            .context("execute trim_bucket")?;
        transaction
            .execute(
                INSERT_STAT,
                (
                    bucket,
                    now,
                    i64::try_from(stat.new_games).context("new_games out of bounds")?,
                    i64::try_from(stat.updated_games).context("updated_games out of bounds")?,
                    i64::try_from(stat.duration.as_millis()).context("duration out of bounds")?,
                ),
            )
            .context("execute insert_stat")?;
        transaction.commit().context("commit")
    }

    fn sync_stats_(&self, bucket: &str, now: DateTime<Utc>) -> Result<Vec<SyncStat>> {
        let mut statement = self
            .connection
            .prepare_cached(GET_STATS)
            .context("prepare_cached")?;
        let rows = statement
            .query_map((bucket, now.timestamp_millis()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .context("query_map")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read stats")?;
        rows.into_iter()
            .map(|(timestamp, new_games, updated_games, duration)| {
                Ok::<_, anyhow::Error>(SyncStat {
                    timestamp: database::timestamp_millis(timestamp)?,
                    new_games: new_games.try_into().context("new_games out of bounds")?,
                    updated_games: updated_games
                        .try_into()
                        .context("updated_games out of bounds")?,
                    duration: Duration::from_millis(
                        duration.try_into().context("duration out of bounds")?,
                    ),
                })
            })
            .collect()
    }

    fn last_flush_(&self) -> Result<Option<DateTime<Utc>>> {
        let at: Option<i64> = self
            .connection
            .prepare_cached(GET_LAST_FLUSH)
            .context("prepare_cached")?
            .query_row((), |row| row.get(0))
            .optional()
            .context("query_row")?;
        at.map(database::timestamp_millis).transpose()
    }

    fn set_last_flush_(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.connection
            .execute(SET_LAST_FLUSH, (at.timestamp_millis(),))
            .context("execute set_last_flush")?;
        Ok(())
    }
}

// The rusqlite connection is blocking, so each method does its work up front
// and returns an already completed future.
impl Database for Sqlite {
    fn upsert_games<'a>(&'a mut self, games: &'a [Game]) -> BoxFuture<'a, Result<UpsertCounts>> {
        future::ready(self.upsert_games_(games)).boxed()
    }

    fn game(&mut self, game_id: u64) -> BoxFuture<'_, Result<Option<Game>>> {
        future::ready(self.game_(game_id)).boxed()
    }

    fn max_sequential_id(&mut self) -> BoxFuture<'_, Result<u64>> {
        future::ready(self.max_sequential_id_()).boxed()
    }

    fn known_transaction_hashes<'a>(
        &'a mut self,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<HashSet<String>>> {
        future::ready(self.known_transaction_hashes_(hashes)).boxed()
    }

    fn insert_transactions<'a>(
        &'a mut self,
        transactions: &'a [Transaction],
    ) -> BoxFuture<'a, Result<usize>> {
        future::ready(self.insert_transactions_(transactions)).boxed()
    }

    fn average_fee<'a>(&'a mut self, methods: &'a [&'a str]) -> BoxFuture<'a, Result<Option<U256>>> {
        future::ready(self.average_fee_(methods)).boxed()
    }

    fn replace_signatures<'a>(
        &'a mut self,
        contract_name: &'a str,
        signatures: &'a [FunctionSignature],
    ) -> BoxFuture<'a, Result<()>> {
        future::ready(self.replace_signatures_(contract_name, signatures)).boxed()
    }

    fn find_signature<'a>(
        &'a mut self,
        signature_hex: &'a str,
        contract_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<FunctionSignature>>> {
        future::ready(self.find_signature_(signature_hex, contract_name)).boxed()
    }

    fn record_sync_stat<'a>(
        &'a mut self,
        bucket: &'a str,
        stat: &'a SyncStat,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        future::ready(self.record_sync_stat_(bucket, stat, expires_at)).boxed()
    }

    fn sync_stats<'a>(
        &'a mut self,
        bucket: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<SyncStat>>> {
        future::ready(self.sync_stats_(bucket, now)).boxed()
    }

    fn last_flush(&mut self) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>> {
        future::ready(self.last_flush_()).boxed()
    }

    fn set_last_flush(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        future::ready(self.set_last_flush_(at)).boxed()
    }
}

/// Raw column values of a `games` row.
struct GameRow {
    game_id: i64,
    game_state: i64,
    player_address: String,
    player_commit: String,
    commit_timestamp: i64,
    bet_amount: Option<String>,
    house_randomness: Option<String>,
    house_randomness_timestamp: Option<i64>,
    player_secret: Option<String>,
    player_card: Option<String>,
    house_card: Option<String>,
    reveal_timestamp: Option<i64>,
}

impl GameRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            game_id: row.get(0)?,
            game_state: row.get(1)?,
            player_address: row.get(2)?,
            player_commit: row.get(3)?,
            commit_timestamp: row.get(4)?,
            bet_amount: row.get(5)?,
            house_randomness: row.get(6)?,
            house_randomness_timestamp: row.get(7)?,
            player_secret: row.get(8)?,
            player_card: row.get(9)?,
            house_card: row.get(10)?,
            reveal_timestamp: row.get(11)?,
        })
    }

    fn into_game(self) -> Result<Game> {
        Ok(Game {
            game_id: self.game_id.try_into().context("game_id out of bounds")?,
            game_state: u64::try_from(self.game_state)
                .ok()
                .and_then(GameState::from_index)
                .context("invalid game_state")?,
            player_address: self.player_address,
            player_commit: self.player_commit,
            commit_timestamp: database::timestamp(self.commit_timestamp)?,
            bet_amount: self.bet_amount,
            house_randomness: self.house_randomness,
            house_randomness_timestamp: self
                .house_randomness_timestamp
                .map(database::timestamp)
                .transpose()?,
            player_secret: self.player_secret,
            player_card: self.player_card,
            house_card: self.house_card,
            reveal_timestamp: self.reveal_timestamp.map(database::timestamp).transpose()?,
        })
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    game_id INTEGER PRIMARY KEY NOT NULL,
    game_state INTEGER NOT NULL,
    player_address TEXT NOT NULL,
    player_commit TEXT NOT NULL,
    commit_timestamp INTEGER NOT NULL,
    bet_amount TEXT,
    house_randomness TEXT,
    house_randomness_timestamp INTEGER,
    player_secret TEXT,
    player_card TEXT,
    house_card TEXT,
    reveal_timestamp INTEGER,
    result INTEGER,
    total_time INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS games_commit_timestamp ON games (commit_timestamp);
CREATE INDEX IF NOT EXISTS games_player_address ON games (player_address);
CREATE INDEX IF NOT EXISTS games_result ON games (result);

CREATE TABLE IF NOT EXISTS function_signatures (
    id INTEGER PRIMARY KEY,
    contract_name TEXT NOT NULL,
    name TEXT NOT NULL,
    signature_str TEXT NOT NULL,
    signature_hex TEXT NOT NULL,
    UNIQUE (contract_name, signature_hex)
) STRICT;
CREATE INDEX IF NOT EXISTS function_signatures_hex ON function_signatures (signature_hex);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    transaction_hash TEXT NOT NULL UNIQUE,
    sequential_id INTEGER NOT NULL UNIQUE,
    method TEXT NOT NULL,
    function_signature_id INTEGER REFERENCES function_signatures (id),
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    value TEXT NOT NULL,
    fee TEXT NOT NULL,
    gas_used TEXT NOT NULL,
    gas_price TEXT NOT NULL,
    status TEXT NOT NULL,
    confirmations INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    raw_input TEXT NOT NULL,
    decoded_input TEXT,
    created_at INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS transactions_method_timestamp ON transactions (method, timestamp);
CREATE INDEX IF NOT EXISTS transactions_block_number ON transactions (block_number);

CREATE TABLE IF NOT EXISTS _sync_stat_bucket (
    bucket TEXT PRIMARY KEY NOT NULL,
    expires_at INTEGER NOT NULL
) STRICT;
CREATE TABLE IF NOT EXISTS _sync_stat (
    bucket TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    new_games INTEGER NOT NULL,
    updated_games INTEGER NOT NULL,
    duration INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS _sync_stat_bucket_timestamp ON _sync_stat (bucket, timestamp);

CREATE TABLE IF NOT EXISTS _last_flush (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    at INTEGER NOT NULL
) STRICT;
";

const GAME_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM games WHERE game_id = ?1);";
const UPSERT_GAME: &str = "INSERT INTO games (game_id, game_state, player_address, player_commit, commit_timestamp, bet_amount, house_randomness, house_randomness_timestamp, player_secret, player_card, house_card, reveal_timestamp, result, total_time, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15) ON CONFLICT (game_id) DO UPDATE SET game_state = excluded.game_state, player_address = excluded.player_address, player_commit = excluded.player_commit, commit_timestamp = excluded.commit_timestamp, bet_amount = excluded.bet_amount, house_randomness = excluded.house_randomness, house_randomness_timestamp = excluded.house_randomness_timestamp, player_secret = excluded.player_secret, player_card = excluded.player_card, house_card = excluded.house_card, reveal_timestamp = excluded.reveal_timestamp, result = excluded.result, total_time = excluded.total_time, updated_at = excluded.updated_at;";
const GET_GAME: &str = "SELECT game_id, game_state, player_address, player_commit, commit_timestamp, bet_amount, house_randomness, house_randomness_timestamp, player_secret, player_card, house_card, reveal_timestamp FROM games WHERE game_id = ?1;";

const MAX_SEQUENTIAL_ID: &str = "SELECT COALESCE(MAX(sequential_id), 0) FROM transactions;";
const INSERT_TRANSACTION: &str = "INSERT INTO transactions (transaction_hash, sequential_id, method, function_signature_id, from_address, to_address, value, fee, gas_used, gas_price, status, confirmations, block_number, timestamp, raw_input, decoded_input, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) ON CONFLICT DO NOTHING;";

const DETACH_SIGNATURES: &str = "UPDATE transactions SET function_signature_id = NULL WHERE function_signature_id IN (SELECT id FROM function_signatures WHERE contract_name = ?1);";
const DELETE_SIGNATURES: &str = "DELETE FROM function_signatures WHERE contract_name = ?1;";
const INSERT_SIGNATURE: &str = "INSERT INTO function_signatures (contract_name, name, signature_str, signature_hex) VALUES (?1, ?2, ?3, ?4) ON CONFLICT (contract_name, signature_hex) DO NOTHING;";
const FIND_CONTRACT_SIGNATURE: &str = "SELECT id, contract_name, name, signature_str, signature_hex FROM function_signatures WHERE signature_hex = ?1 AND contract_name = ?2;";
const FIND_SIGNATURE: &str = "SELECT id, contract_name, name, signature_str, signature_hex FROM function_signatures WHERE signature_hex = ?1 ORDER BY id LIMIT 1;";

const DELETE_EXPIRED_STATS: &str = "DELETE FROM _sync_stat WHERE bucket IN (SELECT bucket FROM _sync_stat_bucket WHERE expires_at <= ?1);";
const DELETE_EXPIRED_BUCKETS: &str = "DELETE FROM _sync_stat_bucket WHERE expires_at <= ?1;";
const UPSERT_BUCKET: &str = "INSERT INTO _sync_stat_bucket (bucket, expires_at) VALUES (?1, ?2) ON CONFLICT (bucket) DO UPDATE SET expires_at = excluded.expires_at;";
const TRIM_BUCKET: &str = "DELETE FROM _sync_stat WHERE bucket = ?1 AND timestamp <= ?2;";
const INSERT_STAT: &str = "INSERT INTO _sync_stat (bucket, timestamp, new_games, updated_games, duration) VALUES (?1, ?2, ?3, ?4, ?5);";
const GET_STATS: &str = "SELECT s.timestamp, s.new_games, s.updated_games, s.duration FROM _sync_stat s JOIN _sync_stat_bucket b ON b.bucket = s.bucket WHERE s.bucket = ?1 AND b.expires_at > ?2 ORDER BY s.timestamp ASC;";

const GET_LAST_FLUSH: &str = "SELECT at FROM _last_flush WHERE id = 0;";
const SET_LAST_FLUSH: &str = "INSERT INTO _last_flush (id, at) VALUES (0, ?1) ON CONFLICT (id) DO UPDATE SET at = excluded.at;";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::GameResult;

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn game(game_id: u64) -> Game {
        Game {
            game_id,
            game_state: GameState::PlayerCommitted,
            player_address: "0x0101010101010101010101010101010101010101".to_string(),
            player_commit: format!("0x{:064x}", game_id),
            commit_timestamp: ts(1_700_000_000),
            bet_amount: Some("1000000000000000000".to_string()),
            house_randomness: None,
            house_randomness_timestamp: None,
            player_secret: None,
            player_card: None,
            house_card: None,
            reveal_timestamp: None,
        }
    }

    fn transaction(sequential_id: u64, hash: &str, method: &str, fee: &str) -> Transaction {
        Transaction {
            sequential_id,
            transaction_hash: hash.to_string(),
            method: method.to_string(),
            from_address: "0x0101010101010101010101010101010101010101".to_string(),
            to_address: "0x0202020202020202020202020202020202020202".to_string(),
            value: "0".to_string(),
            fee: fee.to_string(),
            gas_used: "21000".to_string(),
            gas_price: "1000000000".to_string(),
            status: "success".to_string(),
            block_number: 1,
            confirmations: 10,
            timestamp: ts(1_700_000_000),
            raw_input: "0x".to_string(),
            decoded_input: None,
            function_signature_id: None,
        }
    }

    fn count(sqlite: &Sqlite, table: &str) -> i64 {
        sqlite
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), (), |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn open_in_memory() {
        Sqlite::open(&"sqlite://".parse().unwrap()).unwrap();
        assert!(Sqlite::open(&"sqlite://host/foo.db".parse().unwrap()).is_err());
        assert!(Sqlite::open(&"postgres://localhost".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn upsert_games_counts_and_overwrites() {
        let mut sqlite = Sqlite::new_for_test();

        let counts = sqlite.upsert_games(&[game(1), game(2)]).await.unwrap();
        assert_eq!(
            counts,
            UpsertCounts {
                inserted: 2,
                updated: 0
            }
        );

        let mut revealed = game(1);
        revealed.game_state = GameState::Revealed;
        revealed.player_card = Some("5".to_string());
        revealed.house_card = Some("3".to_string());
        revealed.reveal_timestamp = Some(ts(1_700_000_042));
        let counts = sqlite
            .upsert_games(&[revealed.clone(), game(3)])
            .await
            .unwrap();
        assert_eq!(
            counts,
            UpsertCounts {
                inserted: 1,
                updated: 1
            }
        );

        assert_eq!(count(&sqlite, "games"), 3);
        assert_eq!(sqlite.game(1).await.unwrap(), Some(revealed));
        assert_eq!(sqlite.game(4).await.unwrap(), None);

        let (result, total_time): (i64, i64) = sqlite
            .connection()
            .query_row(
                "SELECT result, total_time FROM games WHERE game_id = 1",
                (),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(result, GameResult::PlayerWon as i64);
        assert_eq!(total_time, 42);
    }

    #[tokio::test]
    async fn transactions_are_insert_only() {
        let mut sqlite = Sqlite::new_for_test();
        assert_eq!(sqlite.max_sequential_id().await.unwrap(), 0);

        let inserted = sqlite
            .insert_transactions(&[
                transaction(1, "0xa", "commit", "10"),
                transaction(2, "0xb", "reveal", "20"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(sqlite.max_sequential_id().await.unwrap(), 2);

        // Same hash with a new ID and a new hash with a taken ID are both
        // skipped, the stored row is untouched.
        let inserted = sqlite
            .insert_transactions(&[
                transaction(3, "0xa", "other", "99"),
                transaction(2, "0xc", "other", "99"),
                transaction(3, "0xd", "multiPostRandomness", "30"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(count(&sqlite, "transactions"), 3);

        let method: String = sqlite
            .connection()
            .query_row(
                "SELECT method FROM transactions WHERE transaction_hash = '0xa'",
                (),
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(method, "commit");
    }

    #[tokio::test]
    async fn known_transaction_hashes() {
        let mut sqlite = Sqlite::new_for_test();
        sqlite
            .insert_transactions(&[
                transaction(1, "0xa", "commit", "10"),
                transaction(2, "0xb", "reveal", "20"),
            ])
            .await
            .unwrap();

        let hashes = ["0xb", "0xc", "0xa"].map(String::from);
        let known = sqlite.known_transaction_hashes(&hashes).await.unwrap();
        assert_eq!(known, HashSet::from(["0xa".to_string(), "0xb".to_string()]));
        assert!(sqlite.known_transaction_hashes(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn average_fee() {
        let mut sqlite = Sqlite::new_for_test();
        sqlite
            .insert_transactions(&[
                transaction(1, "0xa", "commit", "10"),
                transaction(2, "0xb", "reveal", "21"),
                transaction(3, "0xc", "multiPostRandomness", "1000000000000000000000"),
            ])
            .await
            .unwrap();

        assert_eq!(
            sqlite.average_fee(&["commit", "reveal"]).await.unwrap(),
            Some(U256::from(15))
        );
        assert_eq!(
            sqlite.average_fee(&["multiPostRandomness"]).await.unwrap(),
            Some(U256::from(1_000_000_000_000_000_000_000_u128))
        );
        assert_eq!(sqlite.average_fee(&["unknown"]).await.unwrap(), None);
        assert_eq!(sqlite.average_fee(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn signatures() {
        let mut sqlite = Sqlite::new_for_test();
        let signature = |contract: &str, name: &str, hex: &str| FunctionSignature {
            id: None,
            contract_name: contract.to_string(),
            name: name.to_string(),
            signature_str: format!("{name}()"),
            signature_hex: hex.to_string(),
        };

        sqlite
            .replace_signatures("A", &[signature("A", "foo", "0x01"), signature("A", "bar", "0x02")])
            .await
            .unwrap();
        sqlite
            .replace_signatures("B", &[signature("B", "baz", "0x01")])
            .await
            .unwrap();

        let found = sqlite.find_signature("0x01", Some("B")).await.unwrap().unwrap();
        assert_eq!(found.name, "baz");
        let found = sqlite.find_signature("0x01", None).await.unwrap().unwrap();
        assert_eq!(found.name, "foo");
        assert!(sqlite.find_signature("0x02", Some("B")).await.unwrap().is_none());

        let mut tx = transaction(1, "0xa", "foo", "1");
        tx.function_signature_id = sqlite
            .find_signature("0x01", Some("A"))
            .await
            .unwrap()
            .unwrap()
            .id;
        sqlite.insert_transactions(&[tx]).await.unwrap();

        // Replacing removes stale entries and detaches transactions.
        sqlite
            .replace_signatures("A", &[signature("A", "qux", "0x03")])
            .await
            .unwrap();
        assert!(sqlite.find_signature("0x01", Some("A")).await.unwrap().is_none());
        assert_eq!(count(&sqlite, "function_signatures"), 2);
        let detached: Option<i64> = sqlite
            .connection()
            .query_row(
                "SELECT function_signature_id FROM transactions",
                (),
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(detached, None);
    }

    #[tokio::test]
    async fn sync_stats_expire() {
        let mut sqlite = Sqlite::new_for_test();
        let stat = |seconds: i64, new_games: u64| SyncStat {
            timestamp: ts(seconds),
            new_games,
            updated_games: 0,
            duration: Duration::from_millis(1500),
        };

        let hour = 3600;
        sqlite
            .record_sync_stat("h0", &stat(0, 1), ts(25 * hour))
            .await
            .unwrap();
        sqlite
            .record_sync_stat("h0", &stat(60, 2), ts(25 * hour + 60))
            .await
            .unwrap();

        let stats = sqlite.sync_stats("h0", ts(hour)).await.unwrap();
        assert_eq!(stats, vec![stat(0, 1), stat(60, 2)]);
        assert!(sqlite.sync_stats("h1", ts(hour)).await.unwrap().is_empty());

        // Expired buckets are no longer visible, and are removed on the next
        // write.
        assert!(sqlite.sync_stats("h0", ts(26 * hour)).await.unwrap().is_empty());
        sqlite
            .record_sync_stat("h26", &stat(26 * hour, 3), ts(51 * hour))
            .await
            .unwrap();
        assert_eq!(count(&sqlite, "_sync_stat"), 1);
        assert_eq!(count(&sqlite, "_sync_stat_bucket"), 1);
    }

    #[tokio::test]
    async fn last_flush() {
        let mut sqlite = Sqlite::new_for_test();
        assert_eq!(sqlite.last_flush().await.unwrap(), None);
        sqlite.set_last_flush(ts(10)).await.unwrap();
        sqlite.set_last_flush(ts(20)).await.unwrap();
        assert_eq!(sqlite.last_flush().await.unwrap(), Some(ts(20)));
    }
}
