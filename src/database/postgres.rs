use {
    crate::database::{
        self, Database, FunctionSignature, Game, GameState, SyncStat, Transaction, UpsertCounts,
    },
    alloy_primitives::U256,
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    futures::{future::BoxFuture, FutureExt},
    std::{collections::HashSet, time::Duration},
    tokio_postgres::Row,
};

pub struct Postgres {
    client: tokio_postgres::Client,
}

impl Postgres {
    pub async fn connect(params: &str) -> Result<Self> {
        tracing::debug!("opening postgres database");
        let (client, connection) = tokio_postgres::connect(params, tokio_postgres::NoTls)
            .await
            .context("connect client")?;

        // The connection object performs the actual communication with the database,
        // so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(?err, "postgres connection error");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .context("create tables")?;

        for sql in [UPSERT_GAME, INSERT_TRANSACTION, FIND_SIGNATURE, INSERT_STAT] {
            client
                .prepare(sql)
                .await
                .with_context(|| format!("prepare {sql}"))?;
        }

        Ok(Self { client })
    }
}

impl Database for Postgres {
    fn upsert_games<'a>(&'a mut self, games: &'a [Game]) -> BoxFuture<'a, Result<UpsertCounts>> {
        async move {
            let transaction = self.client.transaction().await.context("transaction")?;
            let statement = transaction
                .prepare(UPSERT_GAME)
                .await
                .context("prepare UPSERT_GAME")?;
            let now = Utc::now().timestamp();
            let mut counts = UpsertCounts::default();
            for game in games {
                let game_id = i64::try_from(game.game_id).context("game_id out of bounds")?;
                let row = transaction
                    .query_one(
                        &statement,
                        &[
                            &game_id,
                            &(game.game_state as i16),
                            &game.player_address,
                            &game.player_commit,
                            &game.commit_timestamp.timestamp(),
                            &game.bet_amount,
                            &game.house_randomness,
                            &game.house_randomness_timestamp.map(|t| t.timestamp()),
                            &game.player_secret,
                            &game.player_card,
                            &game.house_card,
                            &game.reveal_timestamp.map(|t| t.timestamp()),
                            &game.result().map(|r| r as i16),
                            &game.total_time(),
                            &now,
                        ],
                    )
                    .await
                    .context("execute UPSERT_GAME")?;
                if row.try_get::<_, bool>(0)? {
                    counts.inserted += 1;
                } else {
                    counts.updated += 1;
                }
            }
            transaction.commit().await.context("commit")?;
            Ok(counts)
        }
        .boxed()
    }

    fn game(&mut self, game_id: u64) -> BoxFuture<'_, Result<Option<Game>>> {
        async move {
            let game_id = i64::try_from(game_id).context("game_id out of bounds")?;
            let row = self
                .client
                .query_opt(GET_GAME, &[&game_id])
                .await
                .context("query GET_GAME")?;
            row.as_ref().map(game_from_row).transpose()
        }
        .boxed()
    }

    fn max_sequential_id(&mut self) -> BoxFuture<'_, Result<u64>> {
        async move {
            let row = self
                .client
                .query_one(MAX_SEQUENTIAL_ID, &[])
                .await
                .context("query MAX_SEQUENTIAL_ID")?;
            let max: i64 = row.try_get(0)?;
            max.try_into().context("sequential_id out of bounds")
        }
        .boxed()
    }

    fn known_transaction_hashes<'a>(
        &'a mut self,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<HashSet<String>>> {
        async move {
            let rows = self
                .client
                .query(GET_KNOWN_HASHES, &[&hashes])
                .await
                .context("query GET_KNOWN_HASHES")?;
            let known = rows
                .iter()
                .map(|row| row.try_get::<_, String>(0))
                .collect::<Result<HashSet<_>, _>>()?;
            Ok(known)
        }
        .boxed()
    }

    fn insert_transactions<'a>(
        &'a mut self,
        transactions: &'a [Transaction],
    ) -> BoxFuture<'a, Result<usize>> {
        async move {
            let transaction = self.client.transaction().await.context("transaction")?;
            let statement = transaction
                .prepare(INSERT_TRANSACTION)
                .await
                .context("prepare INSERT_TRANSACTION")?;
            let now = Utc::now().timestamp();
            let mut inserted = 0;
            for tx in transactions {
                let sequential_id =
                    i64::try_from(tx.sequential_id).context("sequential_id out of bounds")?;
                let confirmations =
                    i64::try_from(tx.confirmations).context("confirmations out of bounds")?;
                let block_number =
                    i64::try_from(tx.block_number).context("block_number out of bounds")?;
                let rows = transaction
                    .execute(
                        &statement,
                        &[
                            &tx.transaction_hash,
                            &sequential_id,
                            &tx.method,
                            &tx.function_signature_id,
                            &tx.from_address,
                            &tx.to_address,
                            &tx.value,
                            &tx.fee,
                            &tx.gas_used,
                            &tx.gas_price,
                            &tx.status,
                            &confirmations,
                            &block_number,
                            &tx.timestamp.timestamp(),
                            &tx.raw_input,
                            &tx.decoded_input,
                            &now,
                        ],
                    )
                    .await
                    .context("execute INSERT_TRANSACTION")?;
                inserted += rows as usize;
            }
            transaction.commit().await.context("commit")?;
            Ok(inserted)
        }
        .boxed()
    }

    fn average_fee<'a>(&'a mut self, methods: &'a [&'a str]) -> BoxFuture<'a, Result<Option<U256>>> {
        async move {
            let rows = self
                .client
                .query(GET_FEES, &[&methods])
                .await
                .context("query GET_FEES")?;
            let fees = rows
                .iter()
                .map(|row| row.try_get::<_, String>(0))
                .collect::<Result<Vec<_>, _>>()?;
            database::mean_wei(fees)
        }
        .boxed()
    }

    fn replace_signatures<'a>(
        &'a mut self,
        contract_name: &'a str,
        signatures: &'a [FunctionSignature],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let transaction = self.client.transaction().await.context("transaction")?;
            transaction
                .execute(DETACH_SIGNATURES, &[&contract_name])
                .await
                .context("execute DETACH_SIGNATURES")?;
            transaction
                .execute(DELETE_SIGNATURES, &[&contract_name])
                .await
                .context("execute DELETE_SIGNATURES")?;
            let statement = transaction
                .prepare(INSERT_SIGNATURE)
                .await
                .context("prepare INSERT_SIGNATURE")?;
            for signature in signatures {
                transaction
                    .execute(
                        &statement,
                        &[
                            &contract_name,
                            &signature.name,
                            &signature.signature_str,
                            &signature.signature_hex,
                        ],
                    )
                    .await
                    .context("execute INSERT_SIGNATURE")?;
            }
            transaction.commit().await.context("commit")
        }
        .boxed()
    }

    fn find_signature<'a>(
        &'a mut self,
        signature_hex: &'a str,
        contract_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<FunctionSignature>>> {
        async move {
            let row = self
                .client
                .query_opt(FIND_SIGNATURE, &[&signature_hex, &contract_name])
                .await
                .context("query FIND_SIGNATURE")?;
            row.map(|row| {
                Ok::<_, anyhow::Error>(FunctionSignature {
                    id: Some(row.try_get(0)?),
                    contract_name: row.try_get(1)?,
                    name: row.try_get(2)?,
                    signature_str: row.try_get(3)?,
                    signature_hex: row.try_get(4)?,
                })
            })
            .transpose()
        }
        .boxed()
    }

    fn record_sync_stat<'a>(
        &'a mut self,
        bucket: &'a str,
        stat: &'a SyncStat,
        expires_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let now = stat.timestamp.timestamp_millis();
            let window_start = (stat.timestamp - chrono::Duration::hours(24)).timestamp_millis();
            let new_games = i64::try_from(stat.new_games).context("new_games out of bounds")?;
            let updated_games =
                i64::try_from(stat.updated_games).context("updated_games out of bounds")?;
            let duration =
                i64::try_from(stat.duration.as_millis()).context("duration out of bounds")?;

            let transaction = self.client.transaction().await.context("transaction")?;
            transaction
                .execute(DELETE_EXPIRED_STATS, &[&now])
                .await
                .context("execute DELETE_EXPIRED_STATS")?;
            transaction
                .execute(DELETE_EXPIRED_BUCKETS, &[&now])
                .await
                .context("execute DELETE_EXPIRED_BUCKETS")?;
            transaction
                .execute(UPSERT_BUCKET, &[&bucket, &expires_at.timestamp_millis()])
                .await
                .context("execute UPSERT_BUCKET")?;
            transaction
                .execute(TRIM_BUCKET, &[&bucket, &window_start])
                .await
                .context("execute TRIM_BUCKET")?;
            transaction
                .execute(
                    INSERT_STAT,
                    &[&bucket, &now, &new_games, &updated_games, &duration],
                )
                .await
                .context("execute INSERT_STAT")?;
            transaction.commit().await.context("commit")
        }
        .boxed()
    }

    fn sync_stats<'a>(
        &'a mut self,
        bucket: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<SyncStat>>> {
        async move {
            let rows = self
                .client
                .query(GET_STATS, &[&bucket, &now.timestamp_millis()])
                .await
                .context("query GET_STATS")?;
            rows.iter()
                .map(|row| {
                    Ok::<_, anyhow::Error>(SyncStat {
                        timestamp: database::timestamp_millis(row.try_get(0)?)?,
                        new_games: row
                            .try_get::<_, i64>(1)?
                            .try_into()
                            .context("new_games out of bounds")?,
                        updated_games: row
                            .try_get::<_, i64>(2)?
                            .try_into()
                            .context("updated_games out of bounds")?,
                        duration: Duration::from_millis(
                            row.try_get::<_, i64>(3)?
                                .try_into()
                                .context("duration out of bounds")?,
                        ),
                    })
                })
                .collect::<Result<Vec<_>>>()
        }
        .boxed()
    }

    fn last_flush(&mut self) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>> {
        async move {
            let row = self
                .client
                .query_opt(GET_LAST_FLUSH, &[])
                .await
                .context("query GET_LAST_FLUSH")?;
            row.map(|row| database::timestamp_millis(row.try_get(0)?))
                .transpose()
        }
        .boxed()
    }

    fn set_last_flush(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        async move {
            self.client
                .execute(SET_LAST_FLUSH, &[&at.timestamp_millis()])
                .await
                .context("execute SET_LAST_FLUSH")?;
            Ok(())
        }
        .boxed()
    }
}

fn game_from_row(row: &Row) -> Result<Game> {
    let game_state: i16 = row.try_get(1)?;
    Ok(Game {
        game_id: row
            .try_get::<_, i64>(0)?
            .try_into()
            .context("game_id out of bounds")?,
        game_state: u64::try_from(game_state)
            .ok()
            .and_then(GameState::from_index)
            .context("invalid game_state")?,
        player_address: row.try_get(2)?,
        player_commit: row.try_get(3)?,
        commit_timestamp: database::timestamp(row.try_get(4)?)?,
        bet_amount: row.try_get(5)?,
        house_randomness: row.try_get(6)?,
        house_randomness_timestamp: row
            .try_get::<_, Option<i64>>(7)?
            .map(database::timestamp)
            .transpose()?,
        player_secret: row.try_get(8)?,
        player_card: row.try_get(9)?,
        house_card: row.try_get(10)?,
        reveal_timestamp: row
            .try_get::<_, Option<i64>>(11)?
            .map(database::timestamp)
            .transpose()?,
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    game_id BIGINT PRIMARY KEY NOT NULL,
    game_state SMALLINT NOT NULL,
    player_address TEXT NOT NULL,
    player_commit TEXT NOT NULL,
    commit_timestamp BIGINT NOT NULL,
    bet_amount TEXT,
    house_randomness TEXT,
    house_randomness_timestamp BIGINT,
    player_secret TEXT,
    player_card TEXT,
    house_card TEXT,
    reveal_timestamp BIGINT,
    result SMALLINT,
    total_time BIGINT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS games_commit_timestamp ON games (commit_timestamp);
CREATE INDEX IF NOT EXISTS games_player_address ON games (player_address);
CREATE INDEX IF NOT EXISTS games_result ON games (result);

CREATE TABLE IF NOT EXISTS function_signatures (
    id BIGSERIAL PRIMARY KEY,
    contract_name TEXT NOT NULL,
    name TEXT NOT NULL,
    signature_str TEXT NOT NULL,
    signature_hex TEXT NOT NULL,
    UNIQUE (contract_name, signature_hex)
);
CREATE INDEX IF NOT EXISTS function_signatures_hex ON function_signatures (signature_hex);

CREATE TABLE IF NOT EXISTS transactions (
    id BIGSERIAL PRIMARY KEY,
    transaction_hash TEXT NOT NULL UNIQUE,
    sequential_id BIGINT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    function_signature_id BIGINT REFERENCES function_signatures (id),
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    value TEXT NOT NULL,
    fee TEXT NOT NULL,
    gas_used TEXT NOT NULL,
    gas_price TEXT NOT NULL,
    status TEXT NOT NULL,
    confirmations BIGINT NOT NULL,
    block_number BIGINT NOT NULL,
    timestamp BIGINT NOT NULL,
    raw_input TEXT NOT NULL,
    decoded_input TEXT,
    created_at BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_method_timestamp ON transactions (method, timestamp);
CREATE INDEX IF NOT EXISTS transactions_block_number ON transactions (block_number);

CREATE TABLE IF NOT EXISTS _sync_stat_bucket (
    bucket TEXT PRIMARY KEY NOT NULL,
    expires_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS _sync_stat (
    bucket TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    new_games BIGINT NOT NULL,
    updated_games BIGINT NOT NULL,
    duration BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS _sync_stat_bucket_timestamp ON _sync_stat (bucket, timestamp);

CREATE TABLE IF NOT EXISTS _last_flush (
    id SMALLINT PRIMARY KEY CHECK (id = 0),
    at BIGINT NOT NULL
);
";

/// Returns `true` for inserted rows: `xmax` is only set when a conflicting
/// row was updated.
const UPSERT_GAME: &str = "INSERT INTO games (game_id, game_state, player_address, \
                           player_commit, commit_timestamp, bet_amount, house_randomness, \
                           house_randomness_timestamp, player_secret, player_card, house_card, \
                           reveal_timestamp, result, total_time, created_at, updated_at) \
                           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                           $15, $15) ON CONFLICT (game_id) DO UPDATE SET game_state = \
                           EXCLUDED.game_state, player_address = EXCLUDED.player_address, \
                           player_commit = EXCLUDED.player_commit, commit_timestamp = \
                           EXCLUDED.commit_timestamp, bet_amount = EXCLUDED.bet_amount, \
                           house_randomness = EXCLUDED.house_randomness, \
                           house_randomness_timestamp = EXCLUDED.house_randomness_timestamp, \
                           player_secret = EXCLUDED.player_secret, player_card = \
                           EXCLUDED.player_card, house_card = EXCLUDED.house_card, \
                           reveal_timestamp = EXCLUDED.reveal_timestamp, result = \
                           EXCLUDED.result, total_time = EXCLUDED.total_time, updated_at = \
                           EXCLUDED.updated_at RETURNING (xmax = 0);";
const GET_GAME: &str = "SELECT game_id, game_state, player_address, player_commit, \
                        commit_timestamp, bet_amount, house_randomness, \
                        house_randomness_timestamp, player_secret, player_card, house_card, \
                        reveal_timestamp FROM games WHERE game_id = $1;";

const MAX_SEQUENTIAL_ID: &str = "SELECT COALESCE(MAX(sequential_id), 0)::BIGINT FROM transactions;";
const INSERT_TRANSACTION: &str = "INSERT INTO transactions (transaction_hash, sequential_id, \
                                  method, function_signature_id, from_address, to_address, \
                                  value, fee, gas_used, gas_price, status, confirmations, \
                                  block_number, timestamp, raw_input, decoded_input, created_at) \
                                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                                  $13, $14, $15, $16, $17) ON CONFLICT DO NOTHING;";
const GET_KNOWN_HASHES: &str =
    "SELECT transaction_hash FROM transactions WHERE transaction_hash = ANY($1);";
const GET_FEES: &str = "SELECT fee FROM transactions WHERE method = ANY($1);";

const DETACH_SIGNATURES: &str = "UPDATE transactions SET function_signature_id = NULL WHERE \
                                 function_signature_id IN (SELECT id FROM function_signatures \
                                 WHERE contract_name = $1);";
const DELETE_SIGNATURES: &str = "DELETE FROM function_signatures WHERE contract_name = $1;";
const INSERT_SIGNATURE: &str = "INSERT INTO function_signatures (contract_name, name, \
                                signature_str, signature_hex) VALUES ($1, $2, $3, $4) ON \
                                CONFLICT (contract_name, signature_hex) DO NOTHING;";
/// Scoped to a contract when `$2` is not null.
const FIND_SIGNATURE: &str = "SELECT id, contract_name, name, signature_str, signature_hex FROM \
                              function_signatures WHERE signature_hex = $1 AND ($2::TEXT IS \
                              NULL OR contract_name = $2) ORDER BY id LIMIT 1;";

const DELETE_EXPIRED_STATS: &str = "DELETE FROM _sync_stat WHERE bucket IN (SELECT bucket FROM \
                                    _sync_stat_bucket WHERE expires_at <= $1);";
const DELETE_EXPIRED_BUCKETS: &str = "DELETE FROM _sync_stat_bucket WHERE expires_at <= $1;";
const UPSERT_BUCKET: &str = "INSERT INTO _sync_stat_bucket (bucket, expires_at) VALUES ($1, $2) \
                             ON CONFLICT (bucket) DO UPDATE SET expires_at = EXCLUDED.expires_at;";
const TRIM_BUCKET: &str = "DELETE FROM _sync_stat WHERE bucket = $1 AND timestamp <= $2;";
const INSERT_STAT: &str = "INSERT INTO _sync_stat (bucket, timestamp, new_games, updated_games, \
                           duration) VALUES ($1, $2, $3, $4, $5);";
const GET_STATS: &str = "SELECT s.timestamp, s.new_games, s.updated_games, s.duration FROM \
                         _sync_stat s JOIN _sync_stat_bucket b ON b.bucket = s.bucket WHERE \
                         s.bucket = $1 AND b.expires_at > $2 ORDER BY s.timestamp ASC;";

const GET_LAST_FLUSH: &str = "SELECT at FROM _last_flush WHERE id = 0;";
const SET_LAST_FLUSH: &str = "INSERT INTO _last_flush (id, at) VALUES (0, $1) ON CONFLICT (id) \
                              DO UPDATE SET at = EXCLUDED.at;";
