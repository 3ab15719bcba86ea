//! Incremental ingestion of contract transactions from the block explorer.
//!
//! Transactions are numbered locally in ingestion order. The highest stored
//! number is the ingestion cursor, so an interrupted or failed run is resumed
//! from storage and never skips or duplicates a transaction.

use crate::{
    database::{Database, Transaction},
    explorer::{Explorer, RawTransaction},
    signatures,
};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Method name of transactions whose selector is not in the registry.
pub const UNKNOWN_METHOD: &str = "unknown";

/// Length of a `0x` prefixed 4-byte selector.
const SELECTOR_LEN: usize = 10;

/// Full pages without new entries read in one run before giving up.
const STALE_PAGE_LIMIT: u64 = 8;

pub struct TransactionIngestor {
    explorer: Box<dyn Explorer>,
    contract_address: Address,
    contract_name: String,
    max_pages: u64,
}

impl TransactionIngestor {
    pub fn new(
        explorer: Box<dyn Explorer>,
        contract_address: Address,
        contract_name: String,
        max_pages: u64,
    ) -> Self {
        Self {
            explorer,
            contract_address,
            contract_name,
            max_pages,
        }
    }

    /// Ingests up to `max_pages` pages with new entries, starting at the page
    /// holding the cursor. Returns the number of new transactions.
    pub async fn ingest(&self, db: &mut dyn Database) -> Result<usize> {
        let page_size = self.explorer.page_size();
        anyhow::ensure!(page_size > 0, "explorer page size must be positive");
        let cursor = db.max_sequential_id().await.context("read cursor")?;

        let mut page = cursor / page_size + 1;
        let (mut total, mut pages, mut stale) = (0, 0, 0);
        while pages < self.max_pages && stale < STALE_PAGE_LIMIT {
            let ingested = self.ingest_page(db, page).await?;
            total += ingested.inserted;
            if !ingested.full {
                break;
            }
            // A full page without new entries means the cursor lags behind
            // the explorer's positions, so keep reading past it.
            if ingested.inserted > 0 {
                pages += 1;
            } else {
                stale += 1;
            }
            page += 1;
        }
        Ok(total)
    }

    async fn ingest_page(&self, db: &mut dyn Database, page: u64) -> Result<Ingested> {
        let page_size = self.explorer.page_size();
        let mut entries = match self.explorer.transactions(self.contract_address, page).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(?err, page, "failed to fetch transactions");
                return Ok(Ingested::default());
            }
        };
        let full = entries.len() as u64 >= page_size;
        if is_descending(&entries) {
            entries.reverse();
        }

        let first = (page - 1) * page_size;
        let entries = entries
            .into_iter()
            .zip(first..)
            .map(|(entry, position)| (transaction_key(&entry, position), entry))
            .collect::<Vec<_>>();
        let hashes = entries.iter().map(|(hash, _)| hash.clone()).collect::<Vec<_>>();
        let known = db
            .known_transaction_hashes(&hashes)
            .await
            .context("read known transactions")?;

        // Only entries that are new get a number, so the ids stay gap free
        // even when the explorer's pagination drifts.
        let cursor = db.max_sequential_id().await.context("read cursor")?;
        let mut seen = HashSet::new();
        let mut transactions = Vec::new();
        for (hash, entry) in entries {
            if known.contains(&hash) || !seen.insert(hash.clone()) {
                continue;
            }
            let sequential_id = cursor + transactions.len() as u64 + 1;
            transactions.push(self.transaction(db, sequential_id, hash, entry).await);
        }

        let inserted = db
            .insert_transactions(&transactions)
            .await
            .context("insert transactions")?;
        tracing::info!(
            page,
            cursor,
            fetched = hashes.len(),
            new = transactions.len(),
            inserted,
            "ingested transactions"
        );
        Ok(Ingested { inserted, full })
    }

    async fn transaction(
        &self,
        db: &mut dyn Database,
        sequential_id: u64,
        transaction_hash: String,
        entry: RawTransaction,
    ) -> Transaction {
        let raw_input = entry.input.unwrap_or_default();
        let (method, function_signature_id) = match selector(&raw_input) {
            Some(selector) => self.method(db, selector).await,
            None => (UNKNOWN_METHOD.to_string(), None),
        };
        let gas_used = entry.gas_used.unwrap_or_else(|| "0".to_string());
        let gas_price = entry.gas_price.unwrap_or_else(|| "0".to_string());
        let fee = fee(&gas_used, &gas_price).unwrap_or_else(|| {
            tracing::warn!(%transaction_hash, %gas_used, %gas_price, "invalid gas values");
            "0".to_string()
        });

        Transaction {
            sequential_id,
            transaction_hash,
            method,
            from_address: address_or_zero(entry.from),
            to_address: address_or_zero(entry.to),
            value: entry.value.unwrap_or_else(|| "0".to_string()),
            fee,
            gas_used,
            gas_price,
            status: match entry.is_error.as_deref() {
                Some("0") => "success",
                _ => "failed",
            }
            .to_string(),
            block_number: number(entry.block_number.as_deref()),
            confirmations: number(entry.confirmations.as_deref()),
            timestamp: DateTime::from_timestamp(
                number(entry.time_stamp.as_deref()).try_into().unwrap_or_default(),
                0,
            )
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            raw_input,
            decoded_input: None,
            function_signature_id,
        }
    }

    /// Resolves a selector, scoped to the tracked contract first. Lookup
    /// failures resolve to the unknown method.
    async fn method(&self, db: &mut dyn Database, selector: &str) -> (String, Option<i64>) {
        match signatures::resolve(db, selector, Some(self.contract_name.as_str())).await {
            Ok(Some(signature)) => (signature.name, signature.id),
            Ok(None) => (UNKNOWN_METHOD.to_string(), None),
            Err(err) => {
                tracing::warn!(?err, selector, "failed to resolve selector");
                (UNKNOWN_METHOD.to_string(), None)
            }
        }
    }
}

#[derive(Default)]
struct Ingested {
    inserted: usize,
    full: bool,
}

/// The `0x` prefixed selector of a call input. Inputs consisting of only a
/// selector (or less) have none.
fn selector(input: &str) -> Option<&str> {
    if input.len() <= SELECTOR_LEN {
        return None;
    }
    input.get(..SELECTOR_LEN)
}

/// `gas_used * gas_price` in wei, as a decimal string.
pub fn fee(gas_used: &str, gas_price: &str) -> Option<String> {
    let gas_used = U256::from_str_radix(gas_used, 10).ok()?;
    let gas_price = U256::from_str_radix(gas_price, 10).ok()?;
    Some(gas_used.checked_mul(gas_price)?.to_string())
}

/// The hash of an entry. Entries without one are keyed by their block and
/// list position, so they still take up exactly one sequential id.
fn transaction_key(entry: &RawTransaction, position: u64) -> String {
    if let Some(hash) = entry.hash.as_deref().filter(|hash| !hash.is_empty()) {
        return hash.to_string();
    }
    let key = format!("unhashed:{}:{position}", number(entry.block_number.as_deref()));
    tracing::warn!(?entry, %key, "transaction without hash");
    key
}

fn is_descending(entries: &[RawTransaction]) -> bool {
    let block = |entry: Option<&RawTransaction>| {
        entry.and_then(|entry| entry.block_number.as_deref()?.parse::<u64>().ok())
    };
    matches!((block(entries.first()), block(entries.last())), (Some(first), Some(last)) if first > last)
}

fn address_or_zero(address: Option<String>) -> String {
    address
        .filter(|address| !address.is_empty())
        .unwrap_or_else(|| Address::ZERO.to_string())
}

fn number(value: Option<&str>) -> u64 {
    value.and_then(|value| value.parse().ok()).unwrap_or_default()
}
