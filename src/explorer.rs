//! Client for the Etherscan compatible `txlist` endpoint of a block explorer.

use crate::config;
use alloy_primitives::{hex, Address};
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// A transaction as listed by the explorer. Fields are strings, numbers are
/// accepted in their place and anything else counts as missing.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RawTransaction {
    #[serde(with = "text")]
    pub hash: Option<String>,
    #[serde(with = "text")]
    pub input: Option<String>,
    #[serde(with = "text")]
    pub from: Option<String>,
    #[serde(with = "text")]
    pub to: Option<String>,
    #[serde(with = "text")]
    pub value: Option<String>,
    #[serde(with = "text")]
    pub gas_used: Option<String>,
    #[serde(with = "text")]
    pub gas_price: Option<String>,
    #[serde(with = "text")]
    pub is_error: Option<String>,
    #[serde(with = "text")]
    pub time_stamp: Option<String>,
    #[serde(with = "text")]
    pub block_number: Option<String>,
    #[serde(with = "text")]
    pub confirmations: Option<String>,
}

pub trait Explorer: Send + Sync {
    /// Number of transactions per page.
    fn page_size(&self) -> u64;

    /// Fetches one page (starting at 1) of transactions sent to `address`,
    /// oldest first.
    fn transactions(&self, address: Address, page: u64)
        -> BoxFuture<'_, Result<Vec<RawTransaction>>>;
}

pub struct HttpExplorer {
    client: reqwest::Client,
    url: Url,
    page_size: u64,
}

#[derive(Deserialize)]
struct Response {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

impl HttpExplorer {
    pub fn new(config: &config::Explorer) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            page_size: config.page_size,
        })
    }

    fn request_url(&self, address: Address, page: u64) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("module", "account")
            .append_pair("action", "txlist")
            .append_pair("address", &hex::encode_prefixed(address))
            .append_pair("sort", "asc")
            .append_pair("filterby", "to")
            .append_pair("page", &page.to_string())
            .append_pair("offset", &self.page_size.to_string());
        url
    }
}

impl Explorer for HttpExplorer {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn transactions(
        &self,
        address: Address,
        page: u64,
    ) -> BoxFuture<'_, Result<Vec<RawTransaction>>> {
        async move {
            let url = self.request_url(address, page);
            tracing::debug!(%url, "fetching transactions");
            let response: Response = self
                .client
                .get(url)
                .header("Accept", "application/json")
                .send()
                .await
                .context("send txlist request")?
                .error_for_status()?
                .json()
                .await
                .context("parse txlist response")?;
            parse(response)
        }
        .boxed()
    }
}

/// An empty list is reported with a non-success status, so only a result
/// that is not a list is treated as an error.
fn parse(response: Response) -> Result<Vec<RawTransaction>> {
    match response.result {
        Value::Array(entries) if response.status == "1" || entries.is_empty() => Ok(entries
            .into_iter()
            .map(|entry| {
                // Unusable entries keep their place in the list.
                serde_json::from_value(entry.clone()).unwrap_or_else(|err| {
                    tracing::warn!(?err, %entry, "invalid transaction entry");
                    RawTransaction::default()
                })
            })
            .collect()),
        result => anyhow::bail!(
            "explorer returned status {}: {} {}",
            response.status,
            response.message,
            result
        ),
    }
}

mod text {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::String(value)) => Some(value),
            Some(Value::Number(value)) => Some(value.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use serde_json::json;

    fn response(value: Value) -> Response {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn request_url() {
        let explorer = HttpExplorer::new(&config::Explorer {
            url: "https://explorer.test/api".parse().unwrap(),
            page_size: 35,
            max_pages: 1,
            timeout: std::time::Duration::from_secs(30),
        })
        .unwrap();
        let address = Address::from(hex!("ff8269e2a10e39422e18cf7bc54f12260451e306"));
        assert_eq!(
            explorer.request_url(address, 3).as_str(),
            "https://explorer.test/api?module=account&action=txlist\
             &address=0xff8269e2a10e39422e18cf7bc54f12260451e306&sort=asc&filterby=to&page=3\
             &offset=35"
        );
    }

    #[test]
    fn parses_transactions() {
        let transactions = parse(response(json!({
            "status": "1",
            "message": "OK",
            "result": [{
                "hash": "0xabc",
                "input": "0xf14fcbc8",
                "from": "0x01",
                "gasUsed": "21000",
                "gasPrice": "1000000000",
                "isError": "0",
                "timeStamp": "1700000000",
                "blockNumber": "12",
                "confirmations": "3",
                "methodId": "0xf14fcbc8",
            }],
        })))
        .unwrap();
        assert_eq!(
            transactions,
            [RawTransaction {
                hash: Some("0xabc".to_string()),
                input: Some("0xf14fcbc8".to_string()),
                from: Some("0x01".to_string()),
                gas_used: Some("21000".to_string()),
                gas_price: Some("1000000000".to_string()),
                is_error: Some("0".to_string()),
                time_stamp: Some("1700000000".to_string()),
                block_number: Some("12".to_string()),
                confirmations: Some("3".to_string()),
                ..Default::default()
            }]
        );
    }

    #[test]
    fn malformed_entries_do_not_fail_the_page() {
        let transactions = parse(response(json!({
            "status": "1",
            "message": "OK",
            "result": [
                {"hash": "0x01", "blockNumber": "1"},
                {"hash": "0x02", "blockNumber": 2, "value": null, "isError": false},
                "0x03",
            ],
        })))
        .unwrap();
        assert_eq!(
            transactions,
            [
                RawTransaction {
                    hash: Some("0x01".to_string()),
                    block_number: Some("1".to_string()),
                    ..Default::default()
                },
                RawTransaction {
                    hash: Some("0x02".to_string()),
                    block_number: Some("2".to_string()),
                    ..Default::default()
                },
                RawTransaction::default(),
            ]
        );
    }

    #[test]
    fn empty_and_error_responses() {
        let empty = parse(response(json!({
            "status": "0",
            "message": "No transactions found",
            "result": [],
        })))
        .unwrap();
        assert!(empty.is_empty());

        assert!(parse(response(json!({
            "status": "0",
            "message": "NOTOK",
            "result": "Max rate limit reached",
        })))
        .is_err());
    }
}
