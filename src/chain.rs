//! Read-only access to the chain through a JSON-RPC node: view calls against
//! contracts and account balances.

use crate::config;
use alloy_dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy_json_abi::{Function, JsonAbi, Param};
use alloy_primitives::{hex, Address, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest};
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tokio::time;

/// A contract whose view functions can be called.
///
/// Results are returned as JSON: integers as decimal strings, addresses
/// checksummed, bytes as `0x` prefixed hex, and structs as objects keyed by
/// their component names. A function with several named outputs returns an
/// object of those outputs.
pub trait Contract: Send + Sync {
    fn call<'a>(&'a self, method: &'a str, args: &'a [DynSolValue]) -> BoxFuture<'a, Result<Value>>;
}

/// A node answering account and contract queries.
pub trait Node: Send + Sync {
    /// Ether balance of an account, in wei.
    fn balance(&self, account: Address) -> BoxFuture<'_, Result<U256>>;

    /// The contract at `address`, called through this node.
    fn contract(&self, address: Address, abi: Arc<JsonAbi>) -> Box<dyn Contract>;
}

pub struct RpcNode {
    provider: RootProvider,
    timeout: Duration,
}

impl RpcNode {
    pub fn new(config: &config::Chain) -> Self {
        Self {
            provider: RootProvider::new_http(config.rpc_url.clone()),
            timeout: config.timeout,
        }
    }
}

impl Node for RpcNode {
    fn balance(&self, account: Address) -> BoxFuture<'_, Result<U256>> {
        async move {
            time::timeout(self.timeout, self.provider.get_balance(account))
                .await
                .context("eth_getBalance timed out")?
                .with_context(|| format!("eth_getBalance {account}"))
        }
        .boxed()
    }

    fn contract(&self, address: Address, abi: Arc<JsonAbi>) -> Box<dyn Contract> {
        Box::new(RpcContract {
            provider: self.provider.clone(),
            timeout: self.timeout,
            address,
            abi,
        })
    }
}

/// A contract reached through `eth_call`.
pub struct RpcContract {
    provider: RootProvider,
    timeout: Duration,
    address: Address,
    abi: Arc<JsonAbi>,
}

impl RpcContract {
    fn function(&self, method: &str) -> Result<&Function> {
        self.abi
            .function(method)
            .and_then(|overloads| overloads.first())
            .with_context(|| format!("contract has no function {method}"))
    }
}

impl Contract for RpcContract {
    fn call<'a>(&'a self, method: &'a str, args: &'a [DynSolValue]) -> BoxFuture<'a, Result<Value>> {
        async move {
            let function = self.function(method)?;
            let input = function
                .abi_encode_input(args)
                .with_context(|| format!("encode {method} arguments"))?;
            let request = TransactionRequest::default()
                .to(self.address)
                .input(TransactionInput::new(input.into()));
            let output = time::timeout(self.timeout, self.provider.call(request))
                .await
                .with_context(|| format!("{method} call timed out"))?
                .with_context(|| format!("eth_call {method}"))?;
            let values = function
                .abi_decode_output(&output)
                .with_context(|| format!("decode {method} result"))?;
            tracing::trace!(method, address = %self.address, "contract call");
            Ok(outputs_to_json(&function.outputs, values))
        }
        .boxed()
    }
}

/// Converts decoded function outputs to JSON. A single output is returned
/// as is, multiple outputs become an object when they are all named and an
/// array otherwise.
pub fn outputs_to_json(outputs: &[Param], mut values: Vec<DynSolValue>) -> Value {
    if values.len() == 1 {
        let components = outputs.first().map_or(&[][..], |param| &param.components);
        return to_json(values.remove(0), components);
    }
    if !outputs.is_empty() && outputs.iter().all(|param| !param.name.is_empty()) {
        return Value::Object(
            outputs
                .iter()
                .zip(values)
                .map(|(param, value)| (param.name.clone(), to_json(value, &param.components)))
                .collect(),
        );
    }
    Value::Array(
        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let components = outputs.get(i).map_or(&[][..], |param| &param.components);
                to_json(value, components)
            })
            .collect(),
    )
}

/// Converts a decoded value to JSON. `components` are the tuple components
/// of the value's type (or of its element type for arrays) and name the
/// fields of structs.
fn to_json(value: DynSolValue, components: &[Param]) -> Value {
    match value {
        DynSolValue::Bool(value) => Value::Bool(value),
        DynSolValue::Int(value, _) => Value::String(value.to_string()),
        DynSolValue::Uint(value, _) => Value::String(value.to_string()),
        DynSolValue::FixedBytes(word, size) => Value::String(hex::encode_prefixed(&word[..size])),
        DynSolValue::Address(address) => Value::String(address.to_checksum(None)),
        DynSolValue::Bytes(bytes) => Value::String(hex::encode_prefixed(bytes)),
        DynSolValue::String(value) => Value::String(value),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => Value::Array(
            values
                .into_iter()
                .map(|value| to_json(value, components))
                .collect(),
        ),
        DynSolValue::Tuple(values) => {
            let named = components.len() == values.len()
                && components.iter().all(|param| !param.name.is_empty());
            if named {
                Value::Object(
                    components
                        .iter()
                        .zip(values)
                        .map(|(param, value)| {
                            (param.name.clone(), to_json(value, &param.components))
                        })
                        .collect::<Map<_, _>>(),
                )
            } else {
                Value::Array(
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(i, value)| {
                            let components =
                                components.get(i).map_or(&[][..], |param| &param.components);
                            to_json(value, components)
                        })
                        .collect(),
                )
            }
        }
        other => Value::String(hex::encode_prefixed(other.abi_encode())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use hex_literal::hex;
    use serde_json::json;

    const ABI: &str = r#"[
        {"type": "function", "name": "getGames", "stateMutability": "view",
         "inputs": [{"name": "offset", "type": "uint256"}, {"name": "count", "type": "uint256"}, {"name": "descending", "type": "bool"}],
         "outputs": [{"name": "", "type": "tuple[]", "components": [
            {"name": "gameId", "type": "uint256"},
            {"name": "playerAddress", "type": "address"},
            {"name": "playerCommit", "type": "bytes32"}
         ]}]},
        {"type": "function", "name": "games", "stateMutability": "view",
         "inputs": [{"name": "", "type": "uint256"}],
         "outputs": [{"name": "gameState", "type": "uint8"}, {"name": "playerAddress", "type": "address"}]}
    ]"#;

    #[test]
    fn encodes_calls() {
        let abi = serde_json::from_str::<JsonAbi>(ABI).unwrap();
        let get_games = &abi.function("getGames").unwrap()[0];
        let input = get_games
            .abi_encode_input(&[
                DynSolValue::from(U256::from(0)),
                DynSolValue::from(U256::from(50)),
                DynSolValue::Bool(true),
            ])
            .unwrap();
        assert_eq!(input[..4], hex!("16f3c030"));
        assert_eq!(input.len(), 4 + 3 * 32);
    }

    #[test]
    fn struct_arrays_become_objects() {
        let abi = serde_json::from_str::<JsonAbi>(ABI).unwrap();
        let get_games = &abi.function("getGames").unwrap()[0];
        let player = Address::from(hex!("ff8269e2a10e39422e18cf7bc54f12260451e306"));
        let values = vec![DynSolValue::Array(vec![DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(7), 256),
            DynSolValue::Address(player),
            DynSolValue::FixedBytes(B256::repeat_byte(0xab), 32),
        ])])];

        assert_eq!(
            outputs_to_json(&get_games.outputs, values),
            json!([{
                "gameId": "7",
                "playerAddress": "0xff8269e2a10e39422E18Cf7Bc54f12260451e306",
                "playerCommit": format!("0x{}", "ab".repeat(32)),
            }])
        );
    }

    #[test]
    fn named_outputs_become_an_object() {
        let abi = serde_json::from_str::<JsonAbi>(ABI).unwrap();
        let games = &abi.function("games").unwrap()[0];
        let values = vec![
            DynSolValue::Uint(U256::from(3), 8),
            DynSolValue::Address(Address::ZERO),
        ];

        assert_eq!(
            outputs_to_json(&games.outputs, values),
            json!({
                "gameState": "3",
                "playerAddress": "0x0000000000000000000000000000000000000000",
            })
        );
    }

    #[tokio::test]
    async fn rpc_failures_are_errors() {
        let node = RpcNode::new(&config::Chain {
            rpc_url: "http://127.0.0.1:1".parse().unwrap(),
            contract_address: Address::ZERO,
            contract_abi_name: "Game".to_string(),
            abi_directory: "contracts".into(),
            abi_cache_ttl: Duration::from_secs(3600),
            timeout: Duration::from_secs(5),
        });
        let abi = Arc::new(serde_json::from_str::<JsonAbi>(ABI).unwrap());
        let contract = node.contract(Address::ZERO, abi);

        let err = contract.call("missing", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "contract has no function missing");
        let err = contract
            .call("games", &[DynSolValue::from(U256::from(1))])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "eth_call games");
        assert!(node.balance(Address::ZERO).await.is_err());
    }
}
