//! Funds backing the game: the ether held by the house account and the
//! supply of the gacha token the contract rewards players with.

use crate::chain::{Contract, Node};
use alloy_json_abi::JsonAbi;
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;

/// The part of the ERC-20 interface needed to read the token supply.
const TOKEN_ABI: &str = "function totalSupply() view returns (uint256)";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HouseBalance {
    pub contract_address: Address,
    pub house_address: Address,
    /// Wei held by the house account.
    pub balance_wei: U256,
    pub gacha_token_address: Address,
    /// Token base units. Zero when the token could not be queried.
    pub gacha_total_supply: U256,
}

/// Reads the house's funds. A failing token supply query is logged and
/// reads as zero; every other failure is an error.
pub async fn house_balance(
    node: &dyn Node,
    game: &dyn Contract,
    contract_address: Address,
) -> Result<HouseBalance> {
    let house_address = address(game.call("HOUSE", &[]).await?).context("HOUSE")?;
    let gacha_token_address =
        address(game.call("gachaToken", &[]).await?).context("gachaToken")?;
    let gacha_total_supply = match total_supply(node, gacha_token_address).await {
        Ok(supply) => supply,
        Err(err) => {
            tracing::error!(?err, %gacha_token_address, "failed to read gacha token supply");
            U256::ZERO
        }
    };
    let balance_wei = node.balance(house_address).await?;

    Ok(HouseBalance {
        contract_address,
        house_address,
        balance_wei,
        gacha_token_address,
        gacha_total_supply,
    })
}

async fn total_supply(node: &dyn Node, token: Address) -> Result<U256> {
    let abi = JsonAbi::parse([TOKEN_ABI]).context("parse token ABI")?;
    let supply = node
        .contract(token, Arc::new(abi))
        .call("totalSupply", &[])
        .await?;
    let supply = supply.as_str().context("totalSupply is not a number")?;
    U256::from_str_radix(supply, 10).context("invalid totalSupply")
}

fn address(value: Value) -> Result<Address> {
    value
        .as_str()
        .context("not an address")?
        .parse()
        .context("invalid address")
}
