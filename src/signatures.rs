//! Registry mapping 4-byte function selectors to method names, built from
//! contract ABIs.

use crate::{
    abi::AbiCache,
    database::{Database, FunctionSignature},
};
use alloy_json_abi::{JsonAbi, Param};
use alloy_primitives::{hex, keccak256};
use anyhow::{Context, Result};

/// Builds the canonical signature `name(type1,type2,...)`. Tuple parameters
/// are expanded into their component types.
pub fn canonical_signature(name: &str, inputs: &[Param]) -> String {
    let types = inputs
        .iter()
        .map(|input| input.selector_type())
        .collect::<Vec<_>>();
    format!("{name}({})", types.join(","))
}

/// Computes the `0x` prefixed selector of a function: the first 4 bytes of
/// the Keccak-256 hash of its canonical signature.
pub fn compute_selector(name: &str, inputs: &[Param]) -> String {
    selector_of(&canonical_signature(name, inputs))
}

fn selector_of(signature: &str) -> String {
    hex::encode_prefixed(&keccak256(signature.as_bytes())[..4])
}

/// Computes the registry entries for every function of an ABI.
pub fn signatures(contract_name: &str, abi: &JsonAbi) -> Vec<FunctionSignature> {
    abi.functions()
        .map(|function| {
            let signature_str = canonical_signature(&function.name, &function.inputs);
            FunctionSignature {
                id: None,
                contract_name: contract_name.to_string(),
                name: function.name.clone(),
                signature_hex: selector_of(&signature_str),
                signature_str,
            }
        })
        .collect()
}

/// Replaces the registry entries of a contract with the functions of its
/// ABI, so that removed or renamed functions no longer resolve.
pub async fn populate(
    db: &mut dyn Database,
    contract_name: &str,
    abi: &JsonAbi,
) -> Result<Vec<FunctionSignature>> {
    let signatures = signatures(contract_name, abi);
    db.replace_signatures(contract_name, &signatures)
        .await
        .with_context(|| format!("replace signatures of {contract_name}"))?;
    tracing::info!(
        contract = contract_name,
        count = signatures.len(),
        "populated function signatures"
    );
    Ok(signatures)
}

/// Populates the registry from every ABI file known to the cache.
pub async fn populate_all(
    db: &mut dyn Database,
    abis: &mut AbiCache,
) -> Result<Vec<FunctionSignature>> {
    let mut all = Vec::new();
    for name in abis.names()? {
        let abi = abis.load(&name)?;
        all.extend(populate(db, &name, &abi).await?);
    }
    Ok(all)
}

/// Looks up a selector. When a contract is given its own entries take
/// precedence, falling back to any contract's entry.
pub async fn resolve(
    db: &mut dyn Database,
    selector: &str,
    contract_name: Option<&str>,
) -> Result<Option<FunctionSignature>> {
    let selector = selector.to_ascii_lowercase();
    if let Some(contract_name) = contract_name {
        if let Some(signature) = db.find_signature(&selector, Some(contract_name)).await? {
            return Ok(Some(signature));
        }
    }
    db.find_signature(&selector, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Sqlite;

    fn abi(json: &str) -> JsonAbi {
        serde_json::from_str::<JsonAbi>(json).unwrap()
    }

    const GAME: &str = r#"[
        {"type": "function", "name": "commit", "inputs": [{"name": "hash", "type": "bytes32"}], "outputs": [], "stateMutability": "payable"},
        {"type": "function", "name": "HOUSE", "inputs": [], "outputs": [{"name": "", "type": "address"}], "stateMutability": "view"},
        {"type": "event", "name": "Committed", "inputs": [{"name": "gameId", "type": "uint256", "indexed": true}], "anonymous": false}
    ]"#;

    #[test]
    fn commit_selector() {
        let abi = abi(GAME);
        let commit = &abi.function("commit").unwrap()[0];
        assert_eq!(compute_selector("commit", &commit.inputs), "0xf14fcbc8");
        assert_eq!(compute_selector("HOUSE", &[]), "0x47597162");
    }

    #[test]
    fn tuple_parameters_are_expanded() {
        let abi = abi(
            r#"[{"type": "function", "name": "settle", "inputs": [
                {"name": "game", "type": "tuple", "components": [
                    {"name": "id", "type": "uint256"},
                    {"name": "player", "type": "address"}
                ]},
                {"name": "hashes", "type": "bytes32[]"}
            ], "outputs": [], "stateMutability": "nonpayable"}]"#,
        );
        let settle = &abi.function("settle").unwrap()[0];
        assert_eq!(
            canonical_signature("settle", &settle.inputs),
            "settle((uint256,address),bytes32[])"
        );
        assert_eq!(compute_selector("settle", &settle.inputs), "0xce4c07a9");
    }

    #[test]
    fn only_functions_are_registered() {
        let mut signatures = signatures("Game", &abi(GAME));
        signatures.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            signatures,
            [
                FunctionSignature {
                    id: None,
                    contract_name: "Game".to_string(),
                    name: "HOUSE".to_string(),
                    signature_str: "HOUSE()".to_string(),
                    signature_hex: "0x47597162".to_string(),
                },
                FunctionSignature {
                    id: None,
                    contract_name: "Game".to_string(),
                    name: "commit".to_string(),
                    signature_str: "commit(bytes32)".to_string(),
                    signature_hex: "0xf14fcbc8".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn populate_replaces_and_resolve_prefers_scope() {
        let mut db = Sqlite::new_for_test();

        populate(&mut db, "Game", &abi(GAME)).await.unwrap();
        populate(
            &mut db,
            "Other",
            &abi(r#"[{"type": "function", "name": "commitOther", "inputs": [{"name": "h", "type": "bytes32"}], "outputs": [], "stateMutability": "nonpayable"}]"#),
        )
        .await
        .unwrap();

        let resolved = resolve(&mut db, "0xF14FCBC8", Some("Game")).await.unwrap();
        assert_eq!(resolved.unwrap().name, "commit");
        // Falls back to the global registry.
        let resolved = resolve(&mut db, "0x47597162", Some("Other")).await.unwrap();
        assert_eq!(resolved.unwrap().name, "HOUSE");
        assert!(resolve(&mut db, "0xdeadbeef", None).await.unwrap().is_none());

        // Re-populating drops functions that are no longer in the ABI.
        populate(
            &mut db,
            "Game",
            &abi(r#"[{"type": "function", "name": "HOUSE", "inputs": [], "outputs": [], "stateMutability": "view"}]"#),
        )
        .await
        .unwrap();
        assert!(resolve(&mut db, "0xf14fcbc8", Some("Game")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn populate_all_reads_every_abi_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("Game.json"), GAME).unwrap();
        std::fs::write(dir.path().join("Empty.json"), "[]").unwrap();

        let mut db = Sqlite::new_for_test();
        let mut abis = AbiCache::new(dir.path(), std::time::Duration::from_secs(60));
        let all = populate_all(&mut db, &mut abis).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(resolve(&mut db, "0xf14fcbc8", None).await.unwrap().is_some());
    }
}
