//! Loading of contract ABIs from a directory of JSON files.

use alloy_json_abi::JsonAbi;
use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

/// Parsed contract ABIs keyed by contract name, each kept for at most `ttl`
/// before being read from disk again.
///
/// An ABI named `Foo` lives in `<directory>/Foo.json`. The file contains
/// either a bare ABI array or a compiler artifact with an `abi` field.
pub struct AbiCache {
    directory: PathBuf,
    ttl: Duration,
    entries: HashMap<String, Entry>,
}

struct Entry {
    loaded: Instant,
    abi: Arc<JsonAbi>,
}

impl AbiCache {
    pub fn new(directory: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            directory: directory.into(),
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns the ABI of the named contract. A missing file or invalid JSON
    /// is an error.
    pub fn load(&mut self, name: &str) -> Result<Arc<JsonAbi>> {
        if let Some(entry) = self.entries.get(name) {
            if entry.loaded.elapsed() < self.ttl {
                return Ok(entry.abi.clone());
            }
        }

        let abi = Arc::new(self.read(name)?);
        self.entries.insert(
            name.to_string(),
            Entry {
                loaded: Instant::now(),
                abi: abi.clone(),
            },
        );
        Ok(abi)
    }

    /// Lists the names of all ABI files in the directory, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.directory)
            .with_context(|| format!("failed to read {}", self.directory.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map_or(true, |extension| extension != "json") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<JsonAbi> {
        let path = self.directory.join(format!("{name}.json"));
        tracing::debug!(path = %path.display(), "loading contract ABI");

        let json = fs::read_to_string(&path)
            .with_context(|| format!("ABI file not found for contract {name}"))?;
        let mut value: serde_json::Value = serde_json::from_str(&json)
            .with_context(|| format!("invalid JSON in ABI file for contract {name}"))?;
        if let Some(abi) = value.get_mut("abi") {
            value = abi.take();
        }
        serde_json::from_value(value).with_context(|| format!("invalid ABI for contract {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ABI: &str = r#"[
        {"type": "function", "name": "commit", "inputs": [{"name": "hash", "type": "bytes32"}], "outputs": [], "stateMutability": "payable"}
    ]"#;

    #[test]
    fn loads_bare_and_artifact_abis() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Bare.json"), ABI).unwrap();
        fs::write(
            dir.path().join("Artifact.json"),
            format!(r#"{{"contractName": "Artifact", "abi": {ABI}}}"#),
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not an abi").unwrap();

        let mut cache = AbiCache::new(dir.path(), Duration::from_secs(3600));
        assert_eq!(cache.names().unwrap(), ["Artifact", "Bare"]);
        assert!(cache.load("Bare").unwrap().function("commit").is_some());
        assert!(cache.load("Artifact").unwrap().function("commit").is_some());
    }

    #[test]
    fn missing_or_invalid_files_are_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Broken.json"), "[{").unwrap();

        let mut cache = AbiCache::new(dir.path(), Duration::from_secs(3600));
        assert!(cache.load("Missing").is_err());
        assert!(cache.load("Broken").is_err());
        assert!(AbiCache::new(dir.path().join("nope"), Duration::ZERO)
            .names()
            .is_err());
    }

    #[test]
    fn reloads_after_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Game.json");
        fs::write(&path, ABI).unwrap();

        let mut cached = AbiCache::new(dir.path(), Duration::from_secs(3600));
        let mut uncached = AbiCache::new(dir.path(), Duration::ZERO);
        cached.load("Game").unwrap();
        uncached.load("Game").unwrap();

        fs::write(&path, "[]").unwrap();
        assert!(cached.load("Game").unwrap().function("commit").is_some());
        assert!(uncached.load("Game").unwrap().function("commit").is_none());
    }
}
