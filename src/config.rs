use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use std::{
    fmt::{self, Debug, Formatter},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub database: Url,
    pub chain: Chain,
    #[serde(default)]
    pub games: Games,
    pub explorer: Explorer,
    #[serde(default)]
    pub sync: Schedule,
    #[serde(default)]
    pub notifications: Notifications,
}

/// Chain RPC settings for the tracked game contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Chain {
    pub rpc_url: Url,
    #[serde(with = "address")]
    pub contract_address: Address,
    pub contract_abi_name: String,
    #[serde(default = "default_abi_directory")]
    pub abi_directory: PathBuf,
    #[serde(default = "default_abi_cache_ttl", with = "seconds")]
    pub abi_cache_ttl: Duration,
    #[serde(default = "default_timeout", with = "seconds")]
    pub timeout: Duration,
}

/// Game reconciliation settings. `page_size` is the only batching knob: the
/// maximum number of games fetched and reconciled per cycle.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Games {
    pub page_size: u64,
    pub descending: bool,
    pub id_field: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Explorer {
    pub url: Url,
    #[serde(default = "default_explorer_page_size")]
    pub page_size: u64,
    #[serde(default = "default_explorer_max_pages")]
    pub max_pages: u64,
    #[serde(default = "default_timeout", with = "seconds")]
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Schedule {
    #[serde(with = "seconds")]
    pub interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Notifications {
    /// Minimum time between two aggregated summary messages.
    #[serde(with = "seconds")]
    pub interval: Duration,
    pub enabled: bool,
    pub send_start: bool,
    pub send_completion: bool,
    pub send_error: bool,
    pub telegram: Telegram,
}

#[derive(Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Telegram {
    pub bot_token: String,
    pub chat_id: String,
}

/// Settings that can be given on the command line or in the environment,
/// taking precedence over the configuration file.
#[derive(Args, Default)]
pub struct Overrides {
    /// Overrides `chain.rpc-url`.
    #[clap(long, env = "BLOCKCHAIN_RPC_URL")]
    pub rpc_url: Option<Url>,

    /// Overrides `chain.contract-address`.
    #[clap(long, env = "BLOCKCHAIN_CONTRACT_ADDRESS")]
    pub contract_address: Option<Address>,

    /// Overrides `chain.contract-abi-name`.
    #[clap(long, env = "BLOCKCHAIN_CONTRACT_ABI")]
    pub contract_abi: Option<String>,

    /// Overrides `notifications.telegram.bot-token`.
    #[clap(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_bot_token: Option<String>,

    /// Overrides `notifications.telegram.chat-id`.
    #[clap(long, env = "TELEGRAM_CHAT_ID", hide_env_values = true)]
    pub telegram_chat_id: Option<String>,

    /// Overrides `notifications.enabled`.
    #[clap(long, env = "TELEGRAM_ENABLED")]
    pub telegram_enabled: Option<bool>,

    /// Overrides `notifications.send-start`.
    #[clap(long, env = "TELEGRAM_SEND_START")]
    pub telegram_send_start: Option<bool>,

    /// Overrides `notifications.send-completion`.
    #[clap(long, env = "TELEGRAM_SEND_COMPLETION")]
    pub telegram_send_completion: Option<bool>,

    /// Overrides `notifications.send-error`.
    #[clap(long, env = "TELEGRAM_SEND_ERROR")]
    pub telegram_send_error: Option<bool>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let toml = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&toml)?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let chain = &mut self.chain;
        let notifications = &mut self.notifications;
        if let Some(rpc_url) = overrides.rpc_url {
            chain.rpc_url = rpc_url;
        }
        if let Some(contract_address) = overrides.contract_address {
            chain.contract_address = contract_address;
        }
        if let Some(contract_abi) = overrides.contract_abi {
            chain.contract_abi_name = contract_abi;
        }
        if let Some(bot_token) = overrides.telegram_bot_token {
            notifications.telegram.bot_token = bot_token;
        }
        if let Some(chat_id) = overrides.telegram_chat_id {
            notifications.telegram.chat_id = chat_id;
        }
        notifications.enabled = overrides.telegram_enabled.unwrap_or(notifications.enabled);
        notifications.send_start = overrides
            .telegram_send_start
            .unwrap_or(notifications.send_start);
        notifications.send_completion = overrides
            .telegram_send_completion
            .unwrap_or(notifications.send_completion);
        notifications.send_error = overrides
            .telegram_send_error
            .unwrap_or(notifications.send_error);
    }
}

impl Telegram {
    /// Returns `true` if both the bot token and chat ID are set. Sending is
    /// silently disabled otherwise.
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

impl Default for Games {
    fn default() -> Self {
        Self {
            page_size: 50,
            descending: true,
            id_field: "gameId".to_string(),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            enabled: false,
            send_start: false,
            send_completion: true,
            send_error: true,
            telegram: Telegram::default(),
        }
    }
}

fn default_abi_directory() -> PathBuf {
    PathBuf::from("contracts")
}

fn default_abi_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_explorer_page_size() -> u64 {
    35
}

fn default_explorer_max_pages() -> u64 {
    1
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("database", &self.database.scheme())
            .field("chain", &self.chain)
            .field("games", &self.games)
            .field("explorer", &self.explorer)
            .field("sync", &self.sync)
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl Debug for Telegram {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Telegram")
            .field("configured", &self.is_configured())
            .finish()
    }
}

mod address {
    use alloy_primitives::Address;
    use serde::{de, Deserialize, Deserializer};
    use std::borrow::Cow;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Cow::<str>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
