//! CoinJoin Coordinator Configuration
//!
//! Handles loading configuration from:
//! 1. CCJ_CONFIG env var (explicit path)
//! 2. ./coordinator.toml (current directory)
//! 3. ~/.coinjoin/coordinator.toml (user home)
//!
//! Environment variables take precedence over TOML config.
//!
//! The loaded value is plain data. Nothing here is cached process-wide;
//! the coordinator converts it into runtime types and hands those to each
//! component explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, fs};

const CONFIG_FILE_NAME: &str = "coordinator.toml";
const CONFIG_DIR_NAME: &str = ".coinjoin";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_NETWORK: &str = "regtest";
const DEFAULT_DATA_DIR: &str = "./coordinator-data";
const DEFAULT_RPC_URL: &str = "http://127.0.0.1:18443";
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

const DEFAULT_DENOMINATION_SATS: u64 = 10_000_000;
const DEFAULT_ANONYMITY_SET: usize = 21;
const DEFAULT_MIN_ANONYMITY_SET: usize = 2;
const DEFAULT_FEE_PER_INPUT_SATS: u64 = 3_000;
const DEFAULT_FEE_PER_OUTPUT_SATS: u64 = 1_500;
const DEFAULT_DUST_THRESHOLD_SATS: u64 = 5_000;
const DEFAULT_INPUT_REGISTRATION_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_CONNECTION_CONFIRMATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_OUTPUT_REGISTRATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SIGNING_TIMEOUT_SECS: u64 = 60;

const DEFAULT_MAX_UNCONFIRMED: usize = 24;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

const DEFAULT_KEY_BITS: usize = 2048;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorTomlConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub round: RoundSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub blinding: BlindingSection,
}

/// Instance identity: which chain and where durable files live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// "bitcoin", "testnet", "signet" or "regtest"
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.into(),
            data_dir: DEFAULT_DATA_DIR.into(),
        }
    }
}

fn default_network() -> String {
    DEFAULT_NETWORK.into()
}
fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.into()
}

/// Bitcoin node JSON-RPC connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Used once the primary endpoint fails at the transport level
    #[serde(default)]
    pub fallback_rpc_url: Option<String>,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
    #[serde(default = "default_rpc_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.into(),
            fallback_rpc_url: None,
            rpc_user: None,
            rpc_password: None,
            request_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
        }
    }
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.into()
}
fn default_rpc_timeout() -> u64 {
    DEFAULT_RPC_TIMEOUT_SECS
}

/// Round policy applied to newly created rounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSection {
    #[serde(default = "default_denomination")]
    pub denomination_sats: u64,
    #[serde(default = "default_anonymity_set")]
    pub anonymity_set: usize,
    #[serde(default = "default_min_anonymity_set")]
    pub min_anonymity_set: usize,
    #[serde(default = "default_fee_per_input")]
    pub fee_per_input_sats: u64,
    #[serde(default = "default_fee_per_output")]
    pub fee_per_output_sats: u64,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sats: u64,
    #[serde(default = "default_input_registration_timeout")]
    pub input_registration_timeout_secs: u64,
    #[serde(default = "default_connection_confirmation_timeout")]
    pub connection_confirmation_timeout_secs: u64,
    #[serde(default = "default_output_registration_timeout")]
    pub output_registration_timeout_secs: u64,
    #[serde(default = "default_signing_timeout")]
    pub signing_timeout_secs: u64,
}

impl Default for RoundSection {
    fn default() -> Self {
        Self {
            denomination_sats: DEFAULT_DENOMINATION_SATS,
            anonymity_set: DEFAULT_ANONYMITY_SET,
            min_anonymity_set: DEFAULT_MIN_ANONYMITY_SET,
            fee_per_input_sats: DEFAULT_FEE_PER_INPUT_SATS,
            fee_per_output_sats: DEFAULT_FEE_PER_OUTPUT_SATS,
            dust_threshold_sats: DEFAULT_DUST_THRESHOLD_SATS,
            input_registration_timeout_secs: DEFAULT_INPUT_REGISTRATION_TIMEOUT_SECS,
            connection_confirmation_timeout_secs: DEFAULT_CONNECTION_CONFIRMATION_TIMEOUT_SECS,
            output_registration_timeout_secs: DEFAULT_OUTPUT_REGISTRATION_TIMEOUT_SECS,
            signing_timeout_secs: DEFAULT_SIGNING_TIMEOUT_SECS,
        }
    }
}

fn default_denomination() -> u64 {
    DEFAULT_DENOMINATION_SATS
}
fn default_anonymity_set() -> usize {
    DEFAULT_ANONYMITY_SET
}
fn default_min_anonymity_set() -> usize {
    DEFAULT_MIN_ANONYMITY_SET
}
fn default_fee_per_input() -> u64 {
    DEFAULT_FEE_PER_INPUT_SATS
}
fn default_fee_per_output() -> u64 {
    DEFAULT_FEE_PER_OUTPUT_SATS
}
fn default_dust_threshold() -> u64 {
    DEFAULT_DUST_THRESHOLD_SATS
}
fn default_input_registration_timeout() -> u64 {
    DEFAULT_INPUT_REGISTRATION_TIMEOUT_SECS
}
fn default_connection_confirmation_timeout() -> u64 {
    DEFAULT_CONNECTION_CONFIRMATION_TIMEOUT_SECS
}
fn default_output_registration_timeout() -> u64 {
    DEFAULT_OUTPUT_REGISTRATION_TIMEOUT_SECS
}
fn default_signing_timeout() -> u64 {
    DEFAULT_SIGNING_TIMEOUT_SECS
}

/// CoinJoin ledger backpressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    #[serde(default = "default_max_unconfirmed")]
    pub max_unconfirmed: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            max_unconfirmed: DEFAULT_MAX_UNCONFIRMED,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

fn default_max_unconfirmed() -> usize {
    DEFAULT_MAX_UNCONFIRMED
}
fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

/// Blind signature key generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindingSection {
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

impl Default for BlindingSection {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

fn default_key_bits() -> usize {
    DEFAULT_KEY_BITS
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set Option<String> from env var if present
fn env_option_string(key: &str, field: &mut Option<String>) {
    if let Ok(v) = env::var(key) {
        *field = Some(v);
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        match v.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => log::warn!("Ignoring unparseable {}={}", key, v),
        }
    }
}

// ============================================================================
// Implementation
// ============================================================================

impl CoordinatorTomlConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check CCJ_CONFIG env var
        if let Ok(path) = env::var("CCJ_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            log::warn!("CCJ_CONFIG points to missing file: {}", path.display());
        }

        // 2. Check ./coordinator.toml
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.coinjoin/coordinator.toml
        Self::default_config_path().filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Coordinator
        env_string("CCJ_NETWORK", &mut self.coordinator.network);
        env_string("CCJ_DATA_DIR", &mut self.coordinator.data_dir);

        // Node
        env_string("CCJ_RPC_URL", &mut self.node.rpc_url);
        env_option_string("CCJ_RPC_FALLBACK_URL", &mut self.node.fallback_rpc_url);
        env_option_string("CCJ_RPC_USER", &mut self.node.rpc_user);
        env_option_string("CCJ_RPC_PASSWORD", &mut self.node.rpc_password);
        env_parse("CCJ_RPC_TIMEOUT_SECS", &mut self.node.request_timeout_secs);

        // Round
        env_parse("CCJ_DENOMINATION_SATS", &mut self.round.denomination_sats);
        env_parse("CCJ_ANONYMITY_SET", &mut self.round.anonymity_set);
        env_parse("CCJ_MIN_ANONYMITY_SET", &mut self.round.min_anonymity_set);
        env_parse("CCJ_FEE_PER_INPUT_SATS", &mut self.round.fee_per_input_sats);
        env_parse("CCJ_FEE_PER_OUTPUT_SATS", &mut self.round.fee_per_output_sats);
        env_parse("CCJ_DUST_THRESHOLD_SATS", &mut self.round.dust_threshold_sats);
        env_parse(
            "CCJ_INPUT_REGISTRATION_TIMEOUT_SECS",
            &mut self.round.input_registration_timeout_secs,
        );
        env_parse(
            "CCJ_CONNECTION_CONFIRMATION_TIMEOUT_SECS",
            &mut self.round.connection_confirmation_timeout_secs,
        );
        env_parse(
            "CCJ_OUTPUT_REGISTRATION_TIMEOUT_SECS",
            &mut self.round.output_registration_timeout_secs,
        );
        env_parse("CCJ_SIGNING_TIMEOUT_SECS", &mut self.round.signing_timeout_secs);

        // Ledger
        env_parse("CCJ_MAX_UNCONFIRMED", &mut self.ledger.max_unconfirmed);
        env_parse("CCJ_SWEEP_INTERVAL_SECS", &mut self.ledger.sweep_interval_secs);

        // Blinding
        env_parse("CCJ_KEY_BITS", &mut self.blinding.key_bits);
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.node.rpc_user = Some("bitcoin".into());
        sample.node.rpc_password = Some("changeme".into());
        toml::to_string_pretty(&sample).unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
