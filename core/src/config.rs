//! Runtime settings
//!
//! Converts the TOML/env configuration from `coinjoin-config` into the typed
//! values the coordinator runs on. Nothing here is global: `main` builds one
//! [`CoordinatorSettings`] and hands it over.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use bitcoin::{Amount, Network};
use coinjoin_config::{CoordinatorTomlConfig, NodeSection, RoundSection};

use crate::blinding::KEY_FILE_NAME;
use crate::coinjoin::RoundConfig;
use crate::coinjoin::ledger::ledger_file_name;
use crate::node::RpcNodeConfig;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub network: Network,
    pub data_dir: PathBuf,
    /// Applied to rounds created from now on
    pub round: RoundConfig,
    pub max_unconfirmed: usize,
    pub sweep_interval: Duration,
    pub key_bits: usize,
}

impl CoordinatorSettings {
    /// Default policy for `network`, storing files under `data_dir`
    pub fn new(network: Network, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            data_dir: data_dir.into(),
            round: RoundConfig::default(),
            max_unconfirmed: 24,
            sweep_interval: Duration::from_secs(60),
            key_bits: 2048,
        }
    }

    pub fn from_toml(config: &CoordinatorTomlConfig) -> Result<Self> {
        let network = parse_network(&config.coordinator.network)?;
        let round = round_config_from_toml(&config.round)?;
        ensure!(
            config.ledger.max_unconfirmed > 0,
            "ledger.max_unconfirmed must be positive"
        );

        Ok(Self {
            network,
            data_dir: PathBuf::from(&config.coordinator.data_dir),
            round,
            max_unconfirmed: config.ledger.max_unconfirmed,
            sweep_interval: Duration::from_secs(config.ledger.sweep_interval_secs.max(1)),
            key_bits: config.blinding.key_bits,
        })
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(ledger_file_name(self.network))
    }
}

/// Accepts bitcoind's chain names plus "main"/"mainnet"
pub fn parse_network(name: &str) -> Result<Network> {
    match name.trim().to_ascii_lowercase().as_str() {
        "main" | "mainnet" => Ok(Network::Bitcoin),
        other => Network::from_str(other).with_context(|| format!("Unknown network: {name}")),
    }
}

pub fn round_config_from_toml(section: &RoundSection) -> Result<RoundConfig> {
    ensure!(section.anonymity_set > 0, "round.anonymity_set must be positive");
    ensure!(
        (1..=section.anonymity_set).contains(&section.min_anonymity_set),
        "round.min_anonymity_set must be between 1 and round.anonymity_set"
    );

    let config = RoundConfig {
        denomination: Amount::from_sat(section.denomination_sats),
        anonymity_set: section.anonymity_set,
        min_anonymity_set: section.min_anonymity_set,
        fee_per_input: Amount::from_sat(section.fee_per_input_sats),
        fee_per_output: Amount::from_sat(section.fee_per_output_sats),
        dust_threshold: Amount::from_sat(section.dust_threshold_sats),
        input_registration_timeout: Duration::from_secs(section.input_registration_timeout_secs),
        connection_confirmation_timeout: Duration::from_secs(
            section.connection_confirmation_timeout_secs,
        ),
        output_registration_timeout: Duration::from_secs(section.output_registration_timeout_secs),
        signing_timeout: Duration::from_secs(section.signing_timeout_secs),
    };
    ensure!(
        config.required_amount().is_some(),
        "round denomination plus fees overflows"
    );
    Ok(config)
}

pub fn node_config_from_toml(section: &NodeSection) -> RpcNodeConfig {
    RpcNodeConfig {
        url: section.rpc_url.clone(),
        fallback_url: section.fallback_rpc_url.clone(),
        user: section.rpc_user.clone(),
        password: section.rpc_password.clone(),
        request_timeout: Duration::from_secs(section.request_timeout_secs),
    }
}
