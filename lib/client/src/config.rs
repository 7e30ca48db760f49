use std::str::FromStr;

use anyhow::Context;
use fixed::types::I80F48;
use serde_derive::Deserialize;
use solana_sdk::pubkey::Pubkey;

use crate::utp::UtpIndex;

pub const COLLATERAL_DECIMALS: u8 = 6;

/// Base58 pubkeys in config files.
mod pubkey_string {
    use super::*;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_str(&s).map_err(serde::de::Error::custom)
    }
}

fn default_collateral_decimals() -> u8 {
    COLLATERAL_DECIMALS
}
fn default_rpc_timeout_secs() -> u64 {
    10
}
fn default_observation_max_age_secs() -> u64 {
    5
}
fn default_dust_threshold() -> u64 {
    1
}
fn default_partial_liquidation_factor() -> f64 {
    0.2
}
fn default_rebalance_deposit_cap() -> f64 {
    0.95
}
fn default_deposit_buffer() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct MarginfiConfig {
    #[serde(with = "pubkey_string")]
    pub program_id: Pubkey,
    #[serde(with = "pubkey_string")]
    pub group: Pubkey,
    #[serde(with = "pubkey_string")]
    pub collateral_mint: Pubkey,
    #[serde(default = "default_collateral_decimals")]
    pub collateral_decimals: u8,

    /// Bound on every individual rpc call
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,

    /// Observations older than this are reported as stale
    #[serde(default = "default_observation_max_age_secs")]
    pub observation_max_age_secs: u64,

    /// Native amounts at or below this are not worth moving
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,

    #[serde(default = "default_partial_liquidation_factor")]
    pub partial_liquidation_factor: f64,

    /// Fraction of the computed maximum moved per rebalance deposit
    #[serde(default = "default_rebalance_deposit_cap")]
    pub rebalance_deposit_cap: f64,

    pub mango: Option<MangoConfig>,
    pub drift: Option<DriftConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MangoConfig {
    #[serde(with = "pubkey_string")]
    pub program_id: Pubkey,
    #[serde(with = "pubkey_string")]
    pub group: Pubkey,
    #[serde(with = "pubkey_string")]
    pub cache: Pubkey,
    #[serde(with = "pubkey_string")]
    pub root_bank: Pubkey,
    #[serde(with = "pubkey_string")]
    pub node_bank: Pubkey,
    #[serde(with = "pubkey_string")]
    pub vault: Pubkey,
    /// Authority of the mango group vaults
    #[serde(with = "pubkey_string")]
    pub signer: Pubkey,
    #[serde(default = "default_deposit_buffer")]
    pub deposit_buffer: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DriftConfig {
    #[serde(with = "pubkey_string")]
    pub program_id: Pubkey,
    #[serde(with = "pubkey_string")]
    pub state: Pubkey,
    #[serde(with = "pubkey_string")]
    pub markets: Pubkey,
    #[serde(with = "pubkey_string")]
    pub collateral_vault: Pubkey,
    #[serde(with = "pubkey_string")]
    pub collateral_vault_authority: Pubkey,
    #[serde(with = "pubkey_string")]
    pub insurance_vault: Pubkey,
    #[serde(with = "pubkey_string")]
    pub insurance_vault_authority: Pubkey,
    #[serde(with = "pubkey_string")]
    pub deposit_history: Pubkey,
    #[serde(with = "pubkey_string")]
    pub funding_payment_history: Pubkey,
    #[serde(with = "pubkey_string")]
    pub funding_rate_history: Pubkey,
    #[serde(with = "pubkey_string")]
    pub trade_history: Pubkey,
    #[serde(default = "default_deposit_buffer")]
    pub deposit_buffer: f64,
}

#[derive(Clone, Debug)]
pub enum VenueConfig {
    Drift(DriftConfig),
    Mango(MangoConfig),
}

impl VenueConfig {
    pub fn program_id(&self) -> Pubkey {
        match self {
            VenueConfig::Drift(c) => c.program_id,
            VenueConfig::Mango(c) => c.program_id,
        }
    }

    pub fn deposit_buffer(&self) -> I80F48 {
        let buffer = match self {
            VenueConfig::Drift(c) => c.deposit_buffer,
            VenueConfig::Mango(c) => c.deposit_buffer,
        };
        I80F48::from_num(buffer.max(1.0))
    }
}

/// Thresholds the decision math runs with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RiskPolicy {
    pub collateral_decimals: u8,
    pub dust_threshold: I80F48,
    pub partial_liquidation_factor: I80F48,
    pub rebalance_deposit_cap: I80F48,
    pub observation_max_age: chrono::Duration,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            collateral_decimals: COLLATERAL_DECIMALS,
            dust_threshold: I80F48::from_num(default_dust_threshold()),
            partial_liquidation_factor: I80F48::from_num(default_partial_liquidation_factor()),
            rebalance_deposit_cap: I80F48::from_num(default_rebalance_deposit_cap()),
            observation_max_age: chrono::Duration::seconds(
                default_observation_max_age_secs() as i64,
            ),
        }
    }
}

impl MarginfiConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents).context("parsing marginfi config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let path = shellexpand::tilde(path);
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {path}"))?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(self.partial_liquidation_factor > 0.0 && self.partial_liquidation_factor < 1.0) {
            anyhow::bail!(
                "partial_liquidation_factor must be in (0, 1), got {}",
                self.partial_liquidation_factor
            );
        }
        if !(self.rebalance_deposit_cap > 0.0 && self.rebalance_deposit_cap <= 1.0) {
            anyhow::bail!(
                "rebalance_deposit_cap must be in (0, 1], got {}",
                self.rebalance_deposit_cap
            );
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn risk_policy(&self) -> RiskPolicy {
        RiskPolicy {
            collateral_decimals: self.collateral_decimals,
            dust_threshold: I80F48::from_num(self.dust_threshold),
            partial_liquidation_factor: I80F48::from_num(self.partial_liquidation_factor),
            rebalance_deposit_cap: I80F48::from_num(self.rebalance_deposit_cap),
            observation_max_age: chrono::Duration::seconds(self.observation_max_age_secs as i64),
        }
    }

    pub fn venue(&self, index: UtpIndex) -> Option<VenueConfig> {
        match index {
            UtpIndex::Drift => self.drift.clone().map(VenueConfig::Drift),
            UtpIndex::Mango => self.mango.clone().map(VenueConfig::Mango),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        program_id = "BR2xPx7pRuDcYuPDnBXexXBAqvxUb7VP54WrMmvcvvaX"
        group = "2uLAEKCbNY2nDR45yj2kckvwDBp8yjoCJrqijZsjRPVR"
        collateral_mint = "8FRFC6MoGGkMFQwngccyu69VnYbzykGeez7ignHVAFSN"

        [mango]
        program_id = "4skJ85cdxQAFVKbcGgfun8iZPL7BadVYXG3kGEGkufqA"
        group = "Ec2enZyoC4nGpEfu2sUNAa2nUGJHWxoUWYSEJ2hNTWTA"
        cache = "EBDRoayCDDUvDgCimta45ajQeXbexv7aKqJubruqpyvu"
        root_bank = "HUBX4iwWEUK5VrXXXcB7uhuKrfT4fpu2T9iZbg712JrN"
        node_bank = "J2Lmnc1e4frMnBEJARPoHtfpcohLfN67HdK1inXjTFSM"
        vault = "AV4CuwdvnccZMXNhu9cSCx1mkpgHWcwWEJ7Yb8Xh8QMC"
        signer = "CFdbPXrnPLmo5Qrze7rw9ZNiD82R1VeNdoQosooSP1Ax"
        deposit_buffer = 1.1
    "#;

    #[test]
    fn test_parse() -> anyhow::Result<()> {
        let config = MarginfiConfig::from_toml_str(CONFIG)?;
        assert_eq!(config.collateral_decimals, 6);
        assert_eq!(config.rpc_timeout_secs, 10);
        assert_eq!(config.observation_max_age_secs, 5);
        assert!(config.drift.is_none());
        assert!(config.venue(UtpIndex::Drift).is_none());

        let mango = config.venue(UtpIndex::Mango).unwrap();
        assert_eq!(
            mango.program_id(),
            Pubkey::from_str("4skJ85cdxQAFVKbcGgfun8iZPL7BadVYXG3kGEGkufqA")?
        );
        assert_eq!(mango.deposit_buffer(), I80F48::from_num(1.1));
        assert_eq!(config.risk_policy(), RiskPolicy::default());
        Ok(())
    }

    #[test]
    fn test_reject_bad_values() {
        let bad = format!("partial_liquidation_factor = 1.5\n{CONFIG}");
        assert!(MarginfiConfig::from_toml_str(&bad).is_err());

        let bad_key = CONFIG.replace("BR2xPx7pRuDcYuPDnBXexXBAqvxUb7VP54WrMmvcvvaX", "nope");
        assert!(MarginfiConfig::from_toml_str(&bad_key).is_err());
    }
}
