//! Utp slots of a margin account and their venues.

use std::fmt;
use std::str::FromStr;

use anchor_spl::token::spl_token;
use anyhow::Context;
use fixed::types::I80F48;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction;

use crate::config::VenueConfig;
use crate::error::MarginfiClientError;
use crate::instructions::MarginKeys;
use crate::observation::Observation;
use crate::state::UtpAccountConfig;

pub mod drift;
pub mod mango;

pub const PDA_UTP_AUTH_SEED: &[u8] = b"ZEhiKcLS";

/// Venue bound to a utp slot. The discriminant is the slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum UtpIndex {
    Drift = 0,
    Mango = 1,
}

impl UtpIndex {
    pub const ALL: [UtpIndex; 2] = [UtpIndex::Drift, UtpIndex::Mango];

    pub fn from_slot(slot: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.slot() == slot)
    }

    pub fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for UtpIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UtpIndex::Drift => write!(f, "drift"),
            UtpIndex::Mango => write!(f, "mango"),
        }
    }
}

impl FromStr for UtpIndex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drift" | "0" => Ok(UtpIndex::Drift),
            "mango" | "1" => Ok(UtpIndex::Mango),
            _ => anyhow::bail!("unknown utp '{s}', expected drift or mango"),
        }
    }
}

/// Signer of a margin account's positions on a venue.
pub fn utp_authority(
    program_id: &Pubkey,
    utp_program_id: &Pubkey,
    authority_seed: &Pubkey,
) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[
            PDA_UTP_AUTH_SEED,
            utp_program_id.as_ref(),
            authority_seed.as_ref(),
        ],
        program_id,
    )
}

/// System and token instructions that set up the temporary token account a
/// venue deposit moves collateral through.
pub fn proxy_token_account_instructions(
    payer: &Pubkey,
    proxy: &Pubkey,
    mint: &Pubkey,
    owner: &Pubkey,
    rent_lamports: u64,
) -> anyhow::Result<Vec<Instruction>> {
    Ok(vec![
        system_instruction::create_account(
            payer,
            proxy,
            rent_lamports,
            spl_token::state::Account::LEN as u64,
            &spl_token::ID,
        ),
        spl_token::instruction::initialize_account(&spl_token::ID, proxy, mint, owner)
            .context("building proxy token account initialization")?,
    ])
}

/// What a venue deposit needs besides the amount.
#[derive(Clone, Copy, Debug)]
pub struct ProxyTokenAccount {
    pub address: Pubkey,
    pub mint: Pubkey,
    pub rent_lamports: u64,
}

/// One slot of a margin account.
#[derive(Clone, Debug)]
pub struct UtpAccount {
    pub index: UtpIndex,
    pub is_active: bool,
    pub config: UtpAccountConfig,
    pub cached_observation: Observation,
    /// Venue addresses, if the venue is configured for this client.
    pub venue: Option<VenueConfig>,
}

impl UtpAccount {
    pub fn ensure_active(&self) -> Result<(), MarginfiClientError> {
        if !self.is_active {
            return Err(MarginfiClientError::UtpNotActive(self.index));
        }
        Ok(())
    }

    pub fn ensure_inactive(&self) -> Result<(), MarginfiClientError> {
        if self.is_active {
            return Err(MarginfiClientError::UtpAlreadyActive(self.index));
        }
        Ok(())
    }

    pub fn venue(&self) -> anyhow::Result<&VenueConfig> {
        self.venue
            .as_ref()
            .with_context(|| format!("no {} venue configured", self.index))
    }

    /// Address of the venue account, e.g. the mango account or drift user.
    pub fn address(&self) -> Pubkey {
        self.config.address
    }

    pub fn authority(&self, program_id: &Pubkey) -> anyhow::Result<Pubkey> {
        let venue = self.venue()?;
        Pubkey::create_program_address(
            &[
                PDA_UTP_AUTH_SEED,
                venue.program_id().as_ref(),
                self.config.authority_seed.as_ref(),
                &[self.config.authority_bump],
            ],
            program_id,
        )
        .with_context(|| format!("deriving {} utp authority", self.index))
    }

    /// Accounts the ledger reads to recompute this slot's health.
    pub fn observation_accounts(&self) -> anyhow::Result<Vec<AccountMeta>> {
        self.ensure_active()?;
        Ok(match self.venue()? {
            VenueConfig::Drift(drift) => drift::observation_accounts(&self.config, drift),
            VenueConfig::Mango(mango) => mango::observation_accounts(&self.config, mango),
        })
    }

    pub fn observe_instruction(&self, keys: &MarginKeys) -> anyhow::Result<Instruction> {
        self.ensure_active()?;
        Ok(match self.venue()? {
            VenueConfig::Drift(drift) => drift::observe(keys, &self.config, drift),
            VenueConfig::Mango(mango) => mango::observe(keys, &self.config, mango),
        })
    }

    /// Proxy account setup followed by the deposit itself.
    pub fn deposit_instructions(
        &self,
        keys: &MarginKeys,
        proxy: &ProxyTokenAccount,
        amount: u64,
        crank: bool,
    ) -> anyhow::Result<Vec<Instruction>> {
        self.ensure_active()?;
        let authority = self.authority(&keys.program_id)?;
        let mut instructions = proxy_token_account_instructions(
            &keys.authority,
            &proxy.address,
            &proxy.mint,
            &authority,
            proxy.rent_lamports,
        )?;
        instructions.push(match self.venue()? {
            VenueConfig::Drift(drift) => {
                drift::deposit(keys, &self.config, drift, authority, proxy.address, amount, crank)
            }
            VenueConfig::Mango(mango) => {
                mango::deposit(keys, &self.config, mango, authority, proxy.address, amount, crank)
            }
        });
        Ok(instructions)
    }

    pub fn withdraw_instruction(&self, keys: &MarginKeys, amount: u64) -> anyhow::Result<Instruction> {
        self.ensure_active()?;
        let authority = self.authority(&keys.program_id)?;
        Ok(match self.venue()? {
            VenueConfig::Drift(drift) => drift::withdraw(keys, &self.config, drift, authority, amount),
            VenueConfig::Mango(mango) => mango::withdraw(keys, &self.config, mango, authority, amount),
        })
    }

    fn deposit_buffer(&self) -> I80F48 {
        self.venue
            .as_ref()
            .map(VenueConfig::deposit_buffer)
            .unwrap_or(I80F48::ONE)
    }

    pub fn is_rebalance_deposit_needed(&self) -> bool {
        self.is_active
            && self
                .cached_observation
                .is_rebalance_deposit_needed(self.deposit_buffer())
    }

    pub fn max_rebalance_deposit_amount(&self) -> I80F48 {
        if !self.is_active {
            return I80F48::ZERO;
        }
        self.cached_observation
            .max_rebalance_deposit_amount(self.deposit_buffer())
    }

    pub fn is_empty(&self, dust_threshold: I80F48) -> bool {
        self.cached_observation.is_empty(dust_threshold)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DriftConfig, MangoConfig};

    pub(crate) fn mango_config() -> MangoConfig {
        MangoConfig {
            program_id: Pubkey::new_unique(),
            group: Pubkey::new_unique(),
            cache: Pubkey::new_unique(),
            root_bank: Pubkey::new_unique(),
            node_bank: Pubkey::new_unique(),
            vault: Pubkey::new_unique(),
            signer: Pubkey::new_unique(),
            deposit_buffer: 1.0,
        }
    }

    pub(crate) fn drift_config() -> DriftConfig {
        DriftConfig {
            program_id: Pubkey::new_unique(),
            state: Pubkey::new_unique(),
            markets: Pubkey::new_unique(),
            collateral_vault: Pubkey::new_unique(),
            collateral_vault_authority: Pubkey::new_unique(),
            insurance_vault: Pubkey::new_unique(),
            insurance_vault_authority: Pubkey::new_unique(),
            deposit_history: Pubkey::new_unique(),
            funding_payment_history: Pubkey::new_unique(),
            funding_rate_history: Pubkey::new_unique(),
            trade_history: Pubkey::new_unique(),
            deposit_buffer: 1.0,
        }
    }

    /// An active slot whose authority bump is valid for `program_id`.
    pub(crate) fn active_utp(index: UtpIndex, program_id: &Pubkey) -> UtpAccount {
        let venue = match index {
            UtpIndex::Drift => VenueConfig::Drift(drift_config()),
            UtpIndex::Mango => VenueConfig::Mango(mango_config()),
        };
        let authority_seed = Pubkey::new_unique();
        let (_, authority_bump) = utp_authority(program_id, &venue.program_id(), &authority_seed);
        let mut config = UtpAccountConfig {
            address: Pubkey::new_unique(),
            authority_seed,
            authority_bump,
            ..Default::default()
        };
        config.utp_address_book[drift::USER_POSITIONS_ADDRESS_INDEX] = Pubkey::new_unique();
        UtpAccount {
            index,
            is_active: true,
            config,
            cached_observation: Observation::empty(),
            venue: Some(venue),
        }
    }

    #[test]
    fn test_utp_index() -> anyhow::Result<()> {
        assert_eq!(UtpIndex::from_slot(0), Some(UtpIndex::Drift));
        assert_eq!(UtpIndex::from_slot(1), Some(UtpIndex::Mango));
        assert_eq!(UtpIndex::from_slot(2), None);
        assert_eq!("Mango".parse::<UtpIndex>()?, UtpIndex::Mango);
        assert_eq!("0".parse::<UtpIndex>()?, UtpIndex::Drift);
        assert!("zo".parse::<UtpIndex>().is_err());
        assert_eq!(UtpIndex::Drift.to_string(), "drift");
        Ok(())
    }

    #[test]
    fn test_inactive_slot_rejects_operations() {
        let program_id = Pubkey::new_unique();
        let mut utp = active_utp(UtpIndex::Mango, &program_id);
        utp.is_active = false;
        let keys = crate::instructions::tests::keys();

        let err = utp.observe_instruction(&keys).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarginfiClientError>(),
            Some(MarginfiClientError::UtpNotActive(UtpIndex::Mango))
        ));
        assert!(utp.withdraw_instruction(&keys, 10).is_err());
        assert!(utp.observation_accounts().is_err());
        assert!(utp.ensure_inactive().is_ok());

        utp.is_active = true;
        assert!(matches!(
            utp.ensure_inactive(),
            Err(MarginfiClientError::UtpAlreadyActive(UtpIndex::Mango))
        ));
    }

    #[test]
    fn test_authority_matches_derivation() -> anyhow::Result<()> {
        let program_id = Pubkey::new_unique();
        let utp = active_utp(UtpIndex::Drift, &program_id);
        let expected = utp_authority(
            &program_id,
            &utp.venue()?.program_id(),
            &utp.config.authority_seed,
        )
        .0;
        assert_eq!(utp.authority(&program_id)?, expected);
        Ok(())
    }

    #[test]
    fn test_deposit_goes_through_proxy() -> anyhow::Result<()> {
        let keys = crate::instructions::tests::keys();
        let utp = active_utp(UtpIndex::Mango, &keys.program_id);
        let proxy = ProxyTokenAccount {
            address: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            rent_lamports: 2_039_280,
        };
        let ixs = utp.deposit_instructions(&keys, &proxy, 500, false)?;
        assert_eq!(ixs.len(), 3);
        assert_eq!(ixs[0].program_id, solana_sdk::system_program::id());
        assert_eq!(ixs[1].program_id, spl_token::ID);
        assert_eq!(ixs[2].program_id, keys.program_id);
        assert!(ixs[2].accounts.iter().any(|a| a.pubkey == proxy.address));
        Ok(())
    }

    #[test]
    fn test_missing_venue() {
        let program_id = Pubkey::new_unique();
        let mut utp = active_utp(UtpIndex::Drift, &program_id);
        utp.venue = None;
        assert!(utp.observation_accounts().is_err());
        assert!(utp.authority(&program_id).is_err());
    }
}
