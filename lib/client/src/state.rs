//! Binary layouts of the ledger accounts.
//!
//! All accounts are packed and start with an 8 byte discriminator, so the
//! Borsh encoding of these structs is the account data after the prefix.

use anchor_lang::solana_program::hash::hash;
use anyhow::Context;
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;

use crate::decimal::Decimal;
use crate::error::MarginfiClientError;

pub const MAX_UTPS: usize = 32;
pub const UTP_ADDRESS_BOOK_LEN: usize = 32;
const RESERVED_LEN: usize = 32;

pub const DISCRIMINATOR_LEN: usize = 8;
/// Offset of `MarginAccountData::authority` in the account data.
pub const MARGIN_ACCOUNT_AUTHORITY_OFFSET: usize = DISCRIMINATOR_LEN;
/// Offset of `MarginAccountData::margin_group` in the account data.
pub const MARGIN_ACCOUNT_GROUP_OFFSET: usize = DISCRIMINATOR_LEN + 32;

pub fn account_discriminator(name: &str) -> [u8; 8] {
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash(format!("account:{name}").as_bytes()).to_bytes()[..8]);
    discriminator
}

pub trait LedgerAccount: BorshDeserialize + BorshSerialize {
    const NAME: &'static str;

    fn discriminator() -> [u8; 8] {
        account_discriminator(Self::NAME)
    }

    fn try_from_account_data(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < DISCRIMINATOR_LEN || data[..DISCRIMINATOR_LEN] != Self::discriminator() {
            return Err(MarginfiClientError::InvalidDiscriminator(Self::NAME).into());
        }
        Self::deserialize(&mut &data[DISCRIMINATOR_LEN..])
            .with_context(|| format!("deserializing {}", Self::NAME))
    }

    fn to_account_data(&self) -> anyhow::Result<Vec<u8>> {
        let mut data = Self::discriminator().to_vec();
        self.serialize(&mut data)?;
        Ok(data)
    }
}

#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct BankData {
    pub scaling_factor_c: Decimal,
    pub fixed_fee: Decimal,
    pub interest_fee: Decimal,
    pub deposit_accumulator: Decimal,
    pub borrow_accumulator: Decimal,
    pub last_update: i64,
    pub native_deposit_balance: Decimal,
    pub native_borrow_balance: Decimal,
    pub mint: Pubkey,
    pub vault: Pubkey,
    pub bank_authority_bump: u8,
    pub insurance_vault_balance: Decimal,
    pub fee_vault_balance: Decimal,
    pub init_margin_ratio: Decimal,
    pub maint_margin_ratio: Decimal,
    pub account_deposit_limit: Decimal,
    pub reserved_space: [u64; RESERVED_LEN],
}

#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MarginGroupData {
    pub admin: Pubkey,
    pub bank: BankData,
    pub paused: bool,
    pub reserved_space: [u64; RESERVED_LEN],
}

impl LedgerAccount for MarginGroupData {
    const NAME: &'static str = "MarginGroup";
}

#[derive(Clone, Copy, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct UtpAccountConfig {
    pub address: Pubkey,
    pub authority_seed: Pubkey,
    pub authority_bump: u8,
    pub utp_address_book: [Pubkey; UTP_ADDRESS_BOOK_LEN],
}

/// Health values the ledger wrote during the last observe instruction for a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct UtpObservationCache {
    pub total_collateral: Decimal,
    pub free_collateral: Decimal,
    pub margin_requirement_init: Decimal,
    pub margin_requirement_maint: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct MarginAccountData {
    pub authority: Pubkey,
    pub margin_group: Pubkey,
    pub deposit_record: Decimal,
    pub borrow_record: Decimal,
    pub active_utps: [bool; MAX_UTPS],
    pub utp_account_config: [UtpAccountConfig; MAX_UTPS],
    pub utp_cache: [UtpObservationCache; MAX_UTPS],
    pub reserved_space: [u64; RESERVED_LEN],
}

impl LedgerAccount for MarginAccountData {
    const NAME: &'static str = "MarginAccount";
}

impl MarginAccountData {
    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.active_utps
            .iter()
            .enumerate()
            .filter_map(|(slot, active)| active.then_some(slot))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UtpConfig {
    pub utp_program_id: Pubkey,
    pub margin_requirement_deposit_buffer: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_account_layout() -> anyhow::Result<()> {
        let mut account = MarginAccountData {
            authority: Pubkey::new_unique(),
            margin_group: Pubkey::new_unique(),
            deposit_record: Decimal::from_native(1_500_000, 6)?,
            ..Default::default()
        };
        account.active_utps[1] = true;

        let data = account.to_account_data()?;
        let config_len = 32 + 32 + 1 + 32 * UTP_ADDRESS_BOOK_LEN;
        assert_eq!(
            data.len(),
            8 + 32 + 32 + 16 + 16 + MAX_UTPS + MAX_UTPS * config_len + MAX_UTPS * 64 + 8 * 32
        );
        assert_eq!(
            data[MARGIN_ACCOUNT_GROUP_OFFSET..MARGIN_ACCOUNT_GROUP_OFFSET + 32],
            account.margin_group.to_bytes()
        );
        assert_eq!(MarginAccountData::try_from_account_data(&data)?, account);
        assert_eq!(account.active_slots().collect::<Vec<_>>(), vec![1]);
        Ok(())
    }

    #[test]
    fn test_discriminator_mismatch() -> anyhow::Result<()> {
        let group = MarginGroupData::default().to_account_data()?;
        let err = MarginAccountData::try_from_account_data(&group).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarginfiClientError>(),
            Some(MarginfiClientError::InvalidDiscriminator("MarginAccount"))
        ));
        assert!(MarginGroupData::try_from_account_data(&group[..4]).is_err());
        Ok(())
    }
}
