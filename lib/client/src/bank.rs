use chrono::{DateTime, TimeZone, Utc};
use fixed::types::I80F48;
use solana_sdk::pubkey::Pubkey;

use crate::config::RiskPolicy;
use crate::decimal::{Decimal, DecimalError};
use crate::state::BankData;

pub const PDA_BANK_VAULT_SEED: &[u8] = b"zE8d8R9G";
pub const PDA_BANK_INSURANCE_VAULT_SEED: &[u8] = b"uDMUkwVG";
pub const PDA_BANK_FEE_VAULT_SEED: &[u8] = b"PpqJY00S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LendingSide {
    Deposit,
    Borrow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarginRequirement {
    Init,
    PartialLiquidation,
    Maint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankVaultType {
    Liquidity,
    Insurance,
    Fee,
}

impl BankVaultType {
    fn seed(self) -> &'static [u8] {
        match self {
            BankVaultType::Liquidity => PDA_BANK_VAULT_SEED,
            BankVaultType::Insurance => PDA_BANK_INSURANCE_VAULT_SEED,
            BankVaultType::Fee => PDA_BANK_FEE_VAULT_SEED,
        }
    }
}

/// Authority of one of the group's vaults.
pub fn bank_vault_authority(
    program_id: &Pubkey,
    group: &Pubkey,
    vault_type: BankVaultType,
) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[vault_type.seed(), group.as_ref()], program_id)
}

/// Margin ratio kept as an exact decimal fraction, so that requirements of
/// round amounts stay round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarginRatio {
    numerator: I80F48,
    denominator: I80F48,
}

impl MarginRatio {
    const MAX_DIGITS: u32 = 18;

    pub fn from_decimal(ratio: &Decimal) -> Result<Self, DecimalError> {
        if ratio.is_negative() {
            return Err(DecimalError::FixedOverflow);
        }
        let mut magnitude = ratio.magnitude();
        let mut scale = ratio.scale();
        while scale > 0 && magnitude % 10 == 0 {
            magnitude /= 10;
            scale -= 1;
        }
        if scale > Self::MAX_DIGITS {
            let divisor = 10u128.pow(scale - Self::MAX_DIGITS);
            magnitude = (magnitude + divisor / 2) / divisor;
            scale = Self::MAX_DIGITS;
        }
        Ok(Self {
            numerator: I80F48::checked_from_num(magnitude).ok_or(DecimalError::FixedOverflow)?,
            denominator: I80F48::from_num(10u64.pow(scale)),
        })
    }

    pub fn to_fixed(&self) -> I80F48 {
        self.numerator / self.denominator
    }

    pub fn apply(&self, amount: I80F48) -> I80F48 {
        amount
            .checked_mul(self.numerator)
            .map(|product| product / self.denominator)
            .unwrap_or_else(|| amount * self.to_fixed())
    }

    /// `amount / ratio`, or None for a zero ratio.
    pub fn divide(&self, amount: I80F48) -> Option<I80F48> {
        if self.numerator.is_zero() {
            return None;
        }
        Some(
            amount
                .checked_mul(self.denominator)
                .map(|product| product / self.numerator)
                .unwrap_or_else(|| amount / self.to_fixed()),
        )
    }
}

/// Decoded collateral pool of a margin group.
#[derive(Clone, Debug, PartialEq)]
pub struct Bank {
    pub group: Pubkey,
    pub admin: Pubkey,
    pub mint: Pubkey,
    pub vault: Pubkey,
    pub decimals: u8,

    pub deposit_accumulator: I80F48,
    pub borrow_accumulator: I80F48,
    pub last_update: DateTime<Utc>,

    pub native_deposit_balance: I80F48,
    pub native_borrow_balance: I80F48,
    pub insurance_vault_balance: I80F48,
    pub fee_vault_balance: I80F48,
    pub account_deposit_limit: I80F48,

    pub init_margin_ratio: MarginRatio,
    pub maint_margin_ratio: MarginRatio,
    pub partial_liquidation_factor: I80F48,
}

impl Bank {
    pub fn from_data(
        group: Pubkey,
        admin: Pubkey,
        data: &BankData,
        policy: &RiskPolicy,
    ) -> Result<Self, DecimalError> {
        let decimals = policy.collateral_decimals;
        let native = |d: &Decimal| d.to_native_amount(decimals).map(I80F48::from_num::<i64>);
        Ok(Self {
            group,
            admin,
            mint: data.mint,
            vault: data.vault,
            decimals,
            deposit_accumulator: data.deposit_accumulator.to_fixed()?,
            borrow_accumulator: data.borrow_accumulator.to_fixed()?,
            last_update: Utc
                .timestamp_opt(data.last_update, 0)
                .single()
                .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH)),
            native_deposit_balance: native(&data.native_deposit_balance)?,
            native_borrow_balance: native(&data.native_borrow_balance)?,
            insurance_vault_balance: native(&data.insurance_vault_balance)?,
            fee_vault_balance: native(&data.fee_vault_balance)?,
            account_deposit_limit: native(&data.account_deposit_limit)?,
            init_margin_ratio: MarginRatio::from_decimal(&data.init_margin_ratio)?,
            maint_margin_ratio: MarginRatio::from_decimal(&data.maint_margin_ratio)?,
            partial_liquidation_factor: policy.partial_liquidation_factor,
        })
    }

    fn accumulator(&self, side: LendingSide) -> I80F48 {
        match side {
            LendingSide::Deposit => self.deposit_accumulator,
            LendingSide::Borrow => self.borrow_accumulator,
        }
    }

    /// Native amount owed or owned for a record.
    pub fn compute_native_amount(
        &self,
        record: &Decimal,
        side: LendingSide,
    ) -> Result<I80F48, DecimalError> {
        let record = I80F48::from_num(record.to_native_amount(self.decimals)?);
        Ok(record * self.accumulator(side))
    }

    /// Record that corresponds to a native amount right now.
    pub fn compute_record_amount(
        &self,
        amount: I80F48,
        side: LendingSide,
    ) -> Result<Decimal, DecimalError> {
        let accumulator = self.accumulator(side);
        if accumulator <= I80F48::ZERO {
            return Err(DecimalError::FixedOverflow);
        }
        let record = (amount / accumulator).round();
        let record = record
            .checked_to_num::<i64>()
            .ok_or(DecimalError::NativeOverflow {
                decimals: self.decimals,
            })?;
        Decimal::from_native(record, self.decimals)
    }

    pub fn margin_ratio(&self, requirement: MarginRequirement) -> I80F48 {
        let init = self.init_margin_ratio.to_fixed();
        let maint = self.maint_margin_ratio.to_fixed();
        match requirement {
            MarginRequirement::Init => init,
            MarginRequirement::Maint => maint,
            MarginRequirement::PartialLiquidation => {
                maint + self.partial_liquidation_factor * (init - maint)
            }
        }
    }

    /// `borrows * margin_ratio(requirement)`, exact for the stored ratios.
    pub fn margin_requirement(&self, borrows: I80F48, requirement: MarginRequirement) -> I80F48 {
        let init = self.init_margin_ratio.apply(borrows);
        let maint = self.maint_margin_ratio.apply(borrows);
        match requirement {
            MarginRequirement::Init => init,
            MarginRequirement::Maint => maint,
            MarginRequirement::PartialLiquidation => {
                maint + self.partial_liquidation_factor * (init - maint)
            }
        }
    }

    pub fn utilization(&self) -> I80F48 {
        if self.native_deposit_balance <= I80F48::ZERO {
            return I80F48::ZERO;
        }
        self.native_borrow_balance / self.native_deposit_balance
    }
}
