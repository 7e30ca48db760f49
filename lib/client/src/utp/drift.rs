use anchor_spl::token::spl_token;
use borsh::BorshSerialize;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{system_program, sysvar};

use crate::config::DriftConfig;
use crate::instructions::{instruction_data, readonly, writable, MarginKeys};
use crate::state::UtpAccountConfig;

use super::utp_authority;

/// Slot of the drift user positions account in the utp address book.
pub const USER_POSITIONS_ADDRESS_INDEX: usize = 0;

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(BorshSerialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalAccounts {
    pub discount_token: bool,
    pub referrer: bool,
}

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenPositionArgs {
    pub direction: PositionDirection,
    pub quote_asset_amount: u128,
    pub market_index: u64,
    pub limit_price: u128,
    pub optional_accounts: OptionalAccounts,
}

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosePositionArgs {
    pub market_index: u64,
    pub optional_accounts: OptionalAccounts,
}

pub fn user_address(drift: &DriftConfig, utp_authority: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[b"user", utp_authority.as_ref()], &drift.program_id).0
}

fn user_positions(config: &UtpAccountConfig) -> Pubkey {
    config.utp_address_book[USER_POSITIONS_ADDRESS_INDEX]
}

pub fn observation_accounts(config: &UtpAccountConfig, drift: &DriftConfig) -> Vec<AccountMeta> {
    vec![
        readonly(config.address),
        readonly(user_positions(config)),
        readonly(drift.markets),
    ]
}

/// Returns the activation instruction and the new drift user. The
/// `user_positions` account is created by the instruction and must sign.
pub fn activate(
    keys: &MarginKeys,
    drift: &DriftConfig,
    authority_seed: Pubkey,
    user_positions: Pubkey,
) -> (Instruction, Pubkey) {
    let (authority, authority_bump) =
        utp_authority(&keys.program_id, &drift.program_id, &authority_seed);
    let user = user_address(drift, &authority);
    let ix = Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            readonly(keys.group),
            AccountMeta::new(keys.authority, true),
            readonly(authority),
            readonly(drift.program_id),
            readonly(drift.state),
            writable(user),
            AccountMeta::new(user_positions, true),
            readonly(sysvar::rent::id()),
            readonly(system_program::id()),
        ],
        data: instruction_data("utp_drift_activate", &(authority_seed, authority_bump)),
    };
    (ix, user)
}

pub fn observe(keys: &MarginKeys, config: &UtpAccountConfig, drift: &DriftConfig) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            writable(config.address),
            writable(user_positions(config)),
            readonly(drift.markets),
        ],
        data: instruction_data("utp_drift_observe", &()),
    }
}

pub fn deposit(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    drift: &DriftConfig,
    authority: Pubkey,
    proxy_token_account: Pubkey,
    amount: u64,
    crank: bool,
) -> Instruction {
    let name = if crank {
        "utp_drift_deposit_crank"
    } else {
        "utp_drift_deposit"
    };
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            writable(keys.group),
            AccountMeta::new(keys.authority, true),
            writable(keys.bank_vault),
            readonly(keys.bank_authority()),
            writable(proxy_token_account),
            readonly(authority),
            writable(config.address),
            readonly(drift.program_id),
            writable(drift.state),
            writable(user_positions(config)),
            writable(drift.collateral_vault),
            readonly(drift.markets),
            writable(drift.deposit_history),
            writable(drift.funding_payment_history),
            readonly(sysvar::instructions::id()),
            readonly(spl_token::ID),
            readonly(system_program::id()),
        ],
        data: instruction_data(name, &amount),
    }
}

pub fn withdraw(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    drift: &DriftConfig,
    authority: Pubkey,
    amount: u64,
) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            writable(keys.group),
            AccountMeta::new_readonly(keys.authority, true),
            writable(keys.bank_vault),
            readonly(authority),
            writable(config.address),
            readonly(drift.program_id),
            writable(drift.state),
            writable(user_positions(config)),
            writable(drift.collateral_vault),
            readonly(drift.collateral_vault_authority),
            writable(drift.insurance_vault),
            readonly(drift.insurance_vault_authority),
            readonly(drift.markets),
            writable(drift.deposit_history),
            writable(drift.funding_payment_history),
            readonly(spl_token::ID),
            readonly(system_program::id()),
        ],
        data: instruction_data("utp_drift_withdraw", &amount),
    }
}

fn trade_accounts(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    drift: &DriftConfig,
    authority: Pubkey,
    oracle: Pubkey,
) -> Vec<AccountMeta> {
    vec![
        readonly(keys.margin_account),
        AccountMeta::new_readonly(keys.authority, true),
        readonly(authority),
        writable(config.address),
        readonly(drift.program_id),
        writable(drift.state),
        writable(drift.markets),
        writable(user_positions(config)),
        writable(drift.trade_history),
        writable(drift.funding_payment_history),
        writable(drift.funding_rate_history),
        readonly(oracle),
        readonly(sysvar::instructions::id()),
    ]
}

pub fn open_position(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    drift: &DriftConfig,
    authority: Pubkey,
    oracle: Pubkey,
    args: &OpenPositionArgs,
) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: trade_accounts(keys, config, drift, authority, oracle),
        data: instruction_data("utp_drift_use_open_position", args),
    }
}

pub fn close_position(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    drift: &DriftConfig,
    authority: Pubkey,
    oracle: Pubkey,
    args: &ClosePositionArgs,
) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: trade_accounts(keys, config, drift, authority, oracle),
        data: instruction_data("utp_drift_use_close_position", args),
    }
}
