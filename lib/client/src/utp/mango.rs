use anchor_spl::token::spl_token;
use borsh::BorshSerialize;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{system_program, sysvar};

use crate::config::MangoConfig;
use crate::instructions::{instruction_data, readonly, writable, MarginKeys};
use crate::state::UtpAccountConfig;

use super::utp_authority;

/// Mango accounts of a utp authority live at this account number.
pub const MANGO_ACCOUNT_NUMBER: u64 = 0;

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MangoSide {
    Bid,
    Ask,
}

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MangoOrderType {
    Limit,
    ImmediateOrCancel,
    PostOnly,
    Market,
    PostOnlySlide,
}

#[derive(BorshSerialize, Clone, Copy, Debug, PartialEq)]
pub struct PlacePerpOrderArgs {
    pub side: MangoSide,
    pub price: i64,
    pub max_base_quantity: i64,
    pub max_quote_quantity: i64,
    pub client_order_id: u64,
    pub order_type: MangoOrderType,
    pub reduce_only: bool,
    pub expiry_timestamp: Option<u64>,
    pub limit: u8,
}

/// Accounts of one mango perp market.
#[derive(Clone, Copy, Debug)]
pub struct PerpMarketKeys {
    pub market: Pubkey,
    pub bids: Pubkey,
    pub asks: Pubkey,
    pub event_queue: Pubkey,
}

pub fn mango_account_address(mango: &MangoConfig, utp_authority: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[
            mango.group.as_ref(),
            utp_authority.as_ref(),
            &MANGO_ACCOUNT_NUMBER.to_le_bytes(),
        ],
        &mango.program_id,
    )
    .0
}

pub fn observation_accounts(config: &UtpAccountConfig, mango: &MangoConfig) -> Vec<AccountMeta> {
    vec![
        readonly(config.address),
        readonly(mango.group),
        readonly(mango.cache),
    ]
}

/// Returns the activation instruction and the new mango account.
pub fn activate(keys: &MarginKeys, mango: &MangoConfig, authority_seed: Pubkey) -> (Instruction, Pubkey) {
    let (authority, authority_bump) =
        utp_authority(&keys.program_id, &mango.program_id, &authority_seed);
    let mango_account = mango_account_address(mango, &authority);
    let ix = Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            readonly(keys.group),
            AccountMeta::new(keys.authority, true),
            writable(authority),
            writable(mango_account),
            readonly(mango.program_id),
            writable(mango.group),
            readonly(system_program::id()),
        ],
        data: instruction_data("utp_mango_activate", &(authority_seed, authority_bump)),
    };
    (ix, mango_account)
}

pub fn observe(keys: &MarginKeys, config: &UtpAccountConfig, mango: &MangoConfig) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            writable(keys.margin_account),
            writable(config.address),
            readonly(mango.program_id),
            readonly(mango.group),
            readonly(mango.cache),
        ],
        data: instruction_data("utp_mango_observe", &()),
    }
}

pub fn deposit(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    mango: &MangoConfig,
    authority: Pubkey,
    proxy_token_account: Pubkey,
    amount: u64,
    crank: bool,
) -> Instruction {
    let name = if crank {
        "utp_mango_deposit_crank"
    } else {
        "utp_mango_deposit"
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
            readonly(mango.program_id),
            readonly(mango.group),
            readonly(mango.cache),
            readonly(mango.root_bank),
            writable(mango.node_bank),
            writable(mango.vault),
            readonly(sysvar::instructions::id()),
            readonly(spl_token::ID),
        ],
        data: instruction_data(name, &amount),
    }
}

pub fn withdraw(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    mango: &MangoConfig,
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
            readonly(mango.program_id),
            readonly(mango.group),
            readonly(mango.cache),
            readonly(mango.root_bank),
            writable(mango.node_bank),
            writable(mango.vault),
            readonly(mango.signer),
            readonly(spl_token::ID),
        ],
        data: instruction_data("utp_mango_withdraw", &amount),
    }
}

pub fn place_perp_order(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    mango: &MangoConfig,
    authority: Pubkey,
    market: &PerpMarketKeys,
    args: &PlacePerpOrderArgs,
) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            readonly(keys.margin_account),
            AccountMeta::new(keys.authority, true),
            readonly(authority),
            writable(config.address),
            readonly(mango.program_id),
            readonly(mango.group),
            readonly(mango.cache),
            writable(market.market),
            writable(market.bids),
            writable(market.asks),
            writable(market.event_queue),
            readonly(sysvar::instructions::id()),
        ],
        data: instruction_data("utp_mango_use_place_perp_order", args),
    }
}

pub fn cancel_perp_order(
    keys: &MarginKeys,
    config: &UtpAccountConfig,
    mango: &MangoConfig,
    authority: Pubkey,
    market: &PerpMarketKeys,
    order_id: i128,
    invalid_id_ok: bool,
) -> Instruction {
    Instruction {
        program_id: keys.program_id,
        accounts: vec![
            readonly(keys.margin_account),
            AccountMeta::new(keys.authority, true),
            readonly(authority),
            writable(config.address),
            readonly(mango.program_id),
            readonly(mango.group),
            writable(market.market),
            writable(market.bids),
            writable(market.asks),
            readonly(sysvar::instructions::id()),
        ],
        data: instruction_data("utp_mango_use_cancel_perp_order", &(order_id, invalid_id_ok)),
    }
}
