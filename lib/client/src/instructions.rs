//! Builders for the marginfi program's own instructions.
//!
//! Utp specific instructions live with their venue in `crate::utp`.

use anchor_lang::solana_program::hash::hash;
use borsh::BorshSerialize;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{system_program, sysvar};

use crate::bank::{bank_vault_authority, BankVaultType};
use crate::utp::UtpIndex;

/// First 8 bytes of `sha256("global:<name>")`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash(format!("global:{name}").as_bytes()).to_bytes()[..8]);
    discriminator
}

pub fn instruction_data<T: BorshSerialize>(name: &str, args: &T) -> Vec<u8> {
    let mut data = instruction_discriminator(name).to_vec();
    args.serialize(&mut data)
        .expect("serializing into a vec cannot fail");
    data
}

pub(crate) fn readonly(pubkey: Pubkey) -> AccountMeta {
    AccountMeta::new_readonly(pubkey, false)
}

pub(crate) fn writable(pubkey: Pubkey) -> AccountMeta {
    AccountMeta::new(pubkey, false)
}

/// Addresses every margin account instruction is built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarginKeys {
    pub program_id: Pubkey,
    pub group: Pubkey,
    pub margin_account: Pubkey,
    pub authority: Pubkey,
    pub bank_vault: Pubkey,
}

impl MarginKeys {
    pub fn bank_authority(&self) -> Pubkey {
        bank_vault_authority(&self.program_id, &self.group, BankVaultType::Liquidity).0
    }

    fn instruction(&self, name: &str, args: &impl BorshSerialize, accounts: Vec<AccountMeta>) -> Instruction {
        Instruction {
            program_id: self.program_id,
            accounts,
            data: instruction_data(name, args),
        }
    }
}

pub fn init_margin_account(keys: &MarginKeys) -> Instruction {
    keys.instruction(
        "init_margin_account",
        &(),
        vec![
            AccountMeta::new(keys.authority, true),
            readonly(keys.group),
            writable(keys.margin_account),
            readonly(system_program::id()),
        ],
    )
}

pub fn margin_deposit_collateral(
    keys: &MarginKeys,
    funding_account: Pubkey,
    amount: u64,
) -> Instruction {
    keys.instruction(
        "margin_deposit_collateral",
        &amount,
        vec![
            writable(keys.margin_account),
            writable(keys.group),
            AccountMeta::new_readonly(keys.authority, true),
            writable(funding_account),
            writable(keys.bank_vault),
            readonly(anchor_spl::token::ID),
        ],
    )
}

pub fn margin_withdraw_collateral(
    keys: &MarginKeys,
    receiving_token_account: Pubkey,
    amount: u64,
) -> Instruction {
    keys.instruction(
        "margin_withdraw_collateral",
        &amount,
        vec![
            writable(keys.margin_account),
            writable(keys.group),
            AccountMeta::new_readonly(keys.authority, true),
            writable(keys.bank_vault),
            readonly(keys.bank_authority()),
            writable(receiving_token_account),
            readonly(sysvar::instructions::id()),
            readonly(anchor_spl::token::ID),
        ],
    )
}

/// `keys` describes the liquidator's own margin account.
pub fn liquidate(keys: &MarginKeys, liquidatee: Pubkey, utp: UtpIndex) -> Instruction {
    keys.instruction(
        "liquidate",
        &(utp as u64),
        vec![
            writable(keys.margin_account),
            writable(keys.group),
            AccountMeta::new(keys.authority, true),
            writable(liquidatee),
            readonly(sysvar::instructions::id()),
        ],
    )
}

pub fn deactivate_utp(keys: &MarginKeys, utp: UtpIndex) -> Instruction {
    keys.instruction(
        "deactivate_utp",
        &(utp as u64),
        vec![
            writable(keys.margin_account),
            AccountMeta::new_readonly(keys.authority, true),
            readonly(sysvar::instructions::id()),
        ],
    )
}

/// Needs the group admin as signer.
pub fn handle_bankruptcy(
    program_id: Pubkey,
    group: Pubkey,
    margin_account: Pubkey,
    admin: Pubkey,
) -> Instruction {
    Instruction {
        program_id,
        accounts: vec![
            writable(margin_account),
            writable(group),
            AccountMeta::new_readonly(admin, true),
            readonly(sysvar::instructions::id()),
        ],
        data: instruction_data("handle_bankruptcy", &()),
    }
}

pub fn update_interest_accumulator(program_id: Pubkey, group: Pubkey) -> Instruction {
    Instruction {
        program_id,
        accounts: vec![writable(group), readonly(sysvar::clock::id())],
        data: instruction_data("update_interest_accumulator", &()),
    }
}

pub fn verify_margin_requirements(keys: &MarginKeys) -> Instruction {
    keys.instruction(
        "verify_margin_requirements",
        &(),
        vec![readonly(keys.margin_account), readonly(keys.group)],
    )
}
