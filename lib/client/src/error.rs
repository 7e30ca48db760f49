use itertools::Itertools;
use solana_sdk::instruction::InstructionError;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::TransactionError;

use crate::utp::UtpIndex;

#[derive(Debug, thiserror::Error)]
pub enum MarginfiClientError {
    #[error("account belongs to group {found}, expected {expected}")]
    AccountGroupMismatch { expected: Pubkey, found: Pubkey },
    #[error("account {0} not found")]
    NotFound(Pubkey),
    #[error("utp {0} is not active")]
    UtpNotActive(UtpIndex),
    #[error("utp {0} is already active")]
    UtpAlreadyActive(UtpIndex),
    #[error("utp slot {0} has no supported venue")]
    UnsupportedUtp(usize),
    #[error("computed amount is not a valid native amount")]
    NaNAmount,
    #[error("account data is not a {0}")]
    InvalidDiscriminator(&'static str),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("Transaction simulation error. Error: {err:?}, Logs: {}",
        .logs.iter().join("; ")
    )]
    SendTransactionPreflightFailure {
        err: Option<TransactionError>,
        logs: Vec<String>,
    },
}

impl MarginfiClientError {
    /// The ledger's own error, when the rejection carried one.
    pub fn program_error(&self) -> Option<MarginfiProgramError> {
        match self {
            Self::SendTransactionPreflightFailure {
                err: Some(TransactionError::InstructionError(_, InstructionError::Custom(code))),
                ..
            } => MarginfiProgramError::from_code(*code),
            _ => None,
        }
    }
}

/// Classifies an error from a send: `Some` if the ledger rejected the transaction.
pub fn ledger_rejection(err: &anyhow::Error) -> Option<&MarginfiClientError> {
    err.downcast_ref::<MarginfiClientError>()
        .filter(|e| matches!(e, MarginfiClientError::SendTransactionPreflightFailure { .. }))
}

/// Custom error codes returned by the marginfi program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
pub enum MarginfiProgramError {
    #[error("Lending pool empty")]
    EmptyLendingPool = 6000,
    #[error("Illegal utilization ratio")]
    IllegalUtilizationRatio,
    #[error("Math error")]
    MathError,
    #[error("Invalid timestamp")]
    InvalidTimestamp,
    #[error("Initialization margin requirements not met")]
    InitMarginRequirementsNotMet,
    #[error("Inactive UTP")]
    UtpInactive,
    #[error("Utp is already active")]
    UtpAlreadyActive,
    #[error("ISI inspector: invalid program id")]
    IsiInvalidProgramId,
    #[error("Tx inspector: invalid instructions sysvar")]
    IsiInvalidSysvarId,
    #[error("Tx inspector: invalid instruction")]
    IsiInvalidIx,
    #[error("Tx inspector: invalid margin account")]
    IsiInvalidMarginAccount,
    #[error("Invalid account data")]
    InvalidAccountData,
    #[error("Liquidator has active utps")]
    LiquidatorHasActiveUtps,
    #[error("Margin account not liquidatable")]
    AccountNotLiquidatable,
    #[error("Margin account not bankrupt")]
    AccountNotBankrupt,
    #[error("Utp account cannot be deactivated")]
    IllegalUtpDeactivation,
    #[error("Drift error")]
    DriftError,
    #[error("Rebalance not legal")]
    IllegalRebalance,
    #[error("Illegal rebalance amount")]
    IllegalRebalanceAmount,
    #[error("Borrow not allowed")]
    BorrowNotAllowed,
    #[error("Config value not legal")]
    IllegalConfig,
    #[error("Operations paused")]
    OperationsPaused,
    #[error("Insufficient balance")]
    InsufficientVaultBalance,
    #[error("This operation is forbidden")]
    Forbidden,
    #[error("Mango error")]
    MangoError,
    #[error("Invalid account key")]
    InvalidUtpAccount,
    #[error("Account deposit limit reached")]
    AccountDepositLimit,
}

impl MarginfiProgramError {
    const ALL: [Self; 27] = [
        Self::EmptyLendingPool,
        Self::IllegalUtilizationRatio,
        Self::MathError,
        Self::InvalidTimestamp,
        Self::InitMarginRequirementsNotMet,
        Self::UtpInactive,
        Self::UtpAlreadyActive,
        Self::IsiInvalidProgramId,
        Self::IsiInvalidSysvarId,
        Self::IsiInvalidIx,
        Self::IsiInvalidMarginAccount,
        Self::InvalidAccountData,
        Self::LiquidatorHasActiveUtps,
        Self::AccountNotLiquidatable,
        Self::AccountNotBankrupt,
        Self::IllegalUtpDeactivation,
        Self::DriftError,
        Self::IllegalRebalance,
        Self::IllegalRebalanceAmount,
        Self::BorrowNotAllowed,
        Self::IllegalConfig,
        Self::OperationsPaused,
        Self::InsufficientVaultBalance,
        Self::Forbidden,
        Self::MangoError,
        Self::InvalidUtpAccount,
        Self::AccountDepositLimit,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// Rejections that just mean another actor got there first, or the
    /// account changed between read and send.
    pub fn is_expected_race(self) -> bool {
        matches!(
            self,
            Self::AccountNotLiquidatable
                | Self::AccountNotBankrupt
                | Self::IllegalRebalance
                | Self::IllegalRebalanceAmount
                | Self::UtpInactive
        )
    }
}
