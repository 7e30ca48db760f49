use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anchor_client::Cluster;
use anyhow::Context;
use itertools::Itertools;
use solana_client::nonblocking::rpc_client::RpcClient as RpcClientAsync;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::{keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;

use crate::account_fetcher::RpcAccountFetcher;
use crate::error::MarginfiClientError;
use crate::util::with_timeout;

// anchor_client::Client has no accessors and isn't Clone
#[derive(Clone, Debug)]
pub struct Client {
    pub cluster: Cluster,
    pub fee_payer: Arc<Keypair>,
    pub commitment: CommitmentConfig,
    /// Bounds every rpc request and transaction confirmation.
    pub timeout: Duration,
    pub transaction_builder_config: TransactionBuilderConfig,
    pub rpc_send_transaction_config: RpcSendTransactionConfig,
}

impl Client {
    pub fn new(
        cluster: Cluster,
        commitment: CommitmentConfig,
        fee_payer: Arc<Keypair>,
        timeout: Duration,
        transaction_builder_config: TransactionBuilderConfig,
    ) -> Self {
        Self {
            cluster,
            fee_payer,
            commitment,
            timeout,
            transaction_builder_config,
            rpc_send_transaction_config: RpcSendTransactionConfig {
                preflight_commitment: Some(CommitmentLevel::Processed),
                ..Default::default()
            },
        }
    }

    pub fn rpc_async(&self) -> RpcClientAsync {
        RpcClientAsync::new_with_timeout_and_commitment(
            self.cluster.url().to_string(),
            self.timeout,
            self.commitment,
        )
    }

    pub fn account_fetcher(&self) -> RpcAccountFetcher {
        RpcAccountFetcher {
            rpc: self.rpc_async(),
            timeout: self.timeout,
        }
    }

    pub fn transaction_builder<'a>(
        &'a self,
        instructions: Vec<Instruction>,
        signers: Vec<&'a Keypair>,
    ) -> TransactionBuilder<'a> {
        TransactionBuilder {
            instructions,
            signers: [vec![&*self.fee_payer], signers].concat(),
            payer: self.fee_payer.pubkey(),
            config: self.transaction_builder_config,
        }
    }
}

/// Submits composed instruction lists to the ledger.
#[async_trait::async_trait]
pub trait TransactionSender: Sync + Send {
    /// Sends one transaction and waits for confirmation. The fee payer signs
    /// in addition to `signers`.
    async fn send_and_confirm(
        &self,
        instructions: Vec<Instruction>,
        signers: &[&Keypair],
    ) -> anyhow::Result<Signature>;

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> anyhow::Result<u64>;
}

#[async_trait::async_trait]
impl TransactionSender for Client {
    async fn send_and_confirm(
        &self,
        instructions: Vec<Instruction>,
        signers: &[&Keypair],
    ) -> anyhow::Result<Signature> {
        self.transaction_builder(instructions, signers.to_vec())
            .send_and_confirm(self)
            .await
    }

    async fn minimum_balance_for_rent_exemption(&self, data_len: usize) -> anyhow::Result<u64> {
        with_timeout(
            self.timeout,
            "rent exemption query",
            self.rpc_async().get_minimum_balance_for_rent_exemption(data_len),
        )
        .await?
        .context("fetching rent exemption")
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TransactionBuilderConfig {
    // adds a SetComputeUnitPrice instruction in front
    pub prioritization_micro_lamports: Option<u64>,
    // adds a SetComputeUnitLimit instruction in front
    pub compute_unit_limit: Option<u32>,
}

pub struct TransactionBuilder<'a> {
    pub instructions: Vec<Instruction>,
    pub signers: Vec<&'a Keypair>,
    pub payer: Pubkey,
    pub config: TransactionBuilderConfig,
}

impl<'a> TransactionBuilder<'a> {
    pub fn transaction_with_blockhash(
        mut self,
        blockhash: Hash,
    ) -> anyhow::Result<VersionedTransaction> {
        use solana_sdk::compute_budget::ComputeBudgetInstruction;
        if let Some(limit) = self.config.compute_unit_limit {
            self.instructions
                .insert(0, ComputeBudgetInstruction::set_compute_unit_limit(limit));
        }
        if let Some(prio_price) = self.config.prioritization_micro_lamports {
            self.instructions
                .insert(0, ComputeBudgetInstruction::set_compute_unit_price(prio_price));
        }
        let message = solana_sdk::message::v0::Message::try_compile(
            &self.payer,
            &self.instructions,
            &[],
            blockhash,
        )?;
        let signers = self
            .signers
            .into_iter()
            .unique_by(|s| s.pubkey())
            .collect::<Vec<_>>();
        Ok(VersionedTransaction::try_new(
            solana_sdk::message::VersionedMessage::V0(message),
            &signers,
        )?)
    }

    pub async fn send_and_confirm(self, client: &Client) -> anyhow::Result<Signature> {
        let rpc = client.rpc_async();
        let blockhash = with_timeout(client.timeout, "blockhash fetch", rpc.get_latest_blockhash())
            .await??;
        let tx = self.transaction_with_blockhash(blockhash)?;
        with_timeout(
            client.timeout,
            "transaction confirmation",
            rpc.send_and_confirm_transaction(&tx),
        )
        .await?
        .map_err(prettify_solana_client_error)
    }
}

/// Unpacks preflight failures so the program logs and error code survive.
///
/// solana's RpcResponseError only prints "[N log messages]" otherwise.
pub fn prettify_solana_client_error(
    err: solana_client::client_error::ClientError,
) -> anyhow::Error {
    use solana_client::client_error::ClientErrorKind;
    use solana_client::rpc_request::{RpcError, RpcResponseErrorData};
    if let ClientErrorKind::RpcError(RpcError::RpcResponseError {
        data: RpcResponseErrorData::SendTransactionPreflightFailure(s),
        ..
    }) = err.kind()
    {
        return MarginfiClientError::SendTransactionPreflightFailure {
            err: s.err.clone(),
            logs: s.logs.clone().unwrap_or_default(),
        }
        .into();
    }
    if let Some(tx_err) = err.get_transaction_error() {
        return MarginfiClientError::SendTransactionPreflightFailure {
            err: Some(tx_err),
            logs: vec![],
        }
        .into();
    }
    err.into()
}

/// Reads a keypair given as base58, as json bytes or as a path.
pub fn keypair_from_cli(keypair: &str) -> anyhow::Result<Keypair> {
    if let Some(keypair) = bs58::decode(keypair)
        .into_vec()
        .ok()
        .and_then(|bytes| Keypair::from_bytes(&bytes).ok())
    {
        return Ok(keypair);
    }
    if let Ok(keypair) = keypair::read_keypair(&mut keypair.as_bytes()) {
        return Ok(keypair);
    }
    let path = std::path::PathBuf::from_str(&shellexpand::tilde(keypair))?;
    keypair::read_keypair_file(&path)
        .map_err(|e| anyhow::anyhow!("failed to read keypair from {}: {e}", path.display()))
}

/// Accepts a base58 pubkey or anything `keypair_from_cli` accepts.
pub fn pubkey_from_cli(pubkey: &str) -> anyhow::Result<Pubkey> {
    match Pubkey::from_str(pubkey) {
        Ok(p) => Ok(p),
        Err(_) => Ok(keypair_from_cli(pubkey)?.pubkey()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_prepends_budget_instructions() -> anyhow::Result<()> {
        let payer = Keypair::new();
        let other = Keypair::new();
        let ix = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![solana_sdk::instruction::AccountMeta::new(other.pubkey(), true)],
            data: vec![1, 2, 3],
        };
        let builder = TransactionBuilder {
            instructions: vec![ix],
            // payer twice on purpose
            signers: vec![&payer, &other, &payer],
            payer: payer.pubkey(),
            config: TransactionBuilderConfig {
                prioritization_micro_lamports: Some(5),
                compute_unit_limit: Some(400_000),
            },
        };
        let tx = builder.transaction_with_blockhash(Hash::default())?;
        assert_eq!(tx.message.instructions().len(), 3);
        assert_eq!(tx.signatures.len(), 2);
        assert_eq!(tx.message.static_account_keys()[0], payer.pubkey());
        Ok(())
    }

    #[test]
    fn test_pubkey_from_cli() -> anyhow::Result<()> {
        let key = Pubkey::new_unique();
        assert_eq!(pubkey_from_cli(&key.to_string())?, key);

        let keypair = Keypair::new();
        let json = format!("{:?}", keypair.to_bytes().to_vec());
        assert_eq!(pubkey_from_cli(&json)?, keypair.pubkey());

        assert!(keypair_from_cli("/nonexistent/id.json").is_err());
        Ok(())
    }
}
