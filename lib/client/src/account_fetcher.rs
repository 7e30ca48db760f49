use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use solana_client::nonblocking::rpc_client::RpcClient as RpcClientAsync;
use solana_sdk::account::{AccountSharedData, ReadableAccount};
use solana_sdk::pubkey::Pubkey;

use crate::error::MarginfiClientError;
use crate::gpa::fetch_program_accounts_by_discriminator;
use crate::state::LedgerAccount;
use crate::util::with_timeout;

#[async_trait::async_trait]
pub trait AccountFetcher: Sync + Send {
    async fn fetch_raw_account(&self, address: &Pubkey) -> anyhow::Result<AccountSharedData>;

    async fn fetch_program_accounts(
        &self,
        program: &Pubkey,
        discriminator: [u8; 8],
    ) -> anyhow::Result<Vec<(Pubkey, AccountSharedData)>>;
}

/// Fetches straight from rpc, bounding every request by `timeout`.
pub struct RpcAccountFetcher {
    pub rpc: RpcClientAsync,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl AccountFetcher for RpcAccountFetcher {
    async fn fetch_raw_account(&self, address: &Pubkey) -> anyhow::Result<AccountSharedData> {
        let response = with_timeout(
            self.timeout,
            "account fetch",
            self.rpc
                .get_account_with_commitment(address, self.rpc.commitment()),
        )
        .await?
        .with_context(|| format!("fetching account {address}"))?;
        response
            .value
            .map(Into::into)
            .ok_or_else(|| MarginfiClientError::NotFound(*address).into())
    }

    async fn fetch_program_accounts(
        &self,
        program: &Pubkey,
        discriminator: [u8; 8],
    ) -> anyhow::Result<Vec<(Pubkey, AccountSharedData)>> {
        with_timeout(
            self.timeout,
            "program account scan",
            fetch_program_accounts_by_discriminator(&self.rpc, program, discriminator, vec![]),
        )
        .await?
    }
}

// Generic over T, so it can't live in the object-safe trait.
pub async fn fetch_ledger_account<T: LedgerAccount>(
    fetcher: &dyn AccountFetcher,
    address: &Pubkey,
) -> anyhow::Result<T> {
    let account = fetcher.fetch_raw_account(address).await?;
    T::try_from_account_data(account.data())
        .with_context(|| format!("decoding account {address}"))
}

/// Serves accounts from memory; used to drive the client without a cluster.
#[derive(Default)]
pub struct InMemoryAccountFetcher {
    accounts: Mutex<HashMap<Pubkey, AccountSharedData>>,
    fetches: AtomicUsize,
}

impl InMemoryAccountFetcher {
    pub fn insert(&self, address: Pubkey, owner: Pubkey, data: Vec<u8>) {
        let mut account = AccountSharedData::new(1, 0, &owner);
        account.set_data(data);
        self.accounts.lock().unwrap().insert(address, account);
    }

    pub fn insert_ledger_account<T: LedgerAccount>(
        &self,
        address: Pubkey,
        owner: Pubkey,
        value: &T,
    ) -> anyhow::Result<()> {
        self.insert(address, owner, value.to_account_data()?);
        Ok(())
    }

    pub fn remove(&self, address: &Pubkey) {
        self.accounts.lock().unwrap().remove(address);
    }

    /// Number of single-account fetches served so far, found or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AccountFetcher for InMemoryAccountFetcher {
    async fn fetch_raw_account(&self, address: &Pubkey) -> anyhow::Result<AccountSharedData> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| MarginfiClientError::NotFound(*address).into())
    }

    async fn fetch_program_accounts(
        &self,
        program: &Pubkey,
        discriminator: [u8; 8],
    ) -> anyhow::Result<Vec<(Pubkey, AccountSharedData)>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a)| a.owner() == program && a.data().starts_with(&discriminator))
            .map(|(k, a)| (*k, a.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MarginAccountData, MarginGroupData};

    #[tokio::test]
    async fn test_in_memory_fetcher() -> anyhow::Result<()> {
        let fetcher = InMemoryAccountFetcher::default();
        let program = Pubkey::new_unique();
        let group = Pubkey::new_unique();
        let account = Pubkey::new_unique();
        fetcher.insert_ledger_account(group, program, &MarginGroupData::default())?;
        fetcher.insert_ledger_account(
            account,
            program,
            &MarginAccountData {
                margin_group: group,
                ..Default::default()
            },
        )?;

        let decoded: MarginAccountData = fetch_ledger_account(&fetcher, &account).await?;
        assert_eq!(decoded.margin_group, group);

        let scanned = fetcher
            .fetch_program_accounts(&program, MarginAccountData::discriminator())
            .await?;
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, account);

        assert!(fetch_ledger_account::<MarginAccountData>(&fetcher, &group)
            .await
            .is_err());

        fetcher.remove(&account);
        let err = fetcher.fetch_raw_account(&account).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MarginfiClientError>(),
            Some(MarginfiClientError::NotFound(a)) if *a == account
        ));
        Ok(())
    }
}
