use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::rpc_client::RpcClient as RpcClientAsync;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::account::{AccountSharedData, ReadableAccount};
use solana_sdk::pubkey::Pubkey;

use crate::state::{
    LedgerAccount, MarginAccountData, MARGIN_ACCOUNT_AUTHORITY_OFFSET,
    MARGIN_ACCOUNT_GROUP_OFFSET,
};

pub(crate) async fn fetch_program_accounts_by_discriminator(
    rpc: &RpcClientAsync,
    program: &Pubkey,
    discriminator: [u8; 8],
    filters: Vec<RpcFilterType>,
) -> anyhow::Result<Vec<(Pubkey, AccountSharedData)>> {
    let account_type_filter = RpcFilterType::Memcmp(Memcmp::new_raw_bytes(0, discriminator.to_vec()));
    let config = RpcProgramAccountsConfig {
        filters: Some([vec![account_type_filter], filters].concat()),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            ..RpcAccountInfoConfig::default()
        },
        ..RpcProgramAccountsConfig::default()
    };
    Ok(rpc
        .get_program_accounts_with_config(program, config)
        .await?
        .into_iter()
        .map(|(key, account)| (key, account.into()))
        .collect())
}

fn margin_account_filters(group: Pubkey, authority: Option<Pubkey>) -> Vec<RpcFilterType> {
    let mut filters = vec![RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
        MARGIN_ACCOUNT_GROUP_OFFSET,
        group.to_bytes().to_vec(),
    ))];
    if let Some(authority) = authority {
        filters.push(RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
            MARGIN_ACCOUNT_AUTHORITY_OFFSET,
            authority.to_bytes().to_vec(),
        )));
    }
    filters
}

/// All margin accounts of `group`, optionally only those owned by `authority`.
pub async fn fetch_margin_accounts(
    rpc: &RpcClientAsync,
    program: Pubkey,
    group: Pubkey,
    authority: Option<Pubkey>,
) -> anyhow::Result<Vec<(Pubkey, MarginAccountData)>> {
    fetch_program_accounts_by_discriminator(
        rpc,
        &program,
        MarginAccountData::discriminator(),
        margin_account_filters(group, authority),
    )
    .await?
    .into_iter()
    .map(|(key, account)| Ok((key, MarginAccountData::try_from_account_data(account.data())?)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_account_filters() {
        let group = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        assert_eq!(margin_account_filters(group, None).len(), 1);

        let filters = margin_account_filters(group, Some(authority));
        assert_eq!(
            filters[1],
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(8, authority.to_bytes().to_vec()))
        );
        assert_eq!(
            filters[0],
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(40, group.to_bytes().to_vec()))
        );
    }
}
