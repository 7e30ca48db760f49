use std::sync::Arc;
use std::time::{Duration, Instant};

use anchor_client::Cluster;
use clap::Parser;
use marginfi_client::error_tracking::ErrorTracking;
use marginfi_client::{
    gpa, instructions, keypair_from_cli, AccountFetcher, Client, MarginAccount, MarginfiConfig,
    TransactionBuilderConfig, TransactionSender,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signer::Signer;
use tracing::*;

use crate::cli_args::{BoolArg, Cli, CliDotenv};
use crate::liquidation_state::{LiqErrorType, LiquidationState};

pub mod cli_args;
mod liquidation_state;

// jemalloc seems to be better at keeping the memory footprint reasonable over
// longer periods of time
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    marginfi_client::tracing_subscriber_init();

    let args: Vec<std::ffi::OsString> = if let Ok(cli_dotenv) = CliDotenv::try_parse() {
        dotenv::from_path(cli_dotenv.dotenv)?;
        std::env::args_os()
            .take(1)
            .chain(cli_dotenv.remaining_args.into_iter())
            .collect()
    } else {
        dotenv::dotenv().ok();
        std::env::args_os().collect()
    };
    let cli = Cli::parse_from(args);

    let config = MarginfiConfig::load(&cli.config)?;
    let liquidator_owner = Arc::new(keypair_from_cli(&cli.liquidator_owner)?);
    let admin = cli
        .admin
        .as_deref()
        .map(keypair_from_cli)
        .transpose()?
        .map(Arc::new);

    //
    // Client setup
    //
    let rpc_url = cli.rpc_url.clone();
    let ws_url = rpc_url.replace("https", "wss");
    let client = Client::new(
        Cluster::Custom(rpc_url, ws_url),
        CommitmentConfig::confirmed(),
        liquidator_owner.clone(),
        config.rpc_timeout(),
        TransactionBuilderConfig {
            prioritization_micro_lamports: (cli.prioritization_micro_lamports > 0)
                .then_some(cli.prioritization_micro_lamports),
            compute_unit_limit: Some(cli.compute_limit_for_liquidation),
        },
    );
    let rpc = client.rpc_async();
    let sender: Arc<dyn TransactionSender> = Arc::new(client.clone());
    let account_fetcher: Arc<dyn AccountFetcher> = Arc::new(client.account_fetcher());

    let liquidator = MarginAccount::load(
        config.clone(),
        sender.clone(),
        account_fetcher.clone(),
        liquidator_owner.clone(),
        cli.liquidator_margin_account,
    )
    .await?;
    if liquidator.snapshot().active_utps().next().is_some() {
        anyhow::bail!(
            "liquidator account {} has active utps, deactivate them first",
            liquidator.address
        );
    }
    if admin.is_none() {
        warn!("no admin key, bankrupt accounts will only be reported");
    }

    let mut liquidation = LiquidationState {
        liquidator,
        sender: sender.clone(),
        account_fetcher,
        config: config.clone(),
        admin,
        errors: ErrorTracking::builder()
            .skip_threshold(cli.skip_threshold)
            .threshold_for(LiqErrorType::Bankruptcy, 1)
            .skip_duration(Duration::from_secs(cli.skip_duration_secs))
            .build()?,
    };

    info!(
        liquidator = %cli.liquidator_margin_account,
        owner = %liquidator_owner.pubkey(),
        group = %config.group,
        "main loop"
    );

    let mut interval = marginfi_client::delay_interval(Duration::from_millis(cli.check_interval_ms));
    loop {
        interval.tick().await;

        if cli.crank_interest == BoolArg::True {
            let ix = instructions::update_interest_accumulator(config.program_id, config.group);
            let signers = [liquidator_owner.as_ref()];
            match sender.send_and_confirm(vec![ix], &signers).await {
                Ok(txsig) => debug!(%txsig, "updated interest accumulator"),
                Err(err) => warn!("updating interest accumulator: {err:?}"),
            }
        }

        let accounts =
            match gpa::fetch_margin_accounts(&rpc, config.program_id, config.group, None).await {
                Ok(accounts) => accounts,
                Err(err) => {
                    error!("fetching margin accounts: {err:?}");
                    continue;
                }
            };

        liquidation.errors.update(Instant::now());

        let started = Instant::now();
        let count = accounts.len();
        let acted = liquidation
            .scan(accounts.into_iter().map(|(address, _)| address).collect())
            .await;
        debug!(
            count,
            acted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scanned margin accounts"
        );
    }
}
