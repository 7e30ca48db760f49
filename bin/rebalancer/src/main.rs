use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anchor_client::Cluster;
use clap::Parser;
use marginfi_client::error_tracking::ErrorTracking;
use marginfi_client::{
    gpa, keypair_from_cli, AccountFetcher, Client, MarginAccount, MarginfiConfig,
    TransactionBuilderConfig, TransactionSender,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tracing::*;

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[clap()]
struct CliDotenv {
    // When --dotenv <file> is passed, read the specified dotenv file before parsing args
    #[clap(long)]
    dotenv: std::path::PathBuf,

    remaining_args: Vec<std::ffi::OsString>,
}

#[derive(Parser)]
#[clap()]
struct Cli {
    #[clap(short, long, env)]
    rpc_url: String,

    /// marginfi config file with program, group and venue addresses
    #[clap(long, env = "MARGINFI_CONFIG")]
    config: String,

    #[clap(long, env)]
    owner: String,

    /// accounts to keep balanced; all accounts of the owner in the group when empty
    #[clap(long, env, value_delimiter = ',')]
    margin_accounts: Option<Vec<Pubkey>>,

    /// group admin keypair; without it bankrupt accounts are only reported
    #[clap(long, env)]
    admin: Option<String>,

    #[clap(long, env, default_value = "30")]
    interval_secs: u64,

    #[clap(long, env, default_value = "0")]
    prioritization_micro_lamports: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ErrorType {
    Load,
    Rebalance,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Rebalance => write!(f, "rebalance"),
        }
    }
}

struct Rebalancer {
    config: MarginfiConfig,
    sender: Arc<dyn TransactionSender>,
    account_fetcher: Arc<dyn AccountFetcher>,
    owner: Arc<Keypair>,
    admin: Option<Keypair>,
    accounts: HashMap<Pubkey, MarginAccount>,
    errors: ErrorTracking<ErrorType, Pubkey>,
}

impl Rebalancer {
    /// Loads accounts that aren't tracked yet.
    async fn track(&mut self, addresses: Vec<Pubkey>) {
        let now = Instant::now();
        for address in addresses {
            if self.accounts.contains_key(&address)
                || self.errors.should_skip(ErrorType::Load, &address, now).is_some()
            {
                continue;
            }
            match MarginAccount::load(
                self.config.clone(),
                self.sender.clone(),
                self.account_fetcher.clone(),
                self.owner.clone(),
                address,
            )
            .await
            {
                Ok(account) => {
                    info!(%address, "tracking margin account");
                    self.accounts.insert(address, account);
                }
                Err(err) => {
                    error!(%address, "loading margin account: {err:?}");
                    self.errors
                        .record_failure(ErrorType::Load, &address, err.to_string(), now);
                }
            }
        }
    }

    async fn run_once(&mut self) {
        let now = Instant::now();
        self.errors.update(now);
        let admin = self.admin.as_ref();
        for (address, account) in self.accounts.iter_mut() {
            if self
                .errors
                .should_skip(ErrorType::Rebalance, address, now)
                .is_some()
            {
                continue;
            }
            match rebalance_account(account, admin).await {
                Ok(()) => self.errors.record_success(ErrorType::Rebalance, address),
                Err(err) => {
                    error!(%address, "rebalancing: {err:?}");
                    self.errors
                        .record_failure(ErrorType::Rebalance, address, err.to_string(), now);
                }
            }
        }
    }
}

async fn rebalance_account(account: &mut MarginAccount, admin: Option<&Keypair>) -> anyhow::Result<()> {
    account.reload().await?;
    let outcome = account.check_rebalance().await?;
    if !outcome.failed_deposits.is_empty() {
        warn!(address = %account.address, failed = ?outcome.failed_deposits, "some rebalance deposits failed");
    }
    if let Some(index) = outcome.failed_withdraw {
        warn!(address = %account.address, utp = %index, "rebalance withdraw failed");
    }
    account.check_bankruptcy(admin).await?;
    if !account.snapshot().check_freshness() {
        debug!(address = %account.address, "observations not fresh after rebalance");
    }
    Ok(())
}

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
    let owner = Arc::new(keypair_from_cli(&cli.owner)?);
    let admin = cli.admin.as_deref().map(keypair_from_cli).transpose()?;

    let client = Client::new(
        Cluster::Custom(cli.rpc_url.clone(), cli.rpc_url.replace("https", "wss")),
        CommitmentConfig::confirmed(),
        owner.clone(),
        config.rpc_timeout(),
        TransactionBuilderConfig {
            prioritization_micro_lamports: (cli.prioritization_micro_lamports > 0)
                .then_some(cli.prioritization_micro_lamports),
            compute_unit_limit: None,
        },
    );
    let rpc = client.rpc_async();

    let mut rebalancer = Rebalancer {
        config: config.clone(),
        sender: Arc::new(client.clone()),
        account_fetcher: Arc::new(client.account_fetcher()),
        owner: owner.clone(),
        admin,
        accounts: HashMap::new(),
        errors: ErrorTracking::builder()
            .skip_threshold(3)
            .skip_duration(Duration::from_secs(300))
            .build()?,
    };

    info!(owner = %owner.pubkey(), group = %config.group, "main loop");

    let mut interval = marginfi_client::delay_interval(Duration::from_secs(cli.interval_secs));
    loop {
        interval.tick().await;

        let addresses = match &cli.margin_accounts {
            Some(addresses) => addresses.clone(),
            None => match gpa::fetch_margin_accounts(
                &rpc,
                config.program_id,
                config.group,
                Some(owner.pubkey()),
            )
            .await
            {
                Ok(accounts) => accounts.into_iter().map(|(address, _)| address).collect(),
                Err(err) => {
                    error!("fetching owned margin accounts: {err:?}");
                    continue;
                }
            },
        };
        rebalancer.track(addresses).await;
        rebalancer.run_once().await;
    }
}
