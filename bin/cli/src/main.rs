use std::str::FromStr;
use std::sync::Arc;

use anchor_client::Cluster;
use clap::{Args, Parser, Subcommand};
use marginfi_client::{
    bank_vault_authority, fetch_snapshot, gpa, keypair_from_cli, pubkey_from_cli, utp, BankVaultType,
    Client, MarginAccount, MarginfiConfig, ObservationLog, TransactionBuilderConfig, UtpIndex,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::Keypair;

#[derive(Parser, Debug, Clone)]
#[clap()]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct Rpc {
    #[clap(short, long, env = "RPC_URL", default_value = "d")]
    url: String,

    /// marginfi config file with program, group and venue addresses
    #[clap(long, env = "MARGINFI_CONFIG", default_value = "~/.config/marginfi/config.toml")]
    config: String,

    #[clap(long, env, default_value = "5")]
    prioritization_micro_lamports: u64,
}

#[derive(Args, Debug, Clone)]
struct AccountArgs {
    #[clap(long)]
    account: String,

    /// also pays for everything
    #[clap(short, long, env = "MARGINFI_OWNER")]
    owner: String,

    #[clap(flatten)]
    rpc: Rpc,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Prints the health report of a margin account
    Health {
        #[clap(long)]
        account: String,

        #[clap(flatten)]
        rpc: Rpc,
    },
    /// Lists the group's margin accounts, optionally only those of one owner
    ListAccounts {
        #[clap(long)]
        owner: Option<String>,

        #[clap(flatten)]
        rpc: Rpc,
    },
    CreateAccount {
        #[clap(short, long, env = "MARGINFI_OWNER")]
        owner: String,

        #[clap(flatten)]
        rpc: Rpc,
    },
    /// Deposits collateral from the owner's associated token account
    Deposit {
        #[clap(flatten)]
        account: AccountArgs,

        /// native amount
        #[clap(short, long)]
        amount: u64,
    },
    Withdraw {
        #[clap(flatten)]
        account: AccountArgs,

        /// native amount
        #[clap(short, long)]
        amount: u64,
    },
    ActivateUtp {
        #[clap(flatten)]
        account: AccountArgs,

        #[clap(long)]
        utp: UtpIndex,
    },
    DeactivateUtp {
        #[clap(flatten)]
        account: AccountArgs,

        #[clap(long)]
        utp: UtpIndex,
    },
    UtpDeposit {
        #[clap(flatten)]
        account: AccountArgs,

        #[clap(long)]
        utp: UtpIndex,

        /// native amount
        #[clap(short, long)]
        amount: u64,
    },
    UtpWithdraw {
        #[clap(flatten)]
        account: AccountArgs,

        #[clap(long)]
        utp: UtpIndex,

        /// native amount
        #[clap(short, long)]
        amount: u64,
    },
    /// Refreshes the cached health of one or all active utps
    Observe {
        #[clap(flatten)]
        account: AccountArgs,

        #[clap(long)]
        utp: Option<UtpIndex>,
    },
    /// Prints the addresses derived for a margin account
    Addresses {
        #[clap(long)]
        account: String,

        #[clap(flatten)]
        rpc: Rpc,
    },
}

impl Rpc {
    fn config(&self) -> anyhow::Result<MarginfiConfig> {
        MarginfiConfig::load(&self.config)
    }

    fn client(&self, config: &MarginfiConfig, fee_payer: Arc<Keypair>) -> anyhow::Result<Client> {
        Ok(Client::new(
            Cluster::from_str(&self.url)?,
            CommitmentConfig::confirmed(),
            fee_payer,
            config.rpc_timeout(),
            TransactionBuilderConfig {
                prioritization_micro_lamports: Some(self.prioritization_micro_lamports),
                compute_unit_limit: Some(400_000),
            },
        ))
    }
}

impl AccountArgs {
    async fn load(&self) -> anyhow::Result<MarginAccount> {
        let config = self.rpc.config()?;
        let owner = Arc::new(keypair_from_cli(&self.owner)?);
        let address = pubkey_from_cli(&self.account)?;
        let client = self.rpc.client(&config, owner.clone())?;
        let account_fetcher = Arc::new(client.account_fetcher());
        MarginAccount::load(config, Arc::new(client), account_fetcher, owner, address).await
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    marginfi_client::tracing_subscriber_init();

    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Health { account, rpc } => {
            let config = rpc.config()?;
            let client = rpc.client(&config, Arc::new(Keypair::new()))?;
            let address = pubkey_from_cli(&account)?;
            let snapshot = fetch_snapshot(
                &client.account_fetcher(),
                &config,
                &address,
                &ObservationLog::default(),
            )
            .await?;
            println!("{snapshot}");
            println!("bank utilization: {:.3}", snapshot.bank.utilization());
            snapshot.check_freshness();
        }
        Command::ListAccounts { owner, rpc } => {
            let config = rpc.config()?;
            let client = rpc.client(&config, Arc::new(Keypair::new()))?;
            let owner = owner.as_deref().map(pubkey_from_cli).transpose()?;
            let accounts =
                gpa::fetch_margin_accounts(&client.rpc_async(), config.program_id, config.group, owner)
                    .await?;
            for (address, data) in accounts {
                let active = data
                    .active_slots()
                    .filter_map(UtpIndex::from_slot)
                    .map(|index| index.to_string())
                    .collect::<Vec<_>>();
                println!("{address} owner {} utps [{}]", data.authority, active.join(", "));
            }
        }
        Command::CreateAccount { owner, rpc } => {
            let config = rpc.config()?;
            let owner = Arc::new(keypair_from_cli(&owner)?);
            let client = rpc.client(&config, owner.clone())?;
            let account_fetcher = Arc::new(client.account_fetcher());
            let account =
                MarginAccount::create(config, Arc::new(client), account_fetcher, owner).await?;
            println!("{}", account.address);
        }
        Command::Deposit { account, amount } => {
            let txsig = account.load().await?.deposit_collateral(amount).await?;
            println!("{txsig}");
        }
        Command::Withdraw { account, amount } => {
            let txsig = account.load().await?.withdraw_collateral(amount).await?;
            println!("{txsig}");
        }
        Command::ActivateUtp { account, utp } => {
            let mut account = account.load().await?;
            let txsig = account.activate_utp(utp).await?;
            println!("{txsig}");
            println!("{}", account.snapshot().utp(utp).address());
        }
        Command::DeactivateUtp { account, utp } => {
            let txsig = account.load().await?.deactivate_utp(utp).await?;
            println!("{txsig}");
        }
        Command::UtpDeposit {
            account,
            utp,
            amount,
        } => {
            let txsig = account.load().await?.utp_deposit(utp, amount, false).await?;
            println!("{txsig}");
        }
        Command::UtpWithdraw {
            account,
            utp,
            amount,
        } => {
            let txsig = account.load().await?.utp_withdraw(utp, amount).await?;
            println!("{txsig}");
        }
        Command::Observe { account, utp } => {
            let mut account = account.load().await?;
            match utp {
                Some(index) => {
                    account.observe(index).await?;
                }
                None => account.observe_all().await?,
            }
            println!("{}", account.snapshot());
        }
        Command::Addresses { account, rpc } => {
            let config = rpc.config()?;
            let client = rpc.client(&config, Arc::new(Keypair::new()))?;
            let address = pubkey_from_cli(&account)?;
            let snapshot = fetch_snapshot(
                &client.account_fetcher(),
                &config,
                &address,
                &ObservationLog::default(),
            )
            .await?;
            print_addresses(&config, &snapshot);
        }
    }

    Ok(())
}

fn print_addresses(config: &MarginfiConfig, snapshot: &marginfi_client::AccountSnapshot) {
    let vault_authority = |vault_type| bank_vault_authority(&config.program_id, &config.group, vault_type).0;
    println!("margin account: {}", snapshot.address);
    println!("authority: {}", snapshot.data.authority);
    println!("bank vault: {}", snapshot.bank.vault);
    println!("bank vault authority: {}", vault_authority(BankVaultType::Liquidity));
    println!("insurance vault authority: {}", vault_authority(BankVaultType::Insurance));
    println!("fee vault authority: {}", vault_authority(BankVaultType::Fee));
    for slot in snapshot.active_utps() {
        let authority = slot
            .authority(&config.program_id)
            .map(|a| a.to_string())
            .unwrap_or_else(|err| format!("unknown ({err})"));
        println!("utp {}: account {} authority {}", slot.index, slot.address(), authority);
        if slot.index == UtpIndex::Drift {
            println!(
                "  user positions: {}",
                slot.config.utp_address_book[utp::drift::USER_POSITIONS_ADDRESS_INDEX]
            );
        }
    }
}
