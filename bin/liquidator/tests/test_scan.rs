use std::sync::Arc;

use clap::Parser;
use marginfi_client::{
    fetch_snapshot, gpa, Client, MarginfiConfig, MarginRequirement, ObservationLog,
    TransactionBuilderConfig,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::signature::Keypair;
use tracing::info;

#[derive(Parser)]
#[clap()]
struct Cli {
    #[clap(short, long, env)]
    pub(crate) rpc_url: String,

    #[clap(long, env = "MARGINFI_CONFIG")]
    pub(crate) config: String,
}

#[tokio::test]
#[ignore = "manual test"]
async fn should_decode_all_margin_accounts() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse_from(["test"]);
    marginfi_client::tracing_subscriber_init();

    let config = MarginfiConfig::load(&cli.config)?;
    let client = Client::new(
        anchor_client::Cluster::Custom(cli.rpc_url.clone(), cli.rpc_url.replace("https", "wss")),
        CommitmentConfig::confirmed(),
        Arc::new(Keypair::new()),
        config.rpc_timeout(),
        TransactionBuilderConfig::default(),
    );
    let fetcher = client.account_fetcher();
    let accounts =
        gpa::fetch_margin_accounts(&client.rpc_async(), config.program_id, config.group, None)
            .await?;
    assert!(!accounts.is_empty());

    let mut liquidatable = 0;
    let mut bankrupt = 0;
    for (address, _) in &accounts {
        let snapshot = fetch_snapshot(&fetcher, &config, address, &ObservationLog::default()).await?;
        assert!(
            snapshot.compute_margin_requirement(MarginRequirement::Maint)
                <= snapshot.compute_margin_requirement(MarginRequirement::Init)
        );
        if snapshot.can_be_liquidated() {
            liquidatable += 1;
            if snapshot.is_bankrupt() {
                bankrupt += 1;
            }
            info!("{snapshot}");
        }
    }
    info!(count = accounts.len(), liquidatable, bankrupt, "scan done");
    Ok(())
}
