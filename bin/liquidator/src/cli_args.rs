use clap::Parser;
use solana_sdk::pubkey::Pubkey;

#[derive(Parser, Debug)]
#[clap()]
pub(crate) struct CliDotenv {
    // When --dotenv <file> is passed, read the specified dotenv file before parsing args
    #[clap(long)]
    pub(crate) dotenv: std::path::PathBuf,

    pub(crate) remaining_args: Vec<std::ffi::OsString>,
}

// Prefer "--crank-interest false" over "--no-crank-interest" because it works
// better with CRANK_INTEREST=false env values.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BoolArg {
    True,
    False,
}

#[derive(Parser)]
#[clap()]
pub struct Cli {
    #[clap(short, long, env)]
    pub(crate) rpc_url: String,

    /// marginfi config file with program, group and venue addresses
    #[clap(long, env = "MARGINFI_CONFIG")]
    pub(crate) config: String,

    /// margin account that takes over liquidated positions; must have no active utps
    #[clap(long, env)]
    pub(crate) liquidator_margin_account: Pubkey,

    #[clap(long, env)]
    pub(crate) liquidator_owner: String,

    /// group admin keypair; without it bankrupt accounts are only reported
    #[clap(long, env)]
    pub(crate) admin: Option<String>,

    #[clap(long, env, default_value = "5000")]
    pub(crate) check_interval_ms: u64,

    /// update the bank's interest accumulators before every scan
    #[clap(long, env, value_enum, default_value = "false")]
    pub(crate) crank_interest: BoolArg,

    #[clap(long, env, default_value = "0")]
    pub(crate) prioritization_micro_lamports: u64,

    /// compute limit requested for liquidation transactions
    #[clap(long, env, default_value = "400000")]
    pub(crate) compute_limit_for_liquidation: u32,

    /// failures of one account after which it is skipped for a while
    #[clap(long, env, default_value = "3")]
    pub(crate) skip_threshold: u64,

    #[clap(long, env, default_value = "120")]
    pub(crate) skip_duration_secs: u64,
}
