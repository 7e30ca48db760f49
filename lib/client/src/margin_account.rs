use std::fmt;
use std::sync::Arc;

use anchor_spl::associated_token::get_associated_token_address;
use anchor_spl::token::spl_token;
use anyhow::Context;
use chrono::Utc;
use fixed::types::I80F48;
use solana_sdk::instruction::Instruction;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use tracing::*;

use crate::account_fetcher::{fetch_ledger_account, AccountFetcher};
use crate::bank::{Bank, LendingSide, MarginRequirement};
use crate::client::TransactionSender;
use crate::composer::{compose, InstructionLayout, Observes, Operation};
use crate::config::{MarginfiConfig, RiskPolicy, VenueConfig};
use crate::error::MarginfiClientError;
use crate::instructions::{self, MarginKeys};
use crate::observation::{Observation, ObservationLog};
use crate::state::{LedgerAccount, MarginAccountData, MarginGroupData};
use crate::utp::{drift, mango, ProxyTokenAccount, UtpAccount, UtpIndex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EquityType {
    /// Counts utps by their free collateral. The only variant decisions use.
    InitReqAdjusted,
    /// Counts utps by their total collateral.
    Total,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Balances {
    pub assets: I80F48,
    pub liabilities: I80F48,
    pub equity: I80F48,
}

/// Converts a computed amount into what an instruction carries.
pub fn native_amount_for_dispatch(amount: I80F48) -> Result<u64, MarginfiClientError> {
    if amount < I80F48::ZERO {
        return Err(MarginfiClientError::NaNAmount);
    }
    amount
        .floor()
        .checked_to_num::<u64>()
        .ok_or(MarginfiClientError::NaNAmount)
}

/// Decoded state of one margin account at one point in time.
///
/// All decision math runs on a snapshot; `MarginAccount` produces a new one
/// on every reload.
#[derive(Clone, Debug)]
pub struct AccountSnapshot {
    pub program_id: Pubkey,
    pub address: Pubkey,
    pub data: MarginAccountData,
    pub bank: Bank,
    /// Native collateral owned, with accrued interest.
    pub deposits: I80F48,
    /// Native collateral owed, with accrued interest.
    pub borrows: I80F48,
    /// One entry per supported venue, in slot order.
    pub utps: Vec<UtpAccount>,
    pub policy: RiskPolicy,
}

impl AccountSnapshot {
    pub fn new(
        address: Pubkey,
        data: MarginAccountData,
        group: &MarginGroupData,
        config: &MarginfiConfig,
        observations: &ObservationLog,
    ) -> anyhow::Result<Self> {
        if data.margin_group != config.group {
            return Err(MarginfiClientError::AccountGroupMismatch {
                expected: config.group,
                found: data.margin_group,
            }
            .into());
        }
        if let Some(slot) = data
            .active_slots()
            .find(|slot| UtpIndex::from_slot(*slot).is_none())
        {
            return Err(MarginfiClientError::UnsupportedUtp(slot).into());
        }

        let policy = config.risk_policy();
        let bank = Bank::from_data(config.group, group.admin, &group.bank, &policy)
            .context("decoding bank")?;
        let deposits = bank
            .compute_native_amount(&data.deposit_record, LendingSide::Deposit)
            .context("decoding deposit record")?;
        let borrows = bank
            .compute_native_amount(&data.borrow_record, LendingSide::Borrow)
            .context("decoding borrow record")?;

        let utps = UtpIndex::ALL
            .into_iter()
            .map(|index| {
                let slot = index.slot();
                let is_active = data.active_utps[slot];
                let cached_observation = if is_active {
                    observations
                        .observation(index, &data.utp_cache[slot], policy.collateral_decimals)
                        .unwrap_or_else(|err| {
                            warn!(%address, utp = %index, "undecodable observation cache: {err}");
                            Observation::empty()
                        })
                } else {
                    Observation::empty()
                };
                UtpAccount {
                    index,
                    is_active,
                    config: data.utp_account_config[slot],
                    cached_observation,
                    venue: config.venue(index),
                }
            })
            .collect();

        Ok(Self {
            program_id: config.program_id,
            address,
            data,
            bank,
            deposits,
            borrows,
            utps,
            policy,
        })
    }

    pub fn utp(&self, index: UtpIndex) -> &UtpAccount {
        &self.utps[index.slot()]
    }

    pub fn active_utps(&self) -> impl Iterator<Item = &UtpAccount> {
        self.utps.iter().filter(|utp| utp.is_active)
    }

    /// What a utp adds to the account's assets. Invalid observations add nothing.
    fn utp_contribution(utp: &UtpAccount, equity_type: EquityType) -> I80F48 {
        let observation = &utp.cached_observation;
        if !utp.is_active || !observation.valid {
            return I80F48::ZERO;
        }
        match equity_type {
            EquityType::InitReqAdjusted => observation.free_collateral,
            EquityType::Total => observation.equity,
        }
    }

    pub fn compute_balances(&self, equity_type: EquityType) -> Balances {
        let assets = self
            .active_utps()
            .fold(self.deposits, |sum, utp| {
                sum + Self::utp_contribution(utp, equity_type)
            });
        let liabilities = self.borrows;
        Balances {
            assets,
            liabilities,
            equity: assets - liabilities,
        }
    }

    pub fn equity(&self) -> I80F48 {
        self.compute_balances(EquityType::InitReqAdjusted).equity
    }

    pub fn compute_margin_requirement(&self, requirement: MarginRequirement) -> I80F48 {
        self.bank.margin_requirement(self.borrows, requirement)
    }

    pub fn meets_margin_requirement(&self, requirement: MarginRequirement) -> bool {
        let equity = self.equity();
        let margin_requirement = self.compute_margin_requirement(requirement);
        trace!(
            address = %self.address,
            ?requirement,
            %equity,
            %margin_requirement,
            "margin requirement check"
        );
        equity >= margin_requirement
    }

    pub fn can_be_liquidated(&self) -> bool {
        !self.meets_margin_requirement(MarginRequirement::Maint)
    }

    pub fn is_bankrupt(&self) -> bool {
        self.active_utps().next().is_none() && self.borrows > self.policy.dust_threshold
    }

    pub fn is_rebalance_withdraw_needed(&self) -> bool {
        self.equity() < self.compute_margin_requirement(MarginRequirement::Init)
    }

    pub fn compute_max_rebalance_withdraw_amount(&self, utp: &UtpAccount) -> I80F48 {
        let shortfall = (self.compute_margin_requirement(MarginRequirement::Init) - self.equity())
            .max(I80F48::ZERO);
        shortfall.min(Self::utp_contribution(utp, EquityType::InitReqAdjusted))
    }

    pub fn compute_max_rebalance_deposit_amount(&self, utp: &UtpAccount) -> I80F48 {
        let excess = (self.equity() - self.compute_margin_requirement(MarginRequirement::Init))
            .max(I80F48::ZERO);
        utp.max_rebalance_deposit_amount().min(excess)
    }

    /// Additional borrows the account could take on before hitting the init requirement.
    pub fn compute_purchasing_power(&self) -> I80F48 {
        let excess = (self.equity() - self.compute_margin_requirement(MarginRequirement::Init))
            .max(I80F48::ZERO);
        self.bank
            .init_margin_ratio
            .divide(excess)
            .unwrap_or(I80F48::ZERO)
    }

    /// Active utp with a valid observation and the most free collateral; the
    /// lowest slot wins ties.
    pub fn richest_utp(&self) -> Option<&UtpAccount> {
        self.active_utps()
            .filter(|utp| utp.cached_observation.valid)
            .fold(None, |best: Option<&UtpAccount>, utp| match best {
                Some(b)
                    if b.cached_observation.free_collateral
                        >= utp.cached_observation.free_collateral =>
                {
                    Some(b)
                }
                _ => Some(utp),
            })
    }

    /// Active utp a liquidator would take over: the largest liquidation value,
    /// lowest slot on ties.
    pub fn liquidation_target(&self) -> Option<&UtpAccount> {
        let value = |utp: &UtpAccount| {
            if utp.cached_observation.valid {
                utp.cached_observation.liquidation_value
            } else {
                I80F48::ZERO
            }
        };
        self.active_utps()
            .fold(None, |best: Option<&UtpAccount>, utp| match best {
                Some(b) if value(b) >= value(utp) => Some(b),
                _ => Some(utp),
            })
    }

    /// Capped deposit for a utp that needs topping up, or None when nothing
    /// worth more than dust can be moved.
    pub fn rebalance_deposit_amount(
        &self,
        index: UtpIndex,
    ) -> Result<Option<u64>, MarginfiClientError> {
        let utp = self.utp(index);
        if !utp.is_rebalance_deposit_needed() {
            return Ok(None);
        }
        let amount =
            self.compute_max_rebalance_deposit_amount(utp) * self.policy.rebalance_deposit_cap;
        if amount <= self.policy.dust_threshold {
            debug!(address = %self.address, utp = %index, %amount, "rebalance deposit below dust");
            return Ok(None);
        }
        native_amount_for_dispatch(amount).map(Some)
    }

    /// Source and amount of the withdraw that restores the init requirement, if one is due.
    pub fn rebalance_withdraw(&self) -> Result<Option<(UtpIndex, u64)>, MarginfiClientError> {
        if !self.is_rebalance_withdraw_needed() {
            return Ok(None);
        }
        let Some(utp) = self.richest_utp() else {
            debug!(address = %self.address, "rebalance withdraw needed but no utp to pull from");
            return Ok(None);
        };
        let amount = self.compute_max_rebalance_withdraw_amount(utp);
        if amount <= self.policy.dust_threshold {
            debug!(address = %self.address, utp = %utp.index, %amount, "rebalance withdraw below dust");
            return Ok(None);
        }
        Ok(Some((utp.index, native_amount_for_dispatch(amount)?)))
    }

    /// Whether every active utp's observation is valid and within the age limit.
    pub fn check_freshness(&self) -> bool {
        let now = Utc::now();
        let mut fresh = true;
        for utp in self.active_utps() {
            let span = debug_span!("freshness", address = %self.address, utp = %utp.index);
            let _enter = span.enter();
            fresh &= utp
                .cached_observation
                .check_freshness(now, self.policy.observation_max_age);
        }
        fresh
    }

    pub fn keys(&self) -> MarginKeys {
        MarginKeys {
            program_id: self.program_id,
            group: self.data.margin_group,
            margin_account: self.address,
            authority: self.data.authority,
            bank_vault: self.bank.vault,
        }
    }

    pub fn observe_instructions(&self) -> anyhow::Result<Observes> {
        let keys = self.keys();
        self.active_utps()
            .map(|utp| Ok((utp.index, utp.observe_instruction(&keys)?)))
            .collect()
    }

    /// Wraps `main` in the observe/verify layout `operation` requires.
    pub fn compose(
        &self,
        operation: Operation,
        main: Vec<Instruction>,
    ) -> anyhow::Result<Vec<Instruction>> {
        let layout = InstructionLayout::for_operation(operation);
        let verify = instructions::verify_margin_requirements(&self.keys());
        Ok(compose(layout, self.observe_instructions()?, main, verify)?)
    }

    pub fn deposit_collateral_instruction(&self, funding_account: Pubkey, amount: u64) -> Instruction {
        instructions::margin_deposit_collateral(&self.keys(), funding_account, amount)
    }

    pub fn withdraw_collateral_instructions(
        &self,
        receiving_account: Pubkey,
        amount: u64,
    ) -> anyhow::Result<Vec<Instruction>> {
        self.compose(
            Operation::WithdrawCollateral,
            vec![instructions::margin_withdraw_collateral(
                &self.keys(),
                receiving_account,
                amount,
            )],
        )
    }

    pub fn deactivate_utp_instructions(&self, index: UtpIndex) -> anyhow::Result<Vec<Instruction>> {
        let utp = self.utp(index);
        utp.ensure_active()?;
        if !utp.is_empty(self.policy.dust_threshold) {
            warn!(
                address = %self.address,
                utp = %index,
                equity = %utp.cached_observation.equity,
                "deactivating a utp that still reports value"
            );
        }
        self.compose(
            Operation::DeactivateUtp,
            vec![instructions::deactivate_utp(&self.keys(), index)],
        )
    }

    pub fn utp_deposit_instructions(
        &self,
        index: UtpIndex,
        proxy: &ProxyTokenAccount,
        amount: u64,
        crank: bool,
    ) -> anyhow::Result<Vec<Instruction>> {
        let main = self
            .utp(index)
            .deposit_instructions(&self.keys(), proxy, amount, crank)?;
        let operation = if crank {
            Operation::UtpDepositCrank(index)
        } else {
            Operation::UtpDeposit
        };
        self.compose(operation, main)
    }

    pub fn utp_withdraw_instructions(
        &self,
        index: UtpIndex,
        amount: u64,
    ) -> anyhow::Result<Vec<Instruction>> {
        let main = self.utp(index).withdraw_instruction(&self.keys(), amount)?;
        self.compose(Operation::UtpWithdraw, vec![main])
    }

    /// Venue trade followed by the observations and margin check.
    pub fn utp_trade_instructions(
        &self,
        index: UtpIndex,
        trade: Instruction,
    ) -> anyhow::Result<Vec<Instruction>> {
        self.utp(index).ensure_active()?;
        self.compose(Operation::UtpTrade, vec![trade])
    }

    /// `self` is the liquidator; the liquidatee's active utps are observed first.
    pub fn liquidate_instructions(
        &self,
        liquidatee: &AccountSnapshot,
        index: UtpIndex,
    ) -> anyhow::Result<Vec<Instruction>> {
        liquidatee.utp(index).ensure_active()?;
        let keys = self.keys();
        Ok(compose(
            InstructionLayout::for_operation(Operation::Liquidate),
            liquidatee.observe_instructions()?,
            vec![instructions::liquidate(&keys, liquidatee.address, index)],
            instructions::verify_margin_requirements(&keys),
        )?)
    }

    pub fn handle_bankruptcy_instruction(&self, admin: Pubkey) -> Instruction {
        instructions::handle_bankruptcy(self.program_id, self.data.margin_group, self.address, admin)
    }
}

impl fmt::Display for AccountSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let adjusted = self.compute_balances(EquityType::InitReqAdjusted);
        let total = self.compute_balances(EquityType::Total);
        let unit = I80F48::from_num(10u64.pow(self.policy.collateral_decimals as u32));
        let ui = |v: I80F48| v / unit;
        let ratio = |num: I80F48, den: I80F48| {
            if den.is_zero() {
                "inf".to_string()
            } else {
                format!("{:.3}", num / den)
            }
        };
        let init = self.compute_margin_requirement(MarginRequirement::Init);
        let maint = self.compute_margin_requirement(MarginRequirement::Maint);

        writeln!(f, "Margin account {}", self.address)?;
        writeln!(f, "  authority: {}", self.data.authority)?;
        writeln!(f, "  balance: {:.3}", ui(self.deposits))?;
        writeln!(f, "  equity: {:.3}", ui(total.equity))?;
        writeln!(f, "  requirement adjusted equity: {:.3}", ui(adjusted.equity))?;
        writeln!(f, "  liabilities: {:.3}", ui(adjusted.liabilities))?;
        writeln!(
            f,
            "  margin ratio: {}, leverage: {}x",
            ratio(adjusted.equity, adjusted.liabilities),
            ratio(adjusted.liabilities, adjusted.equity)
        )?;
        writeln!(
            f,
            "  init requirement: {:.3} (ratio {:.3}), health {}",
            ui(init),
            self.bank.margin_ratio(MarginRequirement::Init),
            ratio(adjusted.equity, init)
        )?;
        write!(
            f,
            "  maint requirement: {:.3} (ratio {:.3}), health {}",
            ui(maint),
            self.bank.margin_ratio(MarginRequirement::Maint),
            ratio(adjusted.equity, maint)
        )?;
        for utp in self.active_utps() {
            let observation = &utp.cached_observation;
            writeln!(f)?;
            writeln!(f, "  utp {} ({})", utp.index, utp.address())?;
            if !observation.valid {
                write!(f, "    no valid observation")?;
                continue;
            }
            writeln!(f, "    equity: {:.3}", ui(observation.equity))?;
            writeln!(f, "    free collateral: {:.3}", ui(observation.free_collateral))?;
            let prices = observation.liquidation_prices();
            writeln!(
                f,
                "    liquidation: {:.3} to the liquidator, {:.3} to insurance",
                ui(prices.discounted_liquidator_price),
                ui(prices.insurance_vault_fee)
            )?;
            write!(
                f,
                "    rebalance deposit needed: {}",
                utp.is_rebalance_deposit_needed()
            )?;
        }
        Ok(())
    }
}

/// Fetches and decodes a margin account and its group.
pub async fn fetch_snapshot(
    account_fetcher: &dyn AccountFetcher,
    config: &MarginfiConfig,
    address: &Pubkey,
    observations: &ObservationLog,
) -> anyhow::Result<AccountSnapshot> {
    let data: MarginAccountData = fetch_ledger_account(account_fetcher, address).await?;
    let group: MarginGroupData = fetch_ledger_account(account_fetcher, &config.group)
        .await
        .context("fetching margin group")?;
    AccountSnapshot::new(*address, data, &group, config, observations)
}

/// What `check_rebalance` moved.
#[derive(Clone, Debug, Default)]
pub struct RebalanceOutcome {
    pub deposits: Vec<(UtpIndex, u64, Signature)>,
    pub failed_deposits: Vec<UtpIndex>,
    pub withdraw: Option<(UtpIndex, u64, Signature)>,
    pub failed_withdraw: Option<UtpIndex>,
}

/// A margin account driven by its authority.
pub struct MarginAccount {
    pub config: MarginfiConfig,
    pub sender: Arc<dyn TransactionSender>,
    pub account_fetcher: Arc<dyn AccountFetcher>,
    pub authority: Arc<Keypair>,
    pub address: Pubkey,
    snapshot: AccountSnapshot,
    observations: ObservationLog,
}

impl MarginAccount {
    pub async fn load(
        config: MarginfiConfig,
        sender: Arc<dyn TransactionSender>,
        account_fetcher: Arc<dyn AccountFetcher>,
        authority: Arc<Keypair>,
        address: Pubkey,
    ) -> anyhow::Result<Self> {
        let observations = ObservationLog::default();
        let snapshot =
            fetch_snapshot(account_fetcher.as_ref(), &config, &address, &observations).await?;
        if snapshot.data.authority != authority.pubkey() {
            warn!(
                %address,
                owner = %snapshot.data.authority,
                signer = %authority.pubkey(),
                "margin account is owned by a different authority"
            );
        }
        Ok(Self {
            config,
            sender,
            account_fetcher,
            authority,
            address,
            snapshot,
            observations,
        })
    }

    /// Creates and initializes a new margin account owned by `authority`.
    pub async fn create(
        config: MarginfiConfig,
        sender: Arc<dyn TransactionSender>,
        account_fetcher: Arc<dyn AccountFetcher>,
        authority: Arc<Keypair>,
    ) -> anyhow::Result<Self> {
        let account = Keypair::new();
        let space = MarginAccountData::default().to_account_data()?.len();
        let rent = sender.minimum_balance_for_rent_exemption(space).await?;
        let keys = MarginKeys {
            program_id: config.program_id,
            group: config.group,
            margin_account: account.pubkey(),
            authority: authority.pubkey(),
            bank_vault: Pubkey::default(),
        };
        let instructions = vec![
            system_instruction::create_account(
                &authority.pubkey(),
                &account.pubkey(),
                rent,
                space as u64,
                &config.program_id,
            ),
            instructions::init_margin_account(&keys),
        ];
        let txsig = sender
            .send_and_confirm(instructions, &[&*authority, &account])
            .await
            .context("creating margin account")?;
        info!(address = %account.pubkey(), %txsig, "created margin account");
        Self::load(config, sender, account_fetcher, authority, account.pubkey()).await
    }

    pub fn snapshot(&self) -> &AccountSnapshot {
        &self.snapshot
    }

    pub fn observations(&self) -> &ObservationLog {
        &self.observations
    }

    pub async fn reload(&mut self) -> anyhow::Result<&AccountSnapshot> {
        self.snapshot = fetch_snapshot(
            self.account_fetcher.as_ref(),
            &self.config,
            &self.address,
            &self.observations,
        )
        .await?;
        Ok(&self.snapshot)
    }

    async fn send(
        &mut self,
        instructions: Vec<Instruction>,
        extra_signers: &[&Keypair],
    ) -> anyhow::Result<Signature> {
        let sender = self.sender.clone();
        let authority = self.authority.clone();
        let signers = [vec![&*authority], extra_signers.to_vec()].concat();
        let txsig = sender.send_and_confirm(instructions, &signers).await?;
        self.reload().await?;
        Ok(txsig)
    }

    /// Refreshes the ledger's cached health of one utp.
    ///
    /// Any failure leaves the slot with an invalid observation until the next
    /// successful observe.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn observe(&mut self, index: UtpIndex) -> anyhow::Result<Observation> {
        let ix = self.snapshot.utp(index).observe_instruction(&self.snapshot.keys())?;
        // invalid until the ledger's cache is read back
        self.observations.record_failure(index);
        self.snapshot.utps[index.slot()].cached_observation = Observation::empty();

        let authority = self.authority.clone();
        match self.sender.send_and_confirm(vec![ix], &[&*authority]).await {
            Ok(txsig) => {
                self.observations.record_success(index, Utc::now());
                debug!(%txsig, "observed");
            }
            Err(err) => warn!("observation failed: {err:?}"),
        }
        if let Err(err) = self.reload().await {
            self.observations.record_failure(index);
            return Err(err);
        }
        Ok(self.snapshot.utp(index).cached_observation.clone())
    }

    pub async fn observe_all(&mut self) -> anyhow::Result<()> {
        let active = self
            .snapshot
            .active_utps()
            .map(|utp| utp.index)
            .collect::<Vec<_>>();
        for index in active {
            self.observe(index).await?;
        }
        Ok(())
    }

    /// Tops up utps that need collateral, then pulls collateral back from the
    /// richest utp if the account itself is under its init requirement.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn check_rebalance(&mut self) -> anyhow::Result<RebalanceOutcome> {
        self.observe_all().await?;
        let mut outcome = RebalanceOutcome::default();

        let active = self
            .snapshot
            .active_utps()
            .map(|utp| utp.index)
            .collect::<Vec<_>>();
        for index in active {
            let utp = self.snapshot.utp(index);
            trace!(utp = %index, observation = ?utp.cached_observation, "checking rebalance deposit");
            if !utp.cached_observation.valid {
                continue;
            }
            let amount = match self.snapshot.rebalance_deposit_amount(index) {
                Ok(Some(amount)) => amount,
                Ok(None) => continue,
                Err(err) => {
                    error!(utp = %index, "rebalance deposit amount: {err}");
                    outcome.failed_deposits.push(index);
                    continue;
                }
            };
            match self.utp_deposit(index, amount, true).await {
                Ok(txsig) => {
                    info!(utp = %index, amount, %txsig, "rebalance deposit");
                    outcome.deposits.push((index, amount, txsig));
                }
                Err(err) => {
                    error!(utp = %index, amount, "rebalance deposit failed: {err:?}");
                    outcome.failed_deposits.push(index);
                    self.reload().await?;
                }
            }
        }

        let withdraw = match self.snapshot.rebalance_withdraw() {
            Ok(withdraw) => withdraw,
            Err(err) => {
                error!("rebalance withdraw amount: {err}");
                outcome.failed_withdraw = self.snapshot.richest_utp().map(|utp| utp.index);
                None
            }
        };
        if let Some((index, amount)) = withdraw {
            match self.utp_withdraw(index, amount).await {
                Ok(txsig) => {
                    info!(utp = %index, amount, %txsig, "rebalance withdraw");
                    outcome.withdraw = Some((index, amount, txsig));
                }
                Err(err) => {
                    error!(utp = %index, amount, "rebalance withdraw failed: {err:?}");
                    outcome.failed_withdraw = Some(index);
                    self.reload().await?;
                }
            }
        }
        Ok(outcome)
    }

    /// Settles a bankrupt account. Needs the group admin to sign; without
    /// one, bankruptcy is only reported.
    #[instrument(skip(self, admin), fields(address = %self.address))]
    pub async fn check_bankruptcy(
        &mut self,
        admin: Option<&Keypair>,
    ) -> anyhow::Result<Option<Signature>> {
        self.reload().await?;
        if !self.snapshot.is_bankrupt() {
            return Ok(None);
        }
        let Some(admin) = admin else {
            warn!(borrows = %self.snapshot.borrows, "account is bankrupt, no admin key to settle it");
            return Ok(None);
        };
        let txsig = self.handle_bankruptcy(admin).await?;
        info!(%txsig, "handled bankruptcy");
        Ok(Some(txsig))
    }

    pub async fn handle_bankruptcy(&mut self, admin: &Keypair) -> anyhow::Result<Signature> {
        let ix = self.snapshot.handle_bankruptcy_instruction(admin.pubkey());
        self.send(vec![ix], &[admin]).await
    }

    /// Takes over the liquidatee's position at `index`.
    #[instrument(skip(self, liquidatee), fields(liquidator = %self.address, liquidatee = %liquidatee.address))]
    pub async fn liquidate(
        &mut self,
        liquidatee: &AccountSnapshot,
        index: UtpIndex,
    ) -> anyhow::Result<Signature> {
        let instructions = self.snapshot.liquidate_instructions(liquidatee, index)?;
        let txsig = self.send(instructions, &[]).await?;
        info!(%txsig, utp = %index, "liquidated");
        Ok(txsig)
    }

    fn collateral_token_account(&self) -> Pubkey {
        get_associated_token_address(&self.authority.pubkey(), &self.config.collateral_mint)
    }

    pub async fn deposit_collateral(&mut self, amount: u64) -> anyhow::Result<Signature> {
        let ix = self
            .snapshot
            .deposit_collateral_instruction(self.collateral_token_account(), amount);
        self.send(vec![ix], &[]).await
    }

    pub async fn withdraw_collateral(&mut self, amount: u64) -> anyhow::Result<Signature> {
        let instructions = self
            .snapshot
            .withdraw_collateral_instructions(self.collateral_token_account(), amount)?;
        self.send(instructions, &[]).await
    }

    pub async fn activate_utp(&mut self, index: UtpIndex) -> anyhow::Result<Signature> {
        let utp = self.snapshot.utp(index);
        utp.ensure_inactive()?;
        let keys = self.snapshot.keys();
        let authority_seed = Keypair::new().pubkey();
        let venue = utp.venue()?.clone();
        let txsig = match &venue {
            VenueConfig::Mango(mango) => {
                let (ix, mango_account) = mango::activate(&keys, mango, authority_seed);
                info!(%mango_account, "activating mango");
                self.send(vec![ix], &[]).await?
            }
            VenueConfig::Drift(drift) => {
                let user_positions = Keypair::new();
                let (ix, user) = drift::activate(&keys, drift, authority_seed, user_positions.pubkey());
                info!(%user, "activating drift");
                self.send(vec![ix], &[&user_positions]).await?
            }
        };
        self.observations.forget(index);
        self.observe(index).await?;
        Ok(txsig)
    }

    pub async fn deactivate_utp(&mut self, index: UtpIndex) -> anyhow::Result<Signature> {
        let instructions = self.snapshot.deactivate_utp_instructions(index)?;
        let txsig = self.send(instructions, &[]).await?;
        self.observations.forget(index);
        Ok(txsig)
    }

    /// Moves collateral from the bank into a utp through a fresh proxy token account.
    pub async fn utp_deposit(
        &mut self,
        index: UtpIndex,
        amount: u64,
        crank: bool,
    ) -> anyhow::Result<Signature> {
        let proxy_keypair = Keypair::new();
        let proxy = ProxyTokenAccount {
            address: proxy_keypair.pubkey(),
            mint: self.snapshot.bank.mint,
            rent_lamports: self
                .sender
                .minimum_balance_for_rent_exemption(spl_token::state::Account::LEN)
                .await?,
        };
        let instructions = self
            .snapshot
            .utp_deposit_instructions(index, &proxy, amount, crank)?;
        self.send(instructions, &[&proxy_keypair]).await
    }

    pub async fn utp_withdraw(&mut self, index: UtpIndex, amount: u64) -> anyhow::Result<Signature> {
        let instructions = self.snapshot.utp_withdraw_instructions(index, amount)?;
        self.send(instructions, &[]).await
    }

    async fn utp_trade(
        &mut self,
        index: UtpIndex,
        build: impl FnOnce(&UtpAccount, &VenueConfig, &MarginKeys, Pubkey) -> anyhow::Result<Instruction>,
    ) -> anyhow::Result<Signature> {
        let keys = self.snapshot.keys();
        let utp = self.snapshot.utp(index);
        utp.ensure_active()?;
        let trade = build(utp, utp.venue()?, &keys, utp.authority(&keys.program_id)?)?;
        let instructions = self.snapshot.utp_trade_instructions(index, trade)?;
        self.send(instructions, &[]).await
    }

    pub async fn mango_place_perp_order(
        &mut self,
        market: &mango::PerpMarketKeys,
        args: &mango::PlacePerpOrderArgs,
    ) -> anyhow::Result<Signature> {
        self.utp_trade(UtpIndex::Mango, |utp, venue, keys, authority| match venue {
            VenueConfig::Mango(mango) => Ok(mango::place_perp_order(
                keys, &utp.config, mango, authority, market, args,
            )),
            _ => anyhow::bail!("mango slot has a non-mango venue"),
        })
        .await
    }

    pub async fn mango_cancel_perp_order(
        &mut self,
        market: &mango::PerpMarketKeys,
        order_id: i128,
        invalid_id_ok: bool,
    ) -> anyhow::Result<Signature> {
        self.utp_trade(UtpIndex::Mango, |utp, venue, keys, authority| match venue {
            VenueConfig::Mango(mango) => Ok(mango::cancel_perp_order(
                keys,
                &utp.config,
                mango,
                authority,
                market,
                order_id,
                invalid_id_ok,
            )),
            _ => anyhow::bail!("mango slot has a non-mango venue"),
        })
        .await
    }

    pub async fn drift_open_position(
        &mut self,
        oracle: Pubkey,
        args: &drift::OpenPositionArgs,
    ) -> anyhow::Result<Signature> {
        self.utp_trade(UtpIndex::Drift, |utp, venue, keys, authority| match venue {
            VenueConfig::Drift(drift) => Ok(drift::open_position(
                keys, &utp.config, drift, authority, oracle, args,
            )),
            _ => anyhow::bail!("drift slot has a non-drift venue"),
        })
        .await
    }

    pub async fn drift_close_position(
        &mut self,
        oracle: Pubkey,
        args: &drift::ClosePositionArgs,
    ) -> anyhow::Result<Signature> {
        self.utp_trade(UtpIndex::Drift, |utp, venue, keys, authority| match venue {
            VenueConfig::Drift(drift) => Ok(drift::close_position(
                keys, &utp.config, drift, authority, oracle, args,
            )),
            _ => anyhow::bail!("drift slot has a non-drift venue"),
        })
        .await
    }
}
