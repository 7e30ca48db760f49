use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use marginfi_client::error_tracking::ErrorTracking;
use marginfi_client::{
    fetch_snapshot, ledger_rejection, AccountFetcher, AccountSnapshot, MarginAccount,
    MarginfiConfig, ObservationLog, TransactionSender, UtpIndex,
};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LiqErrorType {
    Liquidate,
    Bankruptcy,
}

impl fmt::Display for LiqErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Liquidate => write!(f, "liquidate"),
            Self::Bankruptcy => write!(f, "bankruptcy"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    HandleBankruptcy,
    Liquidate(UtpIndex),
}

impl Action {
    fn error_type(self) -> LiqErrorType {
        match self {
            Action::HandleBankruptcy => LiqErrorType::Bankruptcy,
            Action::Liquidate(_) => LiqErrorType::Liquidate,
        }
    }
}

/// What, if anything, should be done about an account. Only accounts below
/// their maintenance requirement are acted on.
pub fn choose_action(snapshot: &AccountSnapshot) -> Option<Action> {
    if !snapshot.can_be_liquidated() {
        return None;
    }
    if snapshot.is_bankrupt() {
        return Some(Action::HandleBankruptcy);
    }
    snapshot
        .liquidation_target()
        .map(|utp| Action::Liquidate(utp.index))
}

pub struct LiquidationState {
    pub liquidator: MarginAccount,
    pub sender: Arc<dyn TransactionSender>,
    pub account_fetcher: Arc<dyn AccountFetcher>,
    pub config: MarginfiConfig,
    pub admin: Option<Arc<Keypair>>,
    pub errors: ErrorTracking<LiqErrorType, Pubkey>,
}

impl LiquidationState {
    /// Checks every account once, in random order. Returns how many were acted on.
    pub async fn scan(&mut self, mut accounts: Vec<Pubkey>) -> u64 {
        {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            accounts.shuffle(&mut rng);
        }

        let mut acted = 0u64;
        for address in accounts {
            if address == self.liquidator.address {
                continue;
            }
            match self.process_account(&address).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(err) => error!(%address, "checking account: {err:?}"),
            }
        }
        acted
    }

    fn should_skip(&self, address: &Pubkey, action: Action) -> bool {
        if let Some(record) = self
            .errors
            .should_skip(action.error_type(), address, Instant::now())
        {
            trace!(%address, count = record.count, "skipping account, had errors recently");
            return true;
        }
        false
    }

    pub async fn process_account(&mut self, address: &Pubkey) -> anyhow::Result<bool> {
        let snapshot = fetch_snapshot(
            self.account_fetcher.as_ref(),
            &self.config,
            address,
            &ObservationLog::default(),
        )
        .await?;
        let Some(action) = choose_action(&snapshot) else {
            return Ok(false);
        };
        if self.should_skip(address, action) {
            return Ok(false);
        }

        let result = match action {
            Action::HandleBankruptcy => self.handle_bankruptcy(&snapshot).await,
            Action::Liquidate(index) => self.liquidator.liquidate(&snapshot, index).await.map(Some),
        };
        self.log_or_ignore_error(&result, address, action);
        Ok(matches!(result, Ok(Some(_))))
    }

    async fn handle_bankruptcy(&self, snapshot: &AccountSnapshot) -> anyhow::Result<Option<Signature>> {
        let Some(admin) = &self.admin else {
            warn!(address = %snapshot.address, borrows = %snapshot.borrows, "bankrupt account, no admin key");
            return Ok(None);
        };
        let ix = snapshot.handle_bankruptcy_instruction(admin.pubkey());
        let txsig = self.sender.send_and_confirm(vec![ix], &[admin.as_ref()]).await?;
        info!(address = %snapshot.address, %txsig, "handled bankruptcy");
        Ok(Some(txsig))
    }

    fn log_or_ignore_error<T>(&mut self, result: &anyhow::Result<T>, address: &Pubkey, action: Action) {
        let error_type = action.error_type();
        let err = match result {
            Ok(_) => {
                self.errors.record_success(error_type, address);
                return;
            }
            Err(err) => err,
        };
        self.errors
            .record_failure(error_type, address, err.to_string(), Instant::now());

        // The ledger rejecting a stale decision is routine when racing other liquidators.
        match ledger_rejection(err) {
            Some(rejection) => {
                let program_error = rejection.program_error();
                if program_error.map_or(false, |e| e.is_expected_race()) {
                    debug!(%address, %error_type, ?program_error, "lost race");
                } else {
                    info!(%address, %error_type, "rejected by the ledger: {rejection}");
                }
            }
            None => error!(%address, %error_type, "{err:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginfi_client::state::{BankData, MarginAccountData, MarginGroupData};
    use marginfi_client::Decimal;

    fn config() -> MarginfiConfig {
        MarginfiConfig {
            program_id: Pubkey::new_unique(),
            group: Pubkey::new_unique(),
            collateral_mint: Pubkey::new_unique(),
            collateral_decimals: 6,
            rpc_timeout_secs: 10,
            observation_max_age_secs: 5,
            dust_threshold: 1,
            partial_liquidation_factor: 0.2,
            rebalance_deposit_cap: 0.95,
            mango: None,
            drift: None,
        }
    }

    /// `utps` holds the total collateral of each active slot.
    fn snapshot(deposits: i64, borrows: i64, utps: &[(UtpIndex, i64)]) -> anyhow::Result<AccountSnapshot> {
        let config = config();
        let native = |v: i64| Decimal::from_native(v, 6);
        let mut data = MarginAccountData {
            margin_group: config.group,
            deposit_record: native(deposits)?,
            borrow_record: native(borrows)?,
            ..Default::default()
        };
        for (index, total) in utps {
            data.active_utps[index.slot()] = true;
            data.utp_cache[index.slot()].total_collateral = native(*total)?;
        }
        let group = MarginGroupData {
            bank: BankData {
                deposit_accumulator: Decimal::new(false, 0, 1)?,
                borrow_accumulator: Decimal::new(false, 0, 1)?,
                init_margin_ratio: Decimal::new(false, 2, 20)?,
                maint_margin_ratio: Decimal::new(false, 2, 10)?,
                ..Default::default()
            },
            ..Default::default()
        };
        AccountSnapshot::new(Pubkey::new_unique(), data, &group, &config, &ObservationLog::default())
    }

    #[test]
    fn test_choose_action() -> anyhow::Result<()> {
        assert_eq!(choose_action(&snapshot(2000, 1000, &[])?), None);
        assert_eq!(
            choose_action(&snapshot(0, 1000, &[])?),
            Some(Action::HandleBankruptcy)
        );
        // free collateral is zero, so the utps don't rescue the account
        assert_eq!(
            choose_action(&snapshot(500, 1000, &[(UtpIndex::Drift, 900), (UtpIndex::Mango, 300)])?),
            Some(Action::Liquidate(UtpIndex::Drift))
        );
        Ok(())
    }
}
