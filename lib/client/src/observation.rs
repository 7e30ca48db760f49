use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use fixed::types::I80F48;
use tracing::*;

use crate::decimal::DecimalError;
use crate::state::UtpObservationCache;
use crate::utp::UtpIndex;

pub const LIQUIDATOR_LIQUIDATION_FEE: I80F48 = I80F48::from_bits(7036874417766); // ~0.025
pub const INSURANCE_VAULT_LIQUIDATION_FEE: I80F48 = I80F48::from_bits(7036874417766); // ~0.025

/// Health snapshot of a single utp, in native collateral units.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub equity: I80F48,
    pub free_collateral: I80F48,
    pub init_margin_requirement: I80F48,
    pub maint_margin_requirement: I80F48,
    pub liquidation_value: I80F48,
    /// Only observations decoded from a successful read are valid.
    pub valid: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LiquidationPrices {
    pub final_price: I80F48,
    pub discounted_liquidator_price: I80F48,
    pub insurance_vault_fee: I80F48,
}

impl Observation {
    pub fn empty() -> Self {
        Self {
            timestamp: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            equity: I80F48::ZERO,
            free_collateral: I80F48::ZERO,
            init_margin_requirement: I80F48::ZERO,
            maint_margin_requirement: I80F48::ZERO,
            liquidation_value: I80F48::ZERO,
            valid: false,
        }
    }

    pub fn from_cache(
        cache: &UtpObservationCache,
        decimals: u8,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, DecimalError> {
        let native =
            |d: &crate::Decimal| d.to_native_amount(decimals).map(I80F48::from_num::<i64>);
        let equity = native(&cache.total_collateral)?;
        Ok(Self {
            timestamp,
            equity,
            free_collateral: native(&cache.free_collateral)?,
            init_margin_requirement: native(&cache.margin_requirement_init)?,
            maint_margin_requirement: native(&cache.margin_requirement_maint)?,
            liquidation_value: equity,
            valid: true,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.timestamp)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Returns whether the observation may be relied on, warning when it can't.
    pub fn check_freshness(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if !self.valid {
            warn!("observation is invalid");
            return false;
        }
        if self.is_stale(now, max_age) {
            warn!(
                age_ms = self.age(now).num_milliseconds(),
                max_age_ms = max_age.num_milliseconds(),
                "observation is stale"
            );
            return false;
        }
        true
    }

    pub fn is_empty(&self, dust_threshold: I80F48) -> bool {
        self.equity < dust_threshold
    }

    /// Venue policy: top up when total collateral is not above the buffered init requirement.
    pub fn is_rebalance_deposit_needed(&self, deposit_buffer: I80F48) -> bool {
        self.valid && self.equity <= self.init_margin_requirement * deposit_buffer
    }

    pub fn max_rebalance_deposit_amount(&self, deposit_buffer: I80F48) -> I80F48 {
        if !self.valid {
            return I80F48::ZERO;
        }
        (self.init_margin_requirement * deposit_buffer - self.equity).max(I80F48::ZERO)
    }

    pub fn liquidation_prices(&self) -> LiquidationPrices {
        let discounted_liquidator_price =
            self.liquidation_value * (I80F48::ONE - LIQUIDATOR_LIQUIDATION_FEE);
        let insurance_vault_fee = self.liquidation_value * INSURANCE_VAULT_LIQUIDATION_FEE;
        LiquidationPrices {
            final_price: discounted_liquidator_price - insurance_vault_fee,
            discounted_liquidator_price,
            insurance_vault_fee,
        }
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObservationState {
    Observed(DateTime<Utc>),
    Failed,
}

/// Outcome of the last observe of each utp slot made by this process.
///
/// The ledger's observation cache carries no timestamp, so this is what ages
/// cached values.
#[derive(Clone, Debug, Default)]
pub struct ObservationLog {
    states: HashMap<UtpIndex, ObservationState>,
}

impl ObservationLog {
    pub fn record_success(&mut self, index: UtpIndex, at: DateTime<Utc>) {
        self.states.insert(index, ObservationState::Observed(at));
    }

    pub fn record_failure(&mut self, index: UtpIndex) {
        self.states.insert(index, ObservationState::Failed);
    }

    /// Cleared when a slot is deactivated.
    pub fn forget(&mut self, index: UtpIndex) {
        self.states.remove(&index);
    }

    pub fn last_observed(&self, index: UtpIndex) -> Option<DateTime<Utc>> {
        match self.states.get(&index) {
            Some(ObservationState::Observed(at)) => Some(*at),
            _ => None,
        }
    }

    /// Decodes the cache of an active slot. A failed last observe yields the
    /// empty observation, a slot never observed here is stamped with the epoch.
    pub fn observation(
        &self,
        index: UtpIndex,
        cache: &UtpObservationCache,
        decimals: u8,
    ) -> Result<Observation, DecimalError> {
        match self.states.get(&index) {
            Some(ObservationState::Failed) => Ok(Observation::empty()),
            Some(ObservationState::Observed(at)) => Observation::from_cache(cache, decimals, *at),
            None => Observation::from_cache(
                cache,
                decimals,
                DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            ),
        }
    }
}
