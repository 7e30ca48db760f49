//! Backoff bookkeeping for bots that act on many accounts.
//!
//! Failures are counted per (kind, account). Once a pair fails often enough
//! it is skipped for a while, so one broken account can't starve the rest.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::*;

#[derive(Clone, Debug)]
pub struct FailureRecord {
    /// Most recent distinct messages, oldest first.
    pub messages: Vec<String>,
    pub count: u64,
    pub last_at: Instant,
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ErrorTracking<Kind, Key>
where
    Kind: Copy + Hash + Eq,
    Key: Clone + Hash + Eq,
{
    #[builder(setter(skip))]
    failures: HashMap<(Kind, Key), FailureRecord>,

    /// Per-kind thresholds that replace `skip_threshold`.
    #[builder(default, setter(custom))]
    thresholds: HashMap<Kind, u64>,

    /// Failures after which a pair is skipped.
    #[builder(default = "2")]
    pub skip_threshold: u64,

    #[builder(default = "Duration::from_secs(60)")]
    pub skip_duration: Duration,

    #[builder(default = "3")]
    pub messages_to_keep: usize,

    /// Records without a new failure for this long are dropped.
    #[builder(default = "Duration::from_secs(300)")]
    pub keep_duration: Duration,

    #[builder(default = "Duration::from_secs(300)")]
    pub log_interval: Duration,

    #[builder(setter(skip), default = "Instant::now()")]
    last_log: Instant,
}

impl<Kind, Key> ErrorTrackingBuilder<Kind, Key>
where
    Kind: Copy + Hash + Eq,
    Key: Clone + Hash + Eq,
{
    pub fn threshold_for(mut self, kind: Kind, threshold: u64) -> Self {
        self.thresholds
            .get_or_insert_with(HashMap::new)
            .insert(kind, threshold);
        self
    }
}

impl<Kind, Key> ErrorTracking<Kind, Key>
where
    Kind: Copy + Hash + Eq + fmt::Display,
    Key: Clone + Hash + Eq + fmt::Display,
{
    pub fn builder() -> ErrorTrackingBuilder<Kind, Key> {
        ErrorTrackingBuilder::default()
    }

    fn threshold(&self, kind: Kind) -> u64 {
        self.thresholds
            .get(&kind)
            .copied()
            .unwrap_or(self.skip_threshold)
    }

    fn is_skipping(&self, kind: Kind, record: &FailureRecord, now: Instant) -> bool {
        record.count >= self.threshold(kind)
            && now.saturating_duration_since(record.last_at) < self.skip_duration
    }

    /// The failure record if `key` should currently be skipped for `kind`.
    pub fn should_skip(&self, kind: Kind, key: &Key, now: Instant) -> Option<&FailureRecord> {
        let record = self.failures.get(&(kind, key.clone()))?;
        self.is_skipping(kind, record, now).then_some(record)
    }

    pub fn record_failure(&mut self, kind: Kind, key: &Key, message: String, now: Instant) {
        let threshold = self.threshold(kind);
        let record = self
            .failures
            .entry((kind, key.clone()))
            .or_insert_with(|| FailureRecord {
                messages: Vec::with_capacity(1),
                count: 0,
                last_at: now,
            });
        record.count += 1;
        record.last_at = now;
        record.messages.retain(|m| m != &message);
        record.messages.push(message);
        if record.messages.len() > self.messages_to_keep {
            record.messages.remove(0);
        }

        if record.count == threshold {
            debug!(%kind, %key, count = record.count, messages = ?record.messages, "repeated failures, skipping");
        }
    }

    pub fn record_success(&mut self, kind: Kind, key: &Key) {
        self.failures.remove(&(kind, key.clone()));
    }

    /// Drops stale records and periodically reports what is being skipped.
    pub fn update(&mut self, now: Instant) {
        let keep = self.keep_duration;
        self.failures
            .retain(|_, record| now.saturating_duration_since(record.last_at) < keep);

        if now.saturating_duration_since(self.last_log) < self.log_interval {
            return;
        }
        self.last_log = now;
        for ((kind, key), record) in self.failures.iter() {
            if self.is_skipping(*kind, record, now) {
                info!(%kind, %key, count = record.count, messages = ?record.messages, "skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Kind {
        Liquidate,
        Bankruptcy,
    }

    impl fmt::Display for Kind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[test]
    fn test_skip_after_threshold() -> anyhow::Result<()> {
        let mut tracking = ErrorTracking::<Kind, String>::builder()
            .skip_threshold(2)
            .skip_duration(Duration::from_secs(10))
            .messages_to_keep(2)
            .threshold_for(Kind::Bankruptcy, 1)
            .build()?;
        let key = "account".to_string();
        let now = Instant::now();

        tracking.record_failure(Kind::Liquidate, &key, "a".into(), now);
        assert!(tracking.should_skip(Kind::Liquidate, &key, now).is_none());
        tracking.record_failure(Kind::Liquidate, &key, "b".into(), now);
        tracking.record_failure(Kind::Liquidate, &key, "a".into(), now);
        let record = tracking.should_skip(Kind::Liquidate, &key, now).unwrap();
        assert_eq!(record.count, 3);
        assert_eq!(record.messages, vec!["b".to_string(), "a".to_string()]);

        // kinds are tracked separately and can have their own threshold
        assert!(tracking.should_skip(Kind::Bankruptcy, &key, now).is_none());
        tracking.record_failure(Kind::Bankruptcy, &key, "c".into(), now);
        assert!(tracking.should_skip(Kind::Bankruptcy, &key, now).is_some());

        let later = now + Duration::from_secs(11);
        assert!(tracking.should_skip(Kind::Liquidate, &key, later).is_none());

        tracking.record_success(Kind::Liquidate, &key);
        assert!(tracking.should_skip(Kind::Liquidate, &key, now).is_none());
        Ok(())
    }

    #[test]
    fn test_update_drops_old_records() -> anyhow::Result<()> {
        let mut tracking = ErrorTracking::<Kind, u32>::builder()
            .skip_threshold(1)
            .keep_duration(Duration::from_secs(5))
            .build()?;
        let now = Instant::now();
        tracking.record_failure(Kind::Liquidate, &1, "x".into(), now);
        tracking.update(now + Duration::from_secs(1));
        assert_eq!(tracking.failures.len(), 1);
        tracking.update(now + Duration::from_secs(6));
        assert!(tracking.failures.is_empty());
        Ok(())
    }
}
