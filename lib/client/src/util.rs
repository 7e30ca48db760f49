use std::future::Future;
use std::time::Duration;

use crate::error::MarginfiClientError;

/// Runs `fut`, failing with [`MarginfiClientError::Timeout`] if it takes
/// longer than `duration`.
pub async fn with_timeout<F: Future>(
    duration: Duration,
    what: &'static str,
    fut: F,
) -> Result<F::Output, MarginfiClientError> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| MarginfiClientError::Timeout(what))
}

/// Like tokio::time::interval(), but with Delay as default MissedTickBehavior
///
/// The default (Burst) means that if the time between tick() calls is longer
/// than `period` there'll be a burst of catch-up ticks. Polling loops don't
/// need to catch up.
pub fn delay_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Sets up the fmt tracing_subscriber for the binaries, with an EnvFilter
/// and colors only when logging to a terminal.
pub fn tracing_subscriber_init() {
    let format = tracing_subscriber::fmt::format().with_ansi(atty::is(atty::Stream::Stdout));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(format)
        .init();
}
