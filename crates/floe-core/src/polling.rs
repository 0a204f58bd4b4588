//! Generic polling loop trait and runner.
//!
//! Every mirrored table and the janitor run one of these loops. Transient
//! failures are retried with exponential backoff; any other failure ends the
//! loop for that component only.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::emit;
use crate::error::Transient;
use crate::metrics::events::{
    ConsecutiveFailures, IterationCompleted, IterationDuration, IterationResultType,
};
use crate::topology::random_jitter;

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// A component driven by [`run_polling_loop`].
///
/// `prepare` must be free of externally visible side effects that matter on
/// abandonment: the loop drops it mid-flight on shutdown. `process` is never
/// interrupted.
#[async_trait]
pub trait PollingProcessor {
    /// The state type prepared for each iteration.
    type State: Send;
    /// The error type for this processor.
    type Error: std::error::Error + Transient + Send;

    /// Prepare state for a processing iteration.
    ///
    /// Returns `None` if there's no work to do. `cold_start` stays true until
    /// the first `prepare` succeeds, so recovery logic is retried along with it.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process the prepared state.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run a polling loop with the given processor until shutdown or a
/// non-transient error.
///
/// 1. `prepare()`, raced against shutdown
/// 2. `process()` if there's work to do, always run to completion
/// 3. wait for `poll_interval` (or the backoff delay after a transient
///    failure) plus up to `poll_jitter_secs` of jitter, or shutdown
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    retry: &RetryConfig,
    shutdown: CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let mut cold_start = true;
    let mut failures: u32 = 0;

    loop {
        let iteration_start = Instant::now();

        let prepared = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested while polling");
                return Ok(());
            }

            result = processor.prepare(cold_start) => result,
        };

        let outcome = match prepared {
            Ok(Some(state)) => {
                cold_start = false;
                processor.process(state).await
            }
            Ok(None) => {
                cold_start = false;
                debug!(target = name, "No items to process");
                Ok(IterationResult::NoItems)
            }
            Err(e) => Err(e),
        };

        let delay = match outcome {
            Ok(IterationResult::Shutdown) => break,
            Ok(result) => {
                if failures > 0 {
                    info!(target = name, failures, "Recovered after transient failures");
                    failures = 0;
                    emit!(ConsecutiveFailures {
                        service,
                        count: 0,
                        target: name.to_string(),
                    });
                }
                let result = match result {
                    IterationResult::NoItems => IterationResultType::NoItems,
                    _ => IterationResultType::Processed,
                };
                emit!(IterationCompleted {
                    service,
                    result,
                    target: name.to_string(),
                });
                emit!(IterationDuration {
                    service,
                    duration: iteration_start.elapsed(),
                    target: name.to_string(),
                });
                poll_interval
            }
            Err(e) if e.is_transient() => {
                failures = failures.saturating_add(1);
                emit!(IterationCompleted {
                    service,
                    result: IterationResultType::Failed,
                    target: name.to_string(),
                });
                emit!(ConsecutiveFailures {
                    service,
                    count: failures,
                    target: name.to_string(),
                });
                let delay = retry.backoff_delay(poll_interval, failures);
                warn!(
                    target = name,
                    error = %e,
                    failures,
                    retry_in_secs = delay.as_secs_f64(),
                    "Transient failure, retrying"
                );
                delay
            }
            Err(e) => {
                emit!(IterationCompleted {
                    service,
                    result: IterationResultType::Failed,
                    target: name.to_string(),
                });
                error!(target = name, error = %e, "Non-retryable failure, stopping {service}");
                return Err(e);
            }
        };

        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested during processing");
            break;
        }

        let sleep_duration = delay + random_jitter(poll_jitter_secs);
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}
