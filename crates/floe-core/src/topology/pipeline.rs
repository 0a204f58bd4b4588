//! Running many independent table loops in one process.
//!
//! Each pipeline gets its own task. A failing pipeline is logged and
//! dropped; the others keep running until shutdown.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{GlobalConfig, RetryConfig};
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::signal::shutdown_signal;

/// Shared resources handed to every pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    /// Caps how many pipelines may hold a write permit at once.
    pub global_semaphore: Option<Arc<Semaphore>>,
    pub poll_jitter_secs: u64,
    pub retry: RetryConfig,
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(global: &GlobalConfig, shutdown: CancellationToken) -> Self {
        Self {
            global_semaphore: global
                .total_concurrency
                .map(|n| Arc::new(Semaphore::new(n))),
            poll_jitter_secs: global.poll_jitter_secs,
            retry: global.retry.clone(),
            shutdown,
        }
    }
}

/// A self-contained unit the runner spawns onto its own task.
pub trait Pipeline: Send + 'static {
    type Key: Clone + Display + Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn key(&self) -> &Self::Key;

    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Spawns pipelines with jittered starts and waits for all of them.
pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    typetag: &'static str,
}

impl<P: Pipeline> PipelineRunner<P> {
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            typetag,
        }
    }

    /// Cancel the shared token on SIGINT, SIGTERM or SIGQUIT.
    pub fn spawn_shutdown_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    /// Run every pipeline to completion. Returns how many ended in error.
    pub async fn run(self) -> usize {
        let mut handles: JoinSet<(P::Key, Result<(), P::Error>)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_secs = start_jitter.as_secs(),
                        "Delaying {typetag} start for jitter"
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        return (key, Ok(()));
                    }
                }

                let result = pipeline.run().await;
                (key, result)
            });
        }

        info!("Spawned {} {typetag} tasks", handles.len());

        let mut failed = 0;
        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((key, Ok(()))) => info!(target = %key, "{typetag} stopped"),
                Ok((key, Err(e))) => {
                    failed += 1;
                    error!(target = %key, error = %e, "{typetag} failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(error = %e, "{typetag} task panicked");
                }
            }
        }

        info!(failed, "All {typetag}s stopped");
        failed
    }
}

/// Start the metrics endpoint, build pipelines from the shared context and
/// run them until shutdown.
pub async fn run_pipelines<P, F>(
    metrics_address: &str,
    global: &GlobalConfig,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<usize, PipelineSetupError>
where
    P: Pipeline,
    F: FnOnce(PipelineContext) -> Vec<P>,
{
    let addr = metrics_address.parse().context(AddressParseSnafu)?;
    crate::metrics::init_global(addr).context(MetricsSnafu)?;

    let shutdown = CancellationToken::new();
    let context = PipelineContext::new(global, shutdown.clone());
    let pipelines = create_pipelines(context);

    let runner = PipelineRunner::new(pipelines, shutdown, global.poll_jitter_secs, typetag);
    runner.spawn_shutdown_handler();
    Ok(runner.run().await)
}

/// Uniform random delay in `[0, max_secs)`.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(display("table gone"))]
    struct Gone;

    struct Fake {
        key: String,
        fail: bool,
    }

    impl Pipeline for Fake {
        type Key = String;
        type Error = Gone;

        fn key(&self) -> &String {
            &self.key
        }

        async fn run(self) -> Result<(), Gone> {
            if self.fail { Err(Gone) } else { Ok(()) }
        }
    }

    #[test]
    fn test_random_jitter_bounds() {
        assert_eq!(random_jitter(0), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(2) < Duration::from_secs(2));
        }
    }

    #[test]
    fn test_context_shares_semaphore() {
        let global = GlobalConfig {
            total_concurrency: Some(2),
            ..Default::default()
        };
        let ctx = PipelineContext::new(&global, CancellationToken::new());
        let clone = ctx.clone();

        let (a, b) = (
            ctx.global_semaphore.as_ref().unwrap(),
            clone.global_semaphore.as_ref().unwrap(),
        );
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.available_permits(), 2);
    }

    #[test]
    fn test_context_without_cap() {
        let ctx = PipelineContext::new(&GlobalConfig::default(), CancellationToken::new());
        assert!(ctx.global_semaphore.is_none());
    }

    #[tokio::test]
    async fn test_failed_pipeline_does_not_stop_others() {
        let pipelines = vec![
            Fake { key: "customers".into(), fail: true },
            Fake { key: "orders".into(), fail: false },
        ];
        let runner = PipelineRunner::new(pipelines, CancellationToken::new(), 0, "table");
        assert_eq!(runner.run().await, 1);
    }
}
