//! Application entry point shared by binaries built on floe-core.
//!
//! A binary implements [`AppConfig`] on its config type and reduces `main`
//! to `Application::<Config>::run()`.

use std::process::ExitCode;

use clap::Parser;
use snafu::ResultExt;
use tracing::{error, info};

use crate::config::{CliArgs, ConfigPath, Mergeable};
use crate::error::{ConfigError, PipelineSetupError, RuntimeSnafu};
use crate::topology::{Pipeline, PipelineContext, run_pipelines};
use crate::tracing::init_tracing;

/// A loadable config that knows how to build its pipelines.
pub trait AppConfig: Mergeable {
    type Pipeline: Pipeline;

    /// Label used in logs, e.g. "table".
    const COMPONENT_NAME: &'static str;

    /// Load and validate from every config path.
    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError>;

    fn create_pipelines(&self, context: PipelineContext) -> Vec<Self::Pipeline>;

    fn log_startup_info(&self);
}

pub struct Application<C: AppConfig> {
    config: C,
}

impl<C: AppConfig> Application<C> {
    /// Parse args, load config and run every pipeline until shutdown.
    ///
    /// Exits non-zero when config loading fails or any pipeline stopped with
    /// an error.
    pub fn run() -> ExitCode {
        init_tracing();

        let args = CliArgs::parse();
        let paths = args.config_paths();

        if paths.is_empty() {
            error!("No config files or directories specified (use -c or -C)");
            return ExitCode::FAILURE;
        }

        info!("Loading config from {} source(s)", paths.len());

        match Self::from_paths(&paths) {
            Ok(app) => app.execute(),
            Err(e) => {
                error!(error = %e, "Failed to load config");
                ExitCode::FAILURE
            }
        }
    }

    pub fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config = C::from_paths(paths)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    fn execute(self) -> ExitCode {
        self.config.log_startup_info();

        match self.block_on_pipelines() {
            Ok(0) => ExitCode::SUCCESS,
            Ok(failed) => {
                error!(failed, "{}s stopped with errors", C::COMPONENT_NAME);
                ExitCode::FAILURE
            }
            Err(e) => {
                error!(error = %e, "Failed to start {}s", C::COMPONENT_NAME);
                ExitCode::FAILURE
            }
        }
    }

    fn block_on_pipelines(&self) -> Result<usize, PipelineSetupError> {
        let runtime = tokio::runtime::Runtime::new().context(RuntimeSnafu)?;
        runtime.block_on(run_pipelines(
            &self.config.metrics().address,
            self.config.global(),
            C::COMPONENT_NAME,
            |context| self.config.create_pipelines(context),
        ))
    }
}
