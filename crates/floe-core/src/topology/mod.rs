//! Multi-pipeline orchestration.

mod pipeline;

pub use pipeline::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
