//! Local MapReduce job orchestration: the job model, its working tree, the
//! stage-by-stage driver and multi-job pipelines.

pub mod core;
pub mod jobs;
pub mod pipeline;
pub mod workdir;

pub use crate::core::{run_job, JobSummary};
pub use jobs::{Job, JobState, JobTracker};
pub use pipeline::{concat_outputs, discover, run_pipeline, PipelineStep};
pub use workdir::WorkTree;
