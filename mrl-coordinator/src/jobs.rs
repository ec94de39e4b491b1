use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Error};
use tracing::{info, warn};

/// State of the job.
///
/// A job moves strictly forward through
/// `Init -> Split -> Map -> Group -> Reduce -> Done`; any failure jumps
/// straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Job not started.
    Init,

    /// Splitting the input directory into mapper inputs.
    Split,

    /// Mapping phase.
    Map,

    /// Sorting and grouping mapper output by key.
    Group,

    /// Reducing phase.
    Reduce,

    /// Job completed, output copied to the output directory.
    Done,

    /// Job aborted. Terminal.
    Failed,
}

impl JobState {
    /// The state that follows this one on success.
    pub fn next(self) -> Option<JobState> {
        match self {
            JobState::Init => Some(JobState::Split),
            JobState::Split => Some(JobState::Map),
            JobState::Map => Some(JobState::Group),
            JobState::Group => Some(JobState::Reduce),
            JobState::Reduce => Some(JobState::Done),
            JobState::Done | JobState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Init => "init",
            JobState::Split => "split",
            JobState::Map => "map",
            JobState::Group => "group",
            JobState::Reduce => "reduce",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// A job description. Created once per invocation and never modified.
#[derive(Debug, Clone)]
pub struct Job {
    /// Directory holding the input files.
    input_dir: PathBuf,

    /// Where the final `part-*` files are written.
    output_dir: PathBuf,

    /// The mapper executable, as given by the user.
    mapper: PathBuf,

    /// The reducer executable, as given by the user.
    reducer: PathBuf,

    /// Reject programs that fold their input onto a single key.
    enforce_keyspace: bool,
}

impl Job {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        mapper: impl Into<PathBuf>,
        reducer: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            mapper: mapper.into(),
            reducer: reducer.into(),
            enforce_keyspace: false,
        }
    }

    pub fn with_enforce_keyspace(mut self, enforce_keyspace: bool) -> Self {
        self.enforce_keyspace = enforce_keyspace;
        self
    }

    pub fn get_input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn get_output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn get_mapper(&self) -> &Path {
        &self.mapper
    }

    pub fn get_reducer(&self) -> &Path {
        &self.reducer
    }

    pub fn enforces_keyspace(&self) -> bool {
        self.enforce_keyspace
    }
}

/// Tracks the progress of a running job.
#[derive(Debug)]
pub struct JobTracker {
    state: JobState,

    /// Every state the job has been in, in order.
    history: Vec<JobState>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: JobState::Init,
            history: vec![JobState::Init],
        }
    }

    /// Get the state of the job.
    pub fn get_state(&self) -> JobState {
        self.state
    }

    pub fn get_history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `state`, which must directly follow the current one.
    pub fn advance(&mut self, state: JobState) -> Result<(), Error> {
        if self.state.next() != Some(state) {
            return Err(anyhow!(
                "illegal job transition {} -> {}",
                self.state,
                state
            ));
        }
        info!("Job state {} -> {}", self.state, state);
        self.state = state;
        self.history.push(state);
        Ok(())
    }

    /// Abort the job. Has no effect once the job is done.
    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!("Job failed during {} stage", self.state);
        self.state = JobState::Failed;
        self.history.push(JobState::Failed);
    }
}
