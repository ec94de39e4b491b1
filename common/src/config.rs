//! Tunable constants for a job.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use serde::Deserialize;
use tracing::debug;

use crate::error::JobError;

/// Large input files are automatically split into chunks of this size.
pub const DEFAULT_SPLIT_SIZE: u64 = 1 << 20;

/// The number of reducers is determined by the number of unique keys, but
/// will never exceed this.
pub const DEFAULT_MAX_REDUCERS: usize = 4;

/// Required first line of every mapper and reducer executable.
pub const DEFAULT_INTERPRETER: &str = "#!/usr/bin/env python3";

/// Number of lines the external sorter keeps in memory per run.
pub const DEFAULT_SORT_BUFFER_LINES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Input split threshold in bytes. Controls the mapper fan-out.
    pub split_size: u64,

    /// Upper bound on the number of reducer partitions.
    pub max_reducers: usize,

    /// Expected first line of the mapper and reducer executables.
    pub interpreter: String,

    /// How many subprocesses of one stage may run at once.
    pub workers: usize,

    /// In-memory run size of the group stage sort, in lines.
    pub sort_buffer_lines: usize,

    /// Leave the temporary working tree behind after the job.
    pub keep_tmp: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            split_size: DEFAULT_SPLIT_SIZE,
            max_reducers: DEFAULT_MAX_REDUCERS,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            workers: 1,
            sort_buffer_lines: DEFAULT_SORT_BUFFER_LINES,
            keep_tmp: false,
        }
    }
}

impl Tunables {
    /// Load tunables from a JSON file. Missing fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let tunables: Tunables = serde_json::from_str(&raw)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        debug!("Loaded tunables from {}: {:?}", path.display(), tunables);
        Ok(tunables)
    }

    /// Reject values that would make a job meaningless.
    pub fn validate(&self) -> Result<(), JobError> {
        let reason = if self.split_size == 0 {
            "split size must be positive"
        } else if self.max_reducers == 0 {
            "maximum reducer count must be positive"
        } else if self.workers == 0 {
            "worker count must be positive"
        } else if self.sort_buffer_lines == 0 {
            "sort buffer must hold at least one line"
        } else {
            return Ok(());
        };
        Err(JobError::InvalidTunables {
            reason: reason.to_string(),
        })
    }

    /// Split threshold in human readable form, for logging.
    pub fn split_size_display(&self) -> String {
        ByteSize::b(self.split_size).to_string_as(true)
    }
}
