//! Failures that abort a job.
//!
//! Every variant is fatal: a job is never retried or partially resumed. The
//! error travels inside an [`anyhow::Error`]; callers that need to tell the
//! categories apart can `downcast_ref::<JobError>()`.

use std::fmt;
use std::fmt::Formatter;
use std::path::PathBuf;

/// Broad category of a [`JobError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input directory, executable or tunables. Raised before any
    /// subprocess runs.
    Configuration,

    /// A record line without a tab reached the group stage.
    RecordFormat,

    /// A mapper or reducer exited with a non-zero status.
    Subprocess,

    /// Strict keyspace mode caught a program folding everything onto one key.
    Keyspace,
}

#[derive(Debug)]
pub enum JobError {
    MissingInput {
        path: PathBuf,
    },
    MissingExecutable {
        path: PathBuf,
    },
    BadInterpreter {
        path: PathBuf,
        line: String,
        expected: String,
    },
    InvalidTunables {
        reason: String,
    },
    MissingTab {
        path: PathBuf,
        line_number: usize,
        line: String,
    },
    Subprocess {
        stage: String,
        exe: PathBuf,
        input: PathBuf,
        /// `None` when the child was terminated by a signal.
        code: Option<i32>,
    },
    Keyspace {
        stage: String,
        output: PathBuf,
    },
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::MissingInput { .. }
            | JobError::MissingExecutable { .. }
            | JobError::BadInterpreter { .. }
            | JobError::InvalidTunables { .. } => ErrorKind::Configuration,
            JobError::MissingTab { .. } => ErrorKind::RecordFormat,
            JobError::Subprocess { .. } => ErrorKind::Subprocess,
            JobError::Keyspace { .. } => ErrorKind::Keyspace,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            JobError::MissingInput { path } => {
                write!(f, "Can't find input_dir '{}'", path.display())
            }
            JobError::MissingExecutable { path } => {
                write!(f, "{}: executable not found", path.display())
            }
            JobError::BadInterpreter {
                path,
                line,
                expected,
            } => write!(
                f,
                "{}: invalid shebang on first line '{}'.  Expected '{}'",
                path.display(),
                line,
                expected
            ),
            JobError::InvalidTunables { reason } => write!(f, "invalid configuration: {reason}"),
            JobError::MissingTab {
                path,
                line_number,
                line,
            } => write!(
                f,
                "no TAB found in line {} of {}: '{}'",
                line_number,
                path.display(),
                line
            ),
            JobError::Subprocess {
                stage,
                exe,
                input,
                code: Some(code),
            } => write!(
                f,
                "{stage} stage: {} < {} returned non-zero exit status {code}",
                exe.display(),
                input.display()
            ),
            JobError::Subprocess {
                stage,
                exe,
                input,
                code: None,
            } => write!(
                f,
                "{stage} stage: {} < {} was terminated by a signal",
                exe.display(),
                input.display()
            ),
            JobError::Keyspace { stage, output } => write!(
                f,
                "{stage} stage: {} holds a single line. Should not carry data forward via a single key",
                output.display()
            ),
        }
    }
}

impl std::error::Error for JobError {}
