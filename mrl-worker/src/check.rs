//! Sanity checks on user programs, run before and after each invocation.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Error;
use tracing::{error, warn};

use common::JobError;

/// Resolve an executable to an absolute path.
pub fn resolve_executable(path: &Path) -> Result<PathBuf, JobError> {
    path.canonicalize()
        .map_err(|_| JobError::MissingExecutable {
            path: path.to_path_buf(),
        })
}

/// Verify the executable starts with the expected interpreter line.
///
/// Spawning a script with a broken shebang fails with confusing errors, so
/// this is checked up front.
pub fn check_interpreter(exe: &Path, expected: &str) -> Result<(), JobError> {
    let missing = || JobError::MissingExecutable {
        path: exe.to_path_buf(),
    };
    let file = File::open(exe).map_err(|_| missing())?;

    let mut first = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut first)
        .map_err(|_| missing())?;
    let line = String::from_utf8_lossy(&first).trim_end().to_string();

    if line != expected {
        error!("{}: invalid shebang on first line '{}'", exe.display(), line);
        return Err(JobError::BadInterpreter {
            path: exe.to_path_buf(),
            line,
            expected: expected.to_string(),
        });
    }
    Ok(())
}

/// A partition whose multi-line input collapsed into exactly one output line
/// means the program is dumping everything into a single key.
///
/// Other kinds of collapse are deliberately not detected.
pub fn check_keyspace(
    stage: &str,
    input_lines: usize,
    output_lines: usize,
    output: &Path,
) -> Result<(), Error> {
    if input_lines > 1 && output_lines == 1 {
        warn!("Should not carry data forward via a single key");
        return Err(JobError::Keyspace {
            stage: stage.to_string(),
            output: output.to_path_buf(),
        }
        .into());
    }
    Ok(())
}
