//! Run a user program once per partition.
//!
//! The map and reduce stages share this runner: invocation `i` reads
//! `input_dir/part-i` on stdin and writes `output_dir/part-i` on stdout.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use common::utils::count_lines;
use common::{part_filename, JobError};

use crate::check::check_keyspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Map,
    Reduce,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Map => write!(f, "map"),
            StageKind::Reduce => write!(f, "reduce"),
        }
    }
}

/// One stage of a job: `count` invocations of `exe`.
#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: StageKind,

    /// Absolute path of the mapper or reducer.
    pub exe: PathBuf,

    pub input_dir: PathBuf,
    pub output_dir: PathBuf,

    /// Number of partitions, and therefore invocations.
    pub count: usize,

    /// Reject programs that fold a multi-line partition into a single line.
    pub enforce_keyspace: bool,

    /// Upper bound on concurrently running invocations.
    pub workers: usize,
}

/// Totals over all invocations of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub invocations: usize,
    pub input_lines: usize,
    pub output_lines: usize,
}

#[derive(Debug)]
struct Invocation {
    index: usize,
    input_lines: usize,
    output_lines: usize,
}

/// Run every invocation of `stage`.
///
/// Once an invocation fails no further ones are launched. Invocations that
/// were already running are waited for, then the failure with the lowest
/// partition index is returned.
pub async fn run_stage(stage: &Stage) -> Result<StageReport, Error> {
    info!("Starting {} stage", stage.kind);

    let workers = stage.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();

    for index in 0..stage.count {
        let permit = semaphore.clone().acquire_owned().await?;
        if failed.load(Ordering::SeqCst) {
            debug!(
                "Not launching remaining {} invocation(s) of the {} stage",
                stage.count - index,
                stage.kind
            );
            break;
        }

        let stage = stage.clone();
        let failed = failed.clone();
        tasks.spawn(async move {
            let result = run_one(&stage, index).await;
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            drop(permit);
            result.map_err(|e| (index, e))
        });
    }

    let mut report = StageReport::default();
    let mut first_failure: Option<(usize, Error)> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(invocation)) => {
                debug!(
                    "{} invocation {} done: {} line(s) in, {} line(s) out",
                    stage.kind, invocation.index, invocation.input_lines, invocation.output_lines
                );
                report.invocations += 1;
                report.input_lines += invocation.input_lines;
                report.output_lines += invocation.output_lines;
            }
            Ok(Err((index, err))) => {
                error!("{} invocation {} failed: {:#}", stage.kind, index, err);
                if first_failure.as_ref().map_or(true, |(i, _)| index < *i) {
                    first_failure = Some((index, err));
                }
            }
            Err(join_err) => {
                return Err(anyhow!("{} stage task panicked: {}", stage.kind, join_err));
            }
        }
    }

    match first_failure {
        Some((_, err)) => Err(err),
        None => Ok(report),
    }
}

/// Run the program on a single partition.
async fn run_one(stage: &Stage, index: usize) -> Result<Invocation, Error> {
    let input_path = stage.input_dir.join(part_filename(index));
    let output_path = stage.output_dir.join(part_filename(index));
    let exe_name = stage
        .exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| stage.exe.display().to_string());

    info!(
        "+ {} < {} > {}",
        exe_name,
        input_path.display(),
        output_path.display()
    );

    let stdin = File::open(&input_path)
        .with_context(|| format!("unable to open {}", input_path.display()))?;
    let stdout = File::create(&output_path)
        .with_context(|| format!("unable to create {}", output_path.display()))?;

    let status = Command::new(&stage.exe)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("unable to start {}", stage.exe.display()))?;

    if !status.success() {
        return Err(JobError::Subprocess {
            stage: stage.kind.to_string(),
            exe: stage.exe.clone(),
            input: input_path,
            code: status.code(),
        }
        .into());
    }

    let input_lines = count_lines(&input_path)?;
    let output_lines = count_lines(&output_path)?;
    if stage.enforce_keyspace {
        check_keyspace(
            &stage.kind.to_string(),
            input_lines,
            output_lines,
            &output_path,
        )?;
    }

    Ok(Invocation {
        index,
        input_lines,
        output_lines,
    })
}

/// Path of the partition each invocation of `stage` writes.
pub fn output_paths(stage: &Stage) -> Vec<PathBuf> {
    (0..stage.count)
        .map(|i| stage.output_dir.join(part_filename(i)))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write an executable shell script into `dir`.
    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn stage(exe: PathBuf, input: &Path, output: &Path, count: usize) -> Stage {
        Stage {
            kind: StageKind::Map,
            exe,
            input_dir: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            count,
            enforce_keyspace: false,
            workers: 1,
        }
    }

    fn write_inputs(dir: &Path, parts: &[&str]) {
        for (i, content) in parts.iter().enumerate() {
            fs::write(dir.join(part_filename(i)), content).unwrap();
        }
    }

    #[tokio::test]
    async fn pipes_each_partition_through_the_program() {
        let tmp = tempfile::tempdir().unwrap();
        let (input, output) = (tmp.path().join("in"), tmp.path().join("out"));
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();
        write_inputs(&input, &["a\t1\nb\t1\n", "c\t1\n"]);
        let exe = script(tmp.path(), "upper.sh", "tr a-z A-Z");

        let report = run_stage(&stage(exe, &input, &output, 2)).await.unwrap();
        assert_eq!(report.invocations, 2);
        assert_eq!(report.input_lines, 3);
        assert_eq!(report.output_lines, 3);
        assert_eq!(
            fs::read_to_string(output.join("part-00000")).unwrap(),
            "A\t1\nB\t1\n"
        );
        assert_eq!(fs::read_to_string(output.join("part-00001")).unwrap(), "C\t1\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let (input, output) = (tmp.path().join("in"), tmp.path().join("out"));
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();
        write_inputs(&input, &["a\t1\n", "b\t1\n", "c\t1\n"]);
        let exe = script(tmp.path(), "fail.sh", "cat > /dev/null\nexit 3");

        let err = run_stage(&stage(exe, &input, &output, 3)).await.unwrap_err();
        match err.downcast_ref::<JobError>() {
            Some(JobError::Subprocess { code, input, .. }) => {
                assert_eq!(*code, Some(3));
                assert!(input.ends_with("part-00000"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Sequential runs stop at the first failure.
        assert!(!output.join("part-00001").exists());
    }

    #[tokio::test]
    async fn parallel_failure_stops_launching_and_reports_lowest_index() {
        let tmp = tempfile::tempdir().unwrap();
        let (input, output) = (tmp.path().join("in"), tmp.path().join("out"));
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();
        write_inputs(
            &input,
            &["slow\t1\n", "fast\t1\n", "ok\t1\n", "ok\t2\n", "ok\t3\n", "ok\t4\n"],
        );
        let exe = script(
            tmp.path(),
            "flaky.sh",
            r#"read -r line
case "$line" in
  slow*) sleep 1; exit 4 ;;
  fast*) exit 5 ;;
esac
echo "$line""#,
        );

        let mut parallel = stage(exe, &input, &output, 6);
        parallel.workers = 2;
        let err = run_stage(&parallel).await.unwrap_err();

        // Partition 1 fails first, but partition 0 has the lower index.
        match err.downcast_ref::<JobError>() {
            Some(JobError::Subprocess { code, input, .. }) => {
                assert_eq!(*code, Some(4));
                assert!(input.ends_with("part-00000"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(output.join("part-00001").exists());
        for i in 2..6 {
            assert!(!output.join(part_filename(i)).exists(), "partition {i} was launched");
        }
    }

    #[tokio::test]
    async fn parallel_workers_produce_the_same_partitions() {
        let tmp = tempfile::tempdir().unwrap();
        let (input, output) = (tmp.path().join("in"), tmp.path().join("out"));
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();
        let parts: Vec<String> = (0..8).map(|i| format!("k{i}\t{i}\n")).collect();
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        write_inputs(&input, &parts);
        let exe = script(tmp.path(), "cat.sh", "cat");

        let mut parallel = stage(exe, &input, &output, 8);
        parallel.workers = 4;
        let report = run_stage(&parallel).await.unwrap();
        assert_eq!(report.invocations, 8);
        for (path, expected) in output_paths(&parallel).iter().zip(&parts) {
            assert_eq!(fs::read_to_string(path).unwrap(), *expected);
        }
    }

    #[tokio::test]
    async fn keyspace_enforcement_rejects_single_line_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (input, output) = (tmp.path().join("in"), tmp.path().join("out"));
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&output).unwrap();
        write_inputs(&input, &["a\t1\nb\t1\nc\t1\n"]);
        let exe = script(tmp.path(), "fold.sh", "cat > /dev/null\nprintf 'all\\t3\\n'");

        let mut strict = stage(exe.clone(), &input, &output, 1);
        strict.enforce_keyspace = true;
        let err = run_stage(&strict).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::Keyspace { .. })
        ));

        // Without enforcement the same program is fine.
        assert!(run_stage(&stage(exe, &input, &output, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn zero_partitions_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "cat.sh", "cat");
        let report = run_stage(&stage(exe, tmp.path(), tmp.path(), 0)).await.unwrap();
        assert_eq!(report, StageReport::default());
    }
}
