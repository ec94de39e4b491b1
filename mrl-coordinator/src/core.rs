//! Runs a job from start to finish: split, map, group, reduce, then copy
//! the reducer outputs into the user's output directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::info;

use common::Tunables;
use mrl_worker::stage::output_paths;
use mrl_worker::{
    check_interpreter, group_stage, prepare_input_files, resolve_executable, run_stage,
    GroupOptions, GroupReport, Stage, StageKind, StageReport,
};

use crate::jobs::{Job, JobState, JobTracker};
use crate::workdir::WorkTree;

/// What a finished job did.
#[derive(Debug, Clone)]
pub struct JobSummary {
    /// Number of mapper invocations.
    pub mappers: usize,

    /// Number of reducer invocations.
    pub reducers: usize,

    pub map: StageReport,
    pub group: GroupReport,
    pub reduce: StageReport,

    /// Final `part-*` files in the output directory.
    pub outputs: Vec<PathBuf>,

    /// States the job went through.
    pub states: Vec<JobState>,
}

/// Run `job` to completion.
///
/// Any stage failure aborts the remaining stages; there are no retries. The
/// temporary working tree is removed on every exit path unless
/// `tunables.keep_tmp` is set.
pub async fn run_job(job: &Job, tunables: &Tunables) -> Result<JobSummary, Error> {
    let mut tracker = JobTracker::new();
    match execute(job, tunables, &mut tracker).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            tracker.fail();
            Err(err)
        }
    }
}

async fn execute(
    job: &Job,
    tunables: &Tunables,
    tracker: &mut JobTracker,
) -> Result<JobSummary, Error> {
    tunables.validate()?;

    let output_dir = job.get_output_dir();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("unable to create {}", output_dir.display()))?;
    let tree = WorkTree::create(output_dir, tunables.keep_tmp)?;

    // Copy and rename input files: part-00000, part-00001, etc.
    tracker.advance(JobState::Split)?;
    info!(
        "Splitting {} (split size {})",
        job.get_input_dir().display(),
        tunables.split_size_display()
    );
    let split = prepare_input_files(
        job.get_input_dir(),
        &tree.mapper_input(),
        tunables.split_size,
    )?;

    // Executables must be absolute paths with the expected interpreter line.
    let mapper = resolve_executable(job.get_mapper())?;
    let reducer = resolve_executable(job.get_reducer())?;
    check_interpreter(&mapper, &tunables.interpreter)?;
    check_interpreter(&reducer, &tunables.interpreter)?;

    tracker.advance(JobState::Map)?;
    let map_stage = Stage {
        kind: StageKind::Map,
        exe: mapper,
        input_dir: tree.mapper_input(),
        output_dir: tree.mapper_output(),
        count: split.partitions,
        enforce_keyspace: job.enforces_keyspace(),
        workers: tunables.workers,
    };
    let map = run_stage(&map_stage).await?;

    tracker.advance(JobState::Group)?;
    let options = GroupOptions {
        max_reducers: tunables.max_reducers,
        sort_buffer_lines: tunables.sort_buffer_lines,
        tmp_dir: tree.root().to_path_buf(),
    };
    let (group_in, group_out) = (tree.mapper_output(), tree.grouper_output());
    let group =
        tokio::task::spawn_blocking(move || group_stage(&group_in, &group_out, &options))
            .await??;

    tracker.advance(JobState::Reduce)?;
    let reduce_stage = Stage {
        kind: StageKind::Reduce,
        exe: reducer,
        input_dir: tree.grouper_output(),
        output_dir: tree.reducer_output(),
        count: group.reducers,
        enforce_keyspace: job.enforces_keyspace(),
        workers: tunables.workers,
    };
    let reduce = run_stage(&reduce_stage).await?;

    let outputs = copy_outputs(&output_paths(&reduce_stage), output_dir)?;
    tracker.advance(JobState::Done)?;

    // Remind user where to find output
    info!("Output directory: {}", output_dir.display());

    Ok(JobSummary {
        mappers: split.partitions,
        reducers: group.reducers,
        map,
        group,
        reduce,
        outputs,
        states: tracker.get_history().to_vec(),
    })
}

/// Copy each reducer output into `output_dir`, keeping its file name.
fn copy_outputs(parts: &[PathBuf], output_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut copied = Vec::with_capacity(parts.len());
    for part in parts {
        let name = part
            .file_name()
            .with_context(|| format!("{} has no file name", part.display()))?;
        let dest = output_dir.join(name);
        fs::copy(part, &dest).with_context(|| {
            format!("unable to copy {} to {}", part.display(), dest.display())
        })?;
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    use common::{ErrorKind, JobError, Record};

    use crate::workdir::TMP_DIR_NAME;

    pub(crate) const IDENTITY: &str = "cat";

    /// Sum the integer values per key, assuming input sorted by key.
    pub(crate) const SUM: &str = r#"awk -F '\t' '
$1 != key { if (NR > 1) print key "\t" sum; key = $1; sum = 0 }
{ sum += $2 }
END { if (NR > 0) print key "\t" sum }'"#;

    pub(crate) fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn sh_tunables() -> Tunables {
        Tunables {
            interpreter: "#!/bin/sh".to_string(),
            ..Tunables::default()
        }
    }

    /// Parse every output partition into key -> value.
    pub(crate) fn read_output(outputs: &[PathBuf]) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        for path in outputs {
            for line in fs::read_to_string(path).unwrap().lines() {
                let record = Record::parse(line).unwrap();
                result.insert(
                    String::from_utf8(record.key.to_vec()).unwrap(),
                    String::from_utf8(record.value.to_vec()).unwrap(),
                );
            }
        }
        result
    }

    struct Setup {
        tmp: tempfile::TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn setup(content: &str) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("input");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("input.txt"), content).unwrap();
        let output = tmp.path().join("output");
        Setup { tmp, input, output }
    }

    #[tokio::test]
    async fn sums_counts_per_key() {
        let s = setup("a\t1\nb\t1\na\t1\n");
        let mapper = script(s.tmp.path(), "map.sh", IDENTITY);
        let reducer = script(s.tmp.path(), "reduce.sh", SUM);
        let job = Job::new(&s.input, &s.output, mapper, reducer);

        let summary = run_job(&job, &sh_tunables()).await.unwrap();
        assert_eq!(summary.mappers, 1);
        assert_eq!(summary.reducers, 2);
        assert_eq!(
            summary.states.last().copied(),
            Some(JobState::Done)
        );

        let expected: BTreeMap<String, String> =
            [("a", "2"), ("b", "1")].map(|(k, v)| (k.to_string(), v.to_string())).into();
        assert_eq!(read_output(&summary.outputs), expected);
        assert!(s.output.join("part-00000").is_file());
        assert!(s.output.join("part-00001").is_file());
        assert!(!s.output.join(TMP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn output_dir_with_glob_characters_keeps_every_record() {
        let s = setup("a\t1\nb\t1\na\t1\n");
        let mapper = script(s.tmp.path(), "map.sh", IDENTITY);
        let reducer = script(s.tmp.path(), "reduce.sh", SUM);
        let output = s.tmp.path().join("out[1]");
        let job = Job::new(&s.input, &output, mapper, reducer);

        let summary = run_job(&job, &sh_tunables()).await.unwrap();
        assert_eq!(summary.group.lines, 3);
        assert_eq!(summary.reducers, 2);
        assert_eq!(read_output(&summary.outputs)["a"], "2");
        assert_eq!(read_output(&summary.outputs)["b"], "1");
    }

    #[tokio::test]
    async fn bad_interpreter_fails_before_any_subprocess() {
        let s = setup("a\t1\n");
        let marker = s.tmp.path().join("ran");
        let mapper = script(
            s.tmp.path(),
            "map.sh",
            &format!("touch {}\ncat", marker.display()),
        );
        let reducer = s.tmp.path().join("reduce.py");
        fs::write(&reducer, "#!/usr/bin/python\nprint('x')\n").unwrap();
        fs::set_permissions(&reducer, fs::Permissions::from_mode(0o755)).unwrap();

        let job = Job::new(&s.input, &s.output, mapper, &reducer);
        let err = run_job(&job, &sh_tunables()).await.unwrap_err();
        match err.downcast_ref::<JobError>() {
            Some(JobError::BadInterpreter { line, path, .. }) => {
                assert_eq!(line, "#!/usr/bin/python");
                assert!(path.ends_with("reduce.py"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn mapper_output_without_tab_aborts_the_job() {
        let s = setup("a\t1\n");
        let mapper = script(s.tmp.path(), "map.sh", "cat > /dev/null\necho 'no tab'");
        let reducer = script(s.tmp.path(), "reduce.sh", IDENTITY);
        let job = Job::new(&s.input, &s.output, mapper, reducer);

        let mut tunables = sh_tunables();
        tunables.keep_tmp = true;
        let err = run_job(&job, &tunables).await.unwrap_err();
        let job_err = err.downcast_ref::<JobError>().unwrap();
        assert_eq!(job_err.kind(), ErrorKind::RecordFormat);

        let grouper_output = s.output.join(TMP_DIR_NAME).join(WorkTree::GROUPER_OUTPUT);
        assert!(common::utils::list_parts(&grouper_output).unwrap().is_empty());
        assert!(!s.output.join("part-00000").exists());
    }

    #[tokio::test]
    async fn failing_reducer_fails_the_job() {
        let s = setup("a\t1\n");
        let mapper = script(s.tmp.path(), "map.sh", IDENTITY);
        let reducer = script(s.tmp.path(), "reduce.sh", "cat > /dev/null\nexit 2");
        let job = Job::new(&s.input, &s.output, mapper, reducer);

        let err = run_job(&job, &sh_tunables()).await.unwrap_err();
        match err.downcast_ref::<JobError>() {
            Some(JobError::Subprocess { stage, code, .. }) => {
                assert_eq!(stage, "reduce");
                assert_eq!(*code, Some(2));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!s.output.join(TMP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn missing_input_dir_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mapper = script(tmp.path(), "map.sh", IDENTITY);
        let job = Job::new(
            tmp.path().join("nope"),
            tmp.path().join("out"),
            &mapper,
            &mapper,
        );
        let err = run_job(&job, &sh_tunables()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::MissingInput { .. })
        ));
    }

    #[tokio::test]
    async fn strict_keyspace_rejects_folding_mapper() {
        let s = setup("a\t1\nb\t1\nc\t1\n");
        let mapper = script(s.tmp.path(), "map.sh", "cat > /dev/null\nprintf 'x\\t3\\n'");
        let reducer = script(s.tmp.path(), "reduce.sh", IDENTITY);
        let job = Job::new(&s.input, &s.output, mapper, reducer).with_enforce_keyspace(true);

        let err = run_job(&job, &sh_tunables()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<JobError>().map(JobError::kind),
            Some(ErrorKind::Keyspace)
        );
    }

    #[tokio::test]
    async fn parallel_workers_match_sequential_output() {
        let content: String = (0..400).map(|i| format!("w{}\t1\n", i % 23)).collect();
        let s = setup(&content);
        fs::write(s.input.join("second.txt"), &content).unwrap();
        let mapper = script(s.tmp.path(), "map.sh", IDENTITY);
        let reducer = script(s.tmp.path(), "reduce.sh", SUM);

        let sequential = Job::new(&s.input, s.tmp.path().join("seq"), &mapper, &reducer);
        let parallel = Job::new(&s.input, s.tmp.path().join("par"), &mapper, &reducer);

        let mut tunables = sh_tunables();
        tunables.split_size = 1024;
        let a = run_job(&sequential, &tunables).await.unwrap();
        tunables.workers = 4;
        let b = run_job(&parallel, &tunables).await.unwrap();

        assert!(a.mappers > 2);
        assert_eq!(a.mappers, b.mappers);
        assert_eq!(a.reducers, 4);
        for (x, y) in a.outputs.iter().zip(&b.outputs) {
            assert_eq!(fs::read(x).unwrap(), fs::read(y).unwrap());
        }
        let totals = read_output(&a.outputs);
        assert_eq!(totals.len(), 23);
        assert_eq!(totals["w0"], "36");
    }
}
