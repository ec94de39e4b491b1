//! Chains of jobs.
//!
//! A pipeline directory holds numbered mapper/reducer pairs such as
//! `map0.py`/`reduce0.py`, `map1.py`/`reduce1.py`, ... Job `i` reads the
//! output of job `i - 1`; the first job reads the pipeline's input.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use glob::{glob, Pattern};
use tracing::info;

use common::utils::list_parts;
use common::Tunables;

use crate::core::{run_job, JobSummary};
use crate::jobs::Job;

/// One mapper/reducer pair of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub index: usize,
    pub mapper: PathBuf,
    pub reducer: PathBuf,
}

/// Leading decimal digits of `name` after `prefix`, e.g. `map12.py` -> 12.
fn step_number(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn find_executables(dir: &Path, prefix: &str) -> Result<BTreeMap<usize, PathBuf>, Error> {
    let dir_str = dir
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", dir.display()))?;
    let pattern = format!("{}/{prefix}*", Pattern::escape(dir_str));

    let mut found = BTreeMap::new();
    for entry in glob(&pattern)? {
        let path = entry.with_context(|| format!("unable to list {}", dir.display()))?;
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(n) = step_number(&name, prefix) {
            if let Some(previous) = found.insert(n, path.clone()) {
                return Err(anyhow!(
                    "{} and {} are both step {}",
                    previous.display(),
                    path.display(),
                    n
                ));
            }
        }
    }
    Ok(found)
}

/// Find the numbered mapper/reducer pairs in `dir`, in step order.
pub fn discover(dir: &Path) -> Result<Vec<PipelineStep>, Error> {
    let mappers = find_executables(dir, "map")?;
    let mut reducers = find_executables(dir, "reduce")?;

    if mappers.is_empty() {
        return Err(anyhow!("no map<N> executables found in {}", dir.display()));
    }

    let mut steps = Vec::with_capacity(mappers.len());
    for (index, mapper) in mappers {
        let reducer = reducers
            .remove(&index)
            .ok_or_else(|| anyhow!("{} has no matching reduce{}", mapper.display(), index))?;
        steps.push(PipelineStep {
            index,
            mapper,
            reducer,
        });
    }
    if let Some((index, reducer)) = reducers.into_iter().next() {
        return Err(anyhow!(
            "{} has no matching map{}",
            reducer.display(),
            index
        ));
    }
    Ok(steps)
}

/// Output directory of step `position` out of `len`.
fn step_output(output_dir: &Path, position: usize, len: usize) -> PathBuf {
    if position + 1 == len {
        output_dir.to_path_buf()
    } else {
        output_dir.join(format!("pipeline-{:02}", position))
    }
}

/// Run every step in order. Stops at the first failing job.
pub async fn run_pipeline(
    input_dir: &Path,
    output_dir: &Path,
    steps: &[PipelineStep],
    enforce_keyspace: bool,
    tunables: &Tunables,
) -> Result<Vec<JobSummary>, Error> {
    let mut summaries = Vec::with_capacity(steps.len());
    let mut input = input_dir.to_path_buf();

    for (position, step) in steps.iter().enumerate() {
        let output = step_output(output_dir, position, steps.len());
        info!(
            "Pipeline step {}/{}: {} | {}",
            position + 1,
            steps.len(),
            step.mapper.display(),
            step.reducer.display()
        );

        let job = Job::new(&input, &output, &step.mapper, &step.reducer)
            .with_enforce_keyspace(enforce_keyspace);
        let summary = run_job(&job, tunables)
            .await
            .with_context(|| format!("pipeline step {} failed", step.index))?;
        summaries.push(summary);
        input = output;
    }
    Ok(summaries)
}

/// Concatenate the `part-*` files of `dir` into `dest`, in name order.
/// Returns the number of bytes written.
pub fn concat_outputs(dir: &Path, dest: &Path) -> Result<u64, Error> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(
        File::create(dest).with_context(|| format!("unable to create {}", dest.display()))?,
    );
    let mut total = 0;
    for part in list_parts(dir)? {
        let mut file =
            File::open(&part).with_context(|| format!("unable to open {}", part.display()))?;
        total += io::copy(&mut file, &mut out)?;
    }
    out.flush()?;
    info!("Concatenated output into {}", dest.display());
    Ok(total)
}
