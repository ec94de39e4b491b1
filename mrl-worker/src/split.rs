//! Turn an input directory into numbered mapper-input partitions.
//!
//! Files smaller than the split size are copied verbatim into one partition
//! each. Larger files are dealt out line by line, round robin, over
//! `ceil(size / split_size)` partitions. Input files are never combined.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::{debug, info};
use walkdir::WalkDir;

use common::{part_filename, JobError};

/// Outcome of splitting an input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    /// Number of partitions written, i.e. the mapper fan-out.
    pub partitions: usize,

    /// Source files in the order they were assigned partitions.
    pub files: Vec<PathBuf>,
}

/// Non-directory entries directly inside `input_dir`, sorted by file name.
fn input_files(input_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(input_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("unable to list {}", input_dir.display()))?;
        if !entry.path().is_dir() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Number of partitions a file of `size` bytes is split into.
pub fn num_splits(size: u64, split_size: u64) -> usize {
    size.div_ceil(split_size) as usize
}

/// Copy and split the files of `input_dir` into `output_dir`, naming them
/// `part-00000`, `part-00001`, ...
pub fn prepare_input_files(
    input_dir: &Path,
    output_dir: &Path,
    split_size: u64,
) -> Result<SplitReport, Error> {
    if !input_dir.is_dir() {
        return Err(JobError::MissingInput {
            path: input_dir.to_path_buf(),
        }
        .into());
    }

    let files = input_files(input_dir)?;
    let mut part_num = 0;

    for in_path in &files {
        let size = fs::metadata(in_path)
            .with_context(|| format!("unable to stat {}", in_path.display()))?
            .len();
        let num_split = num_splits(size, split_size);
        let out_paths: Vec<PathBuf> = (part_num..part_num + num_split)
            .map(|i| output_dir.join(part_filename(i)))
            .collect();
        part_num += num_split;

        debug!(
            "Splitting {} ({} bytes) into {} partition(s)",
            in_path.display(),
            size,
            num_split
        );

        match out_paths.as_slice() {
            [] => {}
            [single] => {
                fs::copy(in_path, single).with_context(|| {
                    format!("unable to copy {} to {}", in_path.display(), single.display())
                })?;
            }
            _ => split_round_robin(in_path, &out_paths)?,
        }
    }

    info!(
        "Prepared {} mapper input partition(s) from {} file(s)",
        part_num,
        files.len()
    );

    Ok(SplitReport {
        partitions: part_num,
        files,
    })
}

/// Line `i` of `in_path` goes to `out_paths[i % out_paths.len()]`. Lines are
/// copied as raw bytes.
fn split_round_robin(in_path: &Path, out_paths: &[PathBuf]) -> Result<(), Error> {
    let file =
        File::open(in_path).with_context(|| format!("unable to open {}", in_path.display()))?;
    let mut reader = BufReader::new(file);

    let mut out_files = out_paths
        .iter()
        .map(|path| {
            File::create(path)
                .map(BufWriter::new)
                .with_context(|| format!("unable to create {}", path.display()))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let fan_out = out_files.len();
    let mut line = Vec::new();
    let mut index = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        out_files[index % fan_out].write_all(&line)?;
        index += 1;
    }

    for out in &mut out_files {
        out.flush()?;
    }
    Ok(())
}
