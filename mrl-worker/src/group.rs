//! The shuffle/group stage.
//!
//! Mapper outputs are concatenated, sorted byte-wise, and dealt out to at
//! most `max_reducers` reducer-input partitions such that all lines sharing
//! a key land in the same partition.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use bytes::Bytes;
use bytesize::ByteSize;
use ext_sort::{buffer::LimitedBufferBuilder, ExternalSorter, ExternalSorterBuilder};
use glob::{glob, Pattern};
use tracing::{debug, info, warn};

use common::utils::list_parts;
use common::{is_part_filename, part_filename, JobError, Record, PART_PREFIX};

pub const SORTED_INPUT: &str = "sorted.in";
pub const SORTED_OUTPUT: &str = "sorted.out";

#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Upper bound on reducer-input partitions.
    pub max_reducers: usize,

    /// Lines held in memory per sorted run.
    pub sort_buffer_lines: usize,

    /// Scratch space for the external sorter's runs.
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    /// Number of reducer-input partitions written.
    pub reducers: usize,

    /// Total record lines grouped.
    pub lines: usize,

    /// Number of distinct keys.
    pub keys: usize,
}

/// Run the group stage over the mapper outputs in `input_dir`, writing
/// reducer inputs to `output_dir`. Returns the number of reducers to run
/// among other totals.
pub fn group_stage(
    input_dir: &Path,
    output_dir: &Path,
    options: &GroupOptions,
) -> Result<GroupReport, Error> {
    info!("Starting group stage");

    let sorted_in = output_dir.join(SORTED_INPUT);
    let sorted_out = output_dir.join(SORTED_OUTPUT);
    info!(
        "+ cat {}/* | sort > {}",
        input_dir.display(),
        sorted_out.display()
    );

    let lines = concat_checked(input_dir, &sorted_in)?;
    external_sort(
        &sorted_in,
        &sorted_out,
        &options.tmp_dir,
        options.sort_buffer_lines,
    )?;

    match partition_sorted(&sorted_out, output_dir, options.max_reducers) {
        Ok((reducers, keys)) => {
            info!(
                "Grouped {} line(s) with {} distinct key(s) into {} reducer partition(s)",
                lines, keys, reducers
            );
            Ok(GroupReport {
                reducers,
                lines,
                keys,
            })
        }
        Err(err) => {
            discard_partitions(output_dir);
            Err(err)
        }
    }
}

/// Mapper outputs in `dir`, in name order.
fn mapper_outputs(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let dir_str = dir
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", dir.display()))?;
    let pattern = format!("{}/{}*", Pattern::escape(dir_str), PART_PREFIX);

    let mut parts = Vec::new();
    for entry in glob(&pattern)? {
        let path = entry.with_context(|| format!("unable to list {}", dir.display()))?;
        let is_part = path
            .file_name()
            .is_some_and(|name| is_part_filename(&name.to_string_lossy()));
        if is_part && path.is_file() {
            parts.push(path);
        }
    }
    Ok(parts)
}

/// Concatenate every mapper output into `dest`, checking that each line is a
/// record. Fails before any reducer input exists if a line has no tab.
fn concat_checked(input_dir: &Path, dest: &Path) -> Result<usize, Error> {
    let mut out = BufWriter::new(
        File::create(dest).with_context(|| format!("unable to create {}", dest.display()))?,
    );
    let mut lines = 0;
    let mut bytes = 0u64;
    let mut line = Vec::new();

    for path in mapper_outputs(input_dir)? {
        let file =
            File::open(&path).with_context(|| format!("unable to open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut line_number = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            line_number += 1;
            if !line.contains(&b'\t') {
                return Err(JobError::MissingTab {
                    path,
                    line_number,
                    line: String::from_utf8_lossy(&line).trim_end().to_string(),
                }
                .into());
            }
            // A mapper may omit the final newline.
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            out.write_all(&line)?;
            bytes += line.len() as u64;
            lines += 1;
        }
    }
    out.flush()?;

    debug!(
        "Concatenated {} line(s) ({}) into {}",
        lines,
        ByteSize::b(bytes),
        dest.display()
    );
    Ok(lines)
}

/// Sort the lines of `input` into `output` using byte-wise ordering, spilling
/// runs of `buffer_lines` lines to `tmp_dir`.
pub fn external_sort(
    input: &Path,
    output: &Path,
    tmp_dir: &Path,
    buffer_lines: usize,
) -> Result<(), Error> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("unable to open {}", input.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("unable to create {}", output.display()))?,
    );

    let sorter: ExternalSorter<String, io::Error, LimitedBufferBuilder> =
        ExternalSorterBuilder::new()
            .with_tmp_dir(tmp_dir)
            .with_buffer(LimitedBufferBuilder::new(buffer_lines, false))
            .build()
            .map_err(|e| anyhow!("unable to build external sorter: {}", e))?;

    let sorted = sorter
        .sort(reader.lines())
        .map_err(|e| anyhow!("unable to sort {}: {}", input.display(), e))?;

    for item in sorted {
        let item = item.map_err(|e| anyhow!("unable to read sorted run: {}", e))?;
        writer.write_all(item.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Deal the sorted stream out to reducer partitions.
///
/// A new key opens a new partition while fewer than `max_reducers` are open,
/// then the circular list of partitions rotates by one. Lines go to the
/// front partition, so a run of identical keys never straddles two
/// partitions. Returns the number of partitions and of distinct keys.
fn partition_sorted(
    sorted: &Path,
    output_dir: &Path,
    max_reducers: usize,
) -> Result<(usize, usize), Error> {
    let reader = BufReader::new(
        File::open(sorted).with_context(|| format!("unable to open {}", sorted.display()))?,
    );

    let mut partitions: VecDeque<BufWriter<File>> = VecDeque::with_capacity(max_reducers);
    let mut prev_key: Option<Bytes> = None;
    let mut keys = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let record = Record::parse(&line).ok_or_else(|| JobError::MissingTab {
            path: sorted.to_path_buf(),
            line_number: index + 1,
            line: line.clone(),
        })?;

        if prev_key.as_ref() != Some(&record.key) {
            prev_key = Some(record.key());
            keys += 1;

            if partitions.len() < max_reducers {
                let path = output_dir.join(part_filename(partitions.len()));
                let file = File::create(&path)
                    .with_context(|| format!("unable to create {}", path.display()))?;
                partitions.push_back(BufWriter::new(file));
            }
            partitions.rotate_right(1);
        }

        // A key change above guarantees at least one open partition.
        let front = partitions
            .front_mut()
            .ok_or_else(|| anyhow!("no open reducer partition"))?;
        front.write_all(line.as_bytes())?;
        front.write_all(b"\n")?;
    }

    for partition in partitions.iter_mut() {
        partition.flush()?;
    }
    Ok((partitions.len(), keys))
}

/// Remove reducer-input partitions after a failed run so none are mistaken
/// for complete output.
fn discard_partitions(output_dir: &Path) {
    match list_parts(output_dir) {
        Ok(parts) => {
            for part in parts {
                if let Err(e) = fs::remove_file(&part) {
                    warn!("unable to remove {}: {}", part.display(), e);
                }
            }
        }
        Err(e) => warn!("unable to list {}: {:#}", output_dir.display(), e),
    }
}
