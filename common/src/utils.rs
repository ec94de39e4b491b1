use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::is_part_filename;

/// Count the lines of a file. A trailing line without a newline counts.
pub fn count_lines<P: AsRef<Path>>(path: P) -> Result<usize> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("unable to open file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut lines = 0;
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("unable to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        lines += 1;
    }
    Ok(lines)
}

/// List the partition files directly inside `dir`, sorted by name.
pub fn list_parts<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut parts = Vec::new();
    for entry in dir
        .read_dir()
        .with_context(|| format!("unable to list {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && is_part_filename(&name.to_string_lossy()) {
            parts.push(entry.path());
        }
    }
    parts.sort();
    Ok(parts)
}
