//! Shared types for the local MapReduce engine. Jobs are run entirely on a
//! single host: user programs are spawned as subprocesses, and every stage
//! hands its data to the next one through numbered partition files.

use bytes::Bytes;

pub mod config;
pub mod error;
pub mod utils;

pub use config::Tunables;
pub use error::{ErrorKind, JobError};

/////////////////////////////////////////////////////////////////////////////
// Partition files
/////////////////////////////////////////////////////////////////////////////

/// Prefix shared by every partition file, following the Hadoop convention.
pub const PART_PREFIX: &str = "part-";

/// Return a partition filename for the given sequence number.
///
/// ```
/// assert_eq!(common::part_filename(3), "part-00003");
/// ```
pub fn part_filename(num: usize) -> String {
    format!("{PART_PREFIX}{:05}", num)
}

/// Returns true if `name` looks like a partition file produced by
/// [`part_filename`].
pub fn is_part_filename(name: &str) -> bool {
    name.strip_prefix(PART_PREFIX)
        .map(|n| n.len() >= 5 && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/////////////////////////////////////////////////////////////////////////////
// Record lines
/////////////////////////////////////////////////////////////////////////////

/// Separator between the key and the value of a record line.
pub const KEY_SEPARATOR: char = '\t';

/// A single record line, split on its first tab.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Record {
    /// Everything before the first tab.
    pub key: Bytes,

    /// Everything after the first tab, including any further tabs.
    pub value: Bytes,
}

impl Record {
    /// Parse a line (without its trailing newline) into a record.
    ///
    /// Returns `None` if the line has no tab.
    pub fn parse(line: &str) -> Option<Self> {
        let (key, value) = line.split_once(KEY_SEPARATOR)?;
        Some(Self {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        })
    }

    /// Get the key of this record.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }
}
