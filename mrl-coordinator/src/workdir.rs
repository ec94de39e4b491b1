//! The job-scoped temporary working tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tracing::{debug, warn};

/// Name of the temporary tree created inside the job's output directory.
pub const TMP_DIR_NAME: &str = "mrl-tmp";

/// `<output>/mrl-tmp` and its four stage directories.
///
/// Any stale tree is destroyed on creation. The tree is removed again when
/// the value is dropped, whether the job succeeded, failed or was cancelled,
/// unless it was told to keep it.
#[derive(Debug)]
pub struct WorkTree {
    root: PathBuf,
    keep: bool,
}

impl WorkTree {
    pub const MAPPER_INPUT: &'static str = "mapper-input";
    pub const MAPPER_OUTPUT: &'static str = "mapper-output";
    pub const GROUPER_OUTPUT: &'static str = "grouper-output";
    pub const REDUCER_OUTPUT: &'static str = "reducer-output";

    pub fn create(output_dir: &Path, keep: bool) -> Result<Self, Error> {
        let root = output_dir.join(TMP_DIR_NAME);
        if root.is_dir() {
            debug!("Removing stale working tree {}", root.display());
            fs::remove_dir_all(&root)
                .with_context(|| format!("unable to remove {}", root.display()))?;
        }

        let tree = Self { root, keep };
        for dir in [
            tree.mapper_input(),
            tree.mapper_output(),
            tree.grouper_output(),
            tree.reducer_output(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("unable to create {}", dir.display()))?;
        }
        Ok(tree)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mapper_input(&self) -> PathBuf {
        self.root.join(Self::MAPPER_INPUT)
    }

    pub fn mapper_output(&self) -> PathBuf {
        self.root.join(Self::MAPPER_OUTPUT)
    }

    pub fn grouper_output(&self) -> PathBuf {
        self.root.join(Self::GROUPER_OUTPUT)
    }

    pub fn reducer_output(&self) -> PathBuf {
        self.root.join(Self::REDUCER_OUTPUT)
    }
}

impl Drop for WorkTree {
    fn drop(&mut self) {
        if self.keep {
            debug!("Keeping working tree {}", self.root.display());
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!("unable to remove {}: {}", self.root.display(), e);
        }
    }
}
