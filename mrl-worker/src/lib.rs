//! The stages of a local MapReduce job: splitting the input, running user
//! programs over partitions, and grouping mapper output by key.

pub mod check;
pub mod group;
pub mod split;
pub mod stage;

pub use check::{check_interpreter, check_keyspace, resolve_executable};
pub use group::{group_stage, GroupOptions, GroupReport};
pub use split::{prepare_input_files, SplitReport};
pub use stage::{run_stage, Stage, StageKind, StageReport};
