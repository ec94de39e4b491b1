use std::path::PathBuf;

use bytesize::ByteSize;
use clap::Parser;

/// Flags accepted with a single dash, hadoop-streaming style.
const STREAMING_FLAGS: [&str; 4] = ["input", "output", "mapper", "reducer"];

/// Long options that take a value.
const VALUE_OPTIONS: [&str; 11] = [
    "input",
    "output",
    "mapper",
    "reducer",
    "pipeline",
    "concat",
    "workers",
    "split-size",
    "max-reducers",
    "interpreter",
    "config",
];

/// Long options that are plain switches.
const SWITCH_OPTIONS: [&str; 4] = ["enforce-keyspace", "keep-tmp", "help", "version"];

/// Lightweight Hadoop work-alike.
///
/// Runs a mapper and a reducer over an input directory on this machine,
/// using subprocesses and the filesystem in place of a cluster.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding the input files.
    #[arg(long)]
    pub input: PathBuf,

    /// Directory the `part-*` output files are written to.
    #[arg(long)]
    pub output: PathBuf,

    /// Mapper executable.
    #[arg(long, required_unless_present = "pipeline")]
    pub mapper: Option<PathBuf>,

    /// Reducer executable.
    #[arg(long, required_unless_present = "pipeline")]
    pub reducer: Option<PathBuf>,

    /// Run every numbered map<N>/reduce<N> pair found in this directory.
    #[arg(long, conflicts_with_all = ["mapper", "reducer"])]
    pub pipeline: Option<PathBuf>,

    /// Fail if a program collapses a multi-line partition into one line.
    #[arg(long)]
    pub enforce_keyspace: bool,

    /// JSON file with tunables. Flags given here take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrent mapper or reducer processes.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Input files at least this large are split, e.g. `1MiB`.
    #[arg(long)]
    pub split_size: Option<ByteSize>,

    /// Maximum number of reducers.
    #[arg(long)]
    pub max_reducers: Option<usize>,

    /// Required first line of the mapper and reducer.
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Keep the temporary working tree after the job.
    #[arg(long)]
    pub keep_tmp: bool,

    /// Also concatenate the final output into this file.
    #[arg(long)]
    pub concat: Option<PathBuf>,
}

/// Rewrite a hadoop-streaming command line into one clap understands.
///
/// `-input x` becomes `--input x`. Flags we don't know, and stray words such
/// as `jar hadoop-streaming.jar`, are dropped.
pub fn normalize<I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut raw = raw.into_iter();
    let mut args: Vec<String> = raw.next().into_iter().collect();
    let mut rest = raw.peekable();

    while let Some(token) = rest.next() {
        let name = if let Some(long) = token.strip_prefix("--") {
            long.split('=').next().unwrap_or_default().to_string()
        } else if let Some(short) = token.strip_prefix('-') {
            let (flag, value) = match short.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (short, None),
            };
            if STREAMING_FLAGS.contains(&flag) {
                if let Some(value) = value {
                    args.push(format!("--{flag}={value}"));
                    continue;
                }
                flag.to_string()
            } else if short == "h" || short == "V" {
                args.push(token);
                continue;
            } else {
                String::new()
            }
        } else {
            // Positional words are not part of our interface.
            continue;
        };

        let inline_value = token.contains('=');
        let takes_value = VALUE_OPTIONS.contains(&name.as_str());
        if takes_value || SWITCH_OPTIONS.contains(&name.as_str()) {
            if inline_value {
                args.push(token);
            } else {
                args.push(format!("--{name}"));
                if takes_value {
                    if let Some(value) = rest.next() {
                        args.push(value);
                    }
                }
            }
        } else if !inline_value && rest.peek().is_some_and(|next| !next.starts_with('-')) {
            // Unknown flag: swallow its value too.
            rest.next();
        }
    }
    args
}
