use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Error};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::Tunables;
use mrl_coordinator::{concat_outputs, discover, run_job, run_pipeline, Job};

mod args;
use args::{normalize, Args};

/// Build the tunables from the optional config file, then apply flags.
fn tunables(args: &Args) -> Result<Tunables, Error> {
    let mut tunables = match &args.config {
        Some(path) => Tunables::from_file(path)?,
        None => Tunables::default(),
    };
    if let Some(workers) = args.workers {
        tunables.workers = workers;
    }
    if let Some(split_size) = args.split_size {
        tunables.split_size = split_size.as_u64();
    }
    if let Some(max_reducers) = args.max_reducers {
        tunables.max_reducers = max_reducers;
    }
    if let Some(interpreter) = &args.interpreter {
        tunables.interpreter = interpreter.clone();
    }
    tunables.keep_tmp |= args.keep_tmp;
    tunables.validate()?;
    Ok(tunables)
}

async fn run(args: Args) -> Result<(), Error> {
    let tunables = tunables(&args)?;

    match &args.pipeline {
        Some(dir) => {
            let steps = discover(dir)?;
            info!("Running pipeline of {} job(s) from {}", steps.len(), dir.display());
            run_pipeline(
                &args.input,
                &args.output,
                &steps,
                args.enforce_keyspace,
                &tunables,
            )
            .await?;
        }
        None => {
            let (mapper, reducer) = args
                .mapper
                .as_ref()
                .zip(args.reducer.as_ref())
                .context("both -mapper and -reducer are required")?;
            let job = Job::new(&args.input, &args.output, mapper, reducer)
                .with_enforce_keyspace(args.enforce_keyspace);
            run_job(&job, &tunables).await?;
        }
    }

    if let Some(dest) = &args.concat {
        concat_outputs(&args.output, dest)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let args = Args::parse_from(normalize(std::env::args()));

    let result = tokio::select! {
        result = run(args) => result,
        _ = signal::ctrl_c() => Err(anyhow!("interrupted, job cancelled")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
