use std::{path::PathBuf, process::ExitCode};

use anyhow::Error;
use clap::Parser;
use stf_tools::build_config;

const USAGE: &str = "Usage: stf-reader-test <trace>";

/// Times a full pass of the branch reader and of the instruction reader
/// over a trace
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Print the packaging settings and exit
    #[arg(long)]
    build_info: bool,

    /// Increase log verbosity
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    traces: Vec<PathBuf>,
}

fn main() -> Result<ExitCode, Error> {
    let args = Cli::parse();

    if args.build_info {
        println!("{}", build_config::summary());
        return Ok(ExitCode::SUCCESS);
    }

    let [trace] = args.traces.as_slice() else {
        println!("{USAGE}");
        return Ok(ExitCode::from(1));
    };

    stf_trace::logging::init(args.verbose)?;

    stf_tools::profile(trace, |timing| println!("{timing}"))?;

    Ok(ExitCode::SUCCESS)
}
