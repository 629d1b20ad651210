use std::{
    fs::OpenOptions,
    io::{BufWriter, Write, stdout},
    path::{Path, PathBuf},
};

use anyhow::Error;
use clap::{Parser, ValueEnum};
use log::info;
use stf_trace::{
    DumpEncoder, JsonEncoder, StfReader, StfWriter,
    stream::{FileType, OutputOptions},
    zstf::DEFAULT_CHUNK_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// One line of text per record
    Dump,
    /// One JSON object per record
    Json,
    /// Another STF container, picked from the output file name
    Stf,
}

impl Format {
    fn infer(output: &Path) -> Self {
        match FileType::guess(output) {
            FileType::Zstf | FileType::Gzip | FileType::Xz | FileType::Plain => Format::Stf,
            _ => Format::Dump,
        }
    }
}

/// Dumps or transcodes an STF trace
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Trace to read (`-` for stdin)
    input: PathBuf,

    /// Where to write the result (`-` for stdout)
    output: PathBuf,

    /// Output format. Inferred from the output file name if omitted.
    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Compression level of compressed STF outputs
    #[arg(short, long, allow_negative_numbers = true)]
    level: Option<i32>,

    /// Instructions per chunk of `.zstf` outputs
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Omit PCs of opcode records in dump output
    #[arg(long)]
    no_pc: bool,

    /// Increase log verbosity
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn open_output(path: &Path) -> Result<Box<dyn Write>, Error> {
    if path == Path::new("-") {
        return Ok(Box::new(BufWriter::new(stdout())));
    }
    Ok(Box::new(BufWriter::new(
        OpenOptions::new()
            .truncate(true)
            .write(true)
            .create(true)
            .open(path)?,
    )))
}

fn main() -> Result<(), Error> {
    let args = Cli::parse();
    stf_trace::logging::init(args.verbose)?;

    let reader = StfReader::open(&args.input)?;
    let format = args.format.unwrap_or_else(|| Format::infer(&args.output));

    match format {
        Format::Dump => {
            let mut encoder = DumpEncoder::new();
            if args.no_pc {
                encoder = encoder.hide_pc();
            }
            stf_trace::convert(reader, &mut encoder, open_output(&args.output)?)?;
        }
        Format::Json => {
            stf_trace::convert(reader, &mut JsonEncoder::new(), open_output(&args.output)?)?;
        }
        Format::Stf => {
            let options = OutputOptions {
                compression_level: args.level,
                chunk_size: args.chunk_size,
            };
            let mut writer = StfWriter::create_with(&args.output, options)?;
            let num_records = stf_trace::transcode(reader, &mut writer)?;
            info!(
                "Wrote {num_records} records to {}",
                args.output.display()
            );
        }
    }

    Ok(())
}
