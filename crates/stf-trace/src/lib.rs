use std::io::{Read, Write};

use anyhow::Error;
use log::info;

use crate::{generic::Encoder, isa::TraceGenerator, records::TraceInfo, stream::TraceOutput};

/// Branch instructions and their decoded properties
pub mod branch;
pub mod branch_decoder;
pub mod branch_reader;
/// Binary encoding and decoding of single STF records
pub mod codec;
pub mod descriptor;
pub mod event;
pub mod features;
/// Generic traits and structs for encoding record streams into other formats
pub mod generic;
pub mod inst;
pub mod inst_reader;
pub mod isa;
pub mod logging;
mod pc_tracker;
pub mod reader;
pub mod records;
pub mod registers;
/// Plain, compressed and process-backed trace files
pub mod stream;
pub mod writer;
/// The chunked, zstd-compressed `.zstf` container
pub mod zstf;

pub use branch::Branch;
pub use branch_reader::BranchReader;
pub use generic::{DumpEncoder, JsonEncoder};
pub use inst::Inst;
pub use inst_reader::{InstReader, InstReaderBuilder};
pub use reader::{Header, StfReader};
pub use records::Record;
pub use writer::StfWriter;

/// Converts the records of a trace into the format of `encoder`
pub fn convert<E: Encoder, R: Read, O: Write>(
    reader: StfReader<R>,
    encoder: &mut E,
    mut output: O,
) -> Result<(), Error> {
    let header = reader.header().clone();
    encoder.encode(&header, reader, &mut output)?;

    output.flush()?;

    Ok(())
}

/// Copies a trace into `writer`, e.g. to recompress an `.stf` as `.zstf`.
/// Returns the number of body records written.
pub fn transcode<R: Read, W: TraceOutput>(
    reader: StfReader<R>,
    writer: &mut StfWriter<W>,
) -> Result<u64, Error> {
    reader.copy_header(writer)?;
    writer.add_trace_info(TraceInfo::new(
        TraceGenerator::StfExtract,
        0,
        1,
        0,
        "stf-trace transcode",
    ));
    writer.finalize_header()?;

    let mut num_records = 0;
    for record in reader {
        writer.write(&record?)?;
        num_records += 1;
    }
    writer.close()?;

    info!(
        "Transcoded {num_records} records ({} instructions)",
        writer.num_marker_records()
    );

    Ok(num_records)
}
