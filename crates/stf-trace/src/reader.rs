use std::{
    fmt,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Error, bail, ensure};
use log::debug;
use serde::Serialize;

use crate::{
    codec::{is_supported_version, parser::RecordParser},
    descriptor::Descriptor,
    features::TraceFeatures,
    isa::{InstIem, Isa, default_isa_extended},
    records::{Record, RecordResult, TraceInfo},
    stream::{InputStream, TraceOutput, single_threaded_from_env},
    writer::StfWriter,
};

/// Hardware thread, process and thread id of a PROCESS_ID_EXT record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessId {
    pub hw_thread_id: u32,
    pub pid: u32,
    pub tid: u32,
}

/// Everything an STF trace declares before its END_HEADER record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    version_major: u32,
    version_minor: u32,
    comments: Vec<String>,
    isa: Isa,
    iem: InstIem,
    initial_pc: u64,
    trace_infos: Vec<TraceInfo>,
    features: TraceFeatures,
    process_id: Option<ProcessId>,
    vlen: Option<u32>,
    isa_extended: Option<String>,
}

impl Header {
    pub fn version(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn initial_iem(&self) -> InstIem {
        self.iem
    }

    pub fn initial_pc(&self) -> u64 {
        self.initial_pc
    }

    pub fn trace_infos(&self) -> &[TraceInfo] {
        &self.trace_infos
    }

    /// The TRACE_INFO record of the tool that touched the trace last
    pub fn latest_trace_info(&self) -> Option<&TraceInfo> {
        self.trace_infos.last()
    }

    pub fn features(&self) -> TraceFeatures {
        self.features
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn initial_hw_thread_id(&self) -> u32 {
        self.process_id.map_or(0, |id| id.hw_thread_id)
    }

    pub fn initial_pid(&self) -> u32 {
        self.process_id.map_or(0, |id| id.pid)
    }

    pub fn initial_tid(&self) -> u32 {
        self.process_id.map_or(0, |id| id.tid)
    }

    pub fn vlen(&self) -> Option<u32> {
        self.vlen
    }

    /// The explicit ISA_EXTENDED record, if the trace has one
    pub fn explicit_isa_extended(&self) -> Option<&str> {
        self.isa_extended.as_deref()
    }

    /// The ISA_EXTENDED string, falling back to the defaults of the ISA
    pub fn isa_extended(&self) -> Result<String, Error> {
        match &self.isa_extended {
            Some(info) => Ok(info.clone()),
            None => default_isa_extended(self.isa, self.iem),
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Fields of the header seen so far
#[derive(Default)]
struct PartialHeader {
    comments: Vec<String>,
    isa: Option<Isa>,
    iem: Option<InstIem>,
    initial_pc: Option<u64>,
    trace_infos: Vec<TraceInfo>,
    features: Option<TraceFeatures>,
    process_id: Option<ProcessId>,
    vlen: Option<u32>,
    isa_extended: Option<String>,
}

fn set_once<T>(field: &mut Option<T>, value: T, descriptor: Descriptor) -> Result<(), Error> {
    ensure!(
        field.is_none(),
        "Header has multiple {descriptor} records"
    );
    *field = Some(value);
    Ok(())
}

impl PartialHeader {
    fn into_header(self, version_major: u32, version_minor: u32) -> Result<Header, Error> {
        let Some(isa) = self.isa else {
            bail!("ISA record is missing from header");
        };
        let Some(iem) = self.iem else {
            bail!("IEM record is missing from header");
        };
        let Some(initial_pc) = self.initial_pc else {
            bail!("FORCE_PC record is missing from header");
        };
        ensure!(
            !self.trace_infos.is_empty(),
            "TRACE_INFO record missing from header"
        );
        let Some(features) = self.features else {
            bail!("TRACE_INFO_FEATURE record missing from header");
        };

        Ok(Header {
            version_major,
            version_minor,
            comments: self.comments,
            isa,
            iem,
            initial_pc,
            trace_infos: self.trace_infos,
            features,
            process_id: self.process_id,
            vlen: self.vlen,
            isa_extended: self.isa_extended,
        })
    }
}

/// Reads the records of an STF trace.
///
/// The header is parsed when the reader is opened, iterating the reader
/// yields the records that follow END_HEADER.
pub struct StfReader<R: Read = BufReader<InputStream>> {
    parser: RecordParser<R>,
    header: Header,
}

impl StfReader {
    /// Opens the trace at `path` and reads its header. `.zstf` traces are
    /// decompressed in the background unless `STF_SINGLE_THREADED` is set.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or its header is invalid.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stf_trace::reader::StfReader;
    ///
    /// let reader = StfReader::open("trace.zstf").unwrap();
    /// println!("ISA: {}", reader.header().isa());
    ///
    /// let num_records = reader.count();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open_with(path, single_threaded_from_env()?)
    }

    /// Like [`StfReader::open`], with explicit control over background
    /// decompression
    pub fn open_with<P: AsRef<Path>>(path: P, single_threaded: bool) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!("Opening STF trace {}", path.display());
        Self::from_stream(BufReader::new(InputStream::open(path, single_threaded)?))
    }
}

impl<R: Read> StfReader<R> {
    /// Reads the header of an uncompressed STF byte stream
    pub fn from_stream(input: R) -> Result<Self, Error> {
        let mut parser = RecordParser::new(input);

        match parser.next() {
            Some(Ok(Record::Identifier)) => {}
            Some(Ok(record)) => bail!(
                "Specified file looks like an STF, but starts with a {} record instead of IDENTIFIER",
                record.descriptor()
            ),
            Some(Err(e)) => bail!("Specified file is not an STF: {e}"),
            None => bail!("Specified file is not an STF: the file is empty"),
        }

        let (version_major, version_minor) = match parser.next().transpose()? {
            Some(Record::Version { major, minor }) => (major, minor),
            _ => bail!("The second record must be the version"),
        };
        ensure!(
            is_supported_version(version_major, version_minor),
            "Unsupported STF version {version_major}.{version_minor}"
        );

        let mut header = PartialHeader::default();
        loop {
            let Some(record) = parser.next().transpose()? else {
                bail!("STF ended with an incomplete header!");
            };
            let descriptor = record.descriptor();

            match record {
                Record::Comment { data } => header.comments.push(data),
                Record::Isa { isa } => set_once(&mut header.isa, isa, descriptor)?,
                Record::InstIem { iem } => set_once(&mut header.iem, iem, descriptor)?,
                Record::ForcePc { addr } => set_once(&mut header.initial_pc, addr, descriptor)?,
                Record::TraceInfo(info) => header.trace_infos.push(info),
                Record::TraceInfoFeature { features } => {
                    set_once(&mut header.features, features, descriptor)?
                }
                Record::ProcessIdExt {
                    hw_thread_id,
                    pid,
                    tid,
                } => set_once(
                    &mut header.process_id,
                    ProcessId {
                        hw_thread_id,
                        pid,
                        tid,
                    },
                    descriptor,
                )?,
                Record::VlenConfig { vlen } => set_once(&mut header.vlen, vlen, descriptor)?,
                Record::IsaExtended { isa } => {
                    set_once(&mut header.isa_extended, isa, descriptor)?
                }
                Record::EndHeader => break,
                _ => bail!("Encountered unexpected STF record in header: {descriptor}"),
            }
        }

        let header = header.into_header(version_major, version_minor)?;
        debug!(
            "Read STF header: version {version_major}.{version_minor}, ISA {}, IEM {}, features {}",
            header.isa(),
            header.initial_iem(),
            header.features()
        );

        Ok(Self { parser, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Number of records read so far, including the header
    pub fn num_records(&self) -> u64 {
        self.parser.state().num_records()
    }

    /// Number of instruction (marker) records read so far
    pub fn num_marker_records(&self) -> u64 {
        self.parser.state().num_marker_records()
    }

    pub fn vlen(&self) -> Option<u32> {
        self.parser.state().vlen()
    }

    /// Copies every header field into `writer`
    pub fn copy_header<W: TraceOutput>(&self, writer: &mut StfWriter<W>) -> Result<(), Error> {
        let header = &self.header;

        for comment in header.comments() {
            writer.add_comment(comment.clone());
        }
        writer.set_isa(header.isa());
        writer.set_iem(header.initial_iem());
        writer.set_initial_pc(header.initial_pc());
        for info in header.trace_infos() {
            writer.add_trace_info(info.clone());
        }
        writer.set_feature(header.features());
        if let Some(id) = header.process_id() {
            writer.set_process_id(id.hw_thread_id, id.pid, id.tid);
        }
        if let Some(vlen) = header.vlen() {
            writer.set_vlen(vlen)?;
        }
        if let Some(info) = header.explicit_isa_extended() {
            writer.set_isa_extended(info);
        }
        if !header.features().contains(TraceFeatures::EVENT64) {
            writer.force_32bit_events();
        }

        Ok(())
    }
}

impl<R: Read> fmt::Debug for StfReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StfReader")
            .field("header", &self.header)
            .field("num_records", &self.num_records())
            .finish_non_exhaustive()
    }
}

impl<R: Read> Iterator for StfReader<R> {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next()
    }
}
