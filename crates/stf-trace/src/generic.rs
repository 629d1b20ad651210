use std::io::Write;

use anyhow::Error;

use crate::{
    reader::Header,
    records::{MemAccessType, Record, RecordResult},
};

/// Writes the records of a trace in some output format.
pub trait Encoder {
    /// Encodes `header` followed by every record of `input`. Stops at the
    /// first record that failed to parse.
    fn encode<W: Write, I: IntoIterator<Item = RecordResult>>(
        &mut self,
        header: &Header,
        input: I,
        output: W,
    ) -> Result<(), Error>;

    /// Name of the output format
    fn format(&self) -> &'static str;
}

fn access_name(access: MemAccessType) -> &'static str {
    match access {
        MemAccessType::Invalid => "INVALID",
        MemAccessType::Read => "READ",
        MemAccessType::Write => "WRITE",
    }
}

/// Human-readable output with one line per record
pub struct DumpEncoder {
    show_pc: bool,
}

impl DumpEncoder {
    pub fn new() -> Self {
        Self { show_pc: true }
    }

    /// Omits the PC in front of opcode records
    pub fn hide_pc(mut self) -> Self {
        self.show_pc = false;
        self
    }

    fn dump_header<W: Write>(header: &Header, output: &mut W) -> Result<(), Error> {
        let (major, minor) = header.version();
        writeln!(output, "VERSION {major}.{minor}")?;
        for comment in header.comments() {
            writeln!(output, "COMMENT {comment}")?;
        }
        writeln!(output, "ISA {}", header.isa())?;
        writeln!(output, "INST_IEM {}", header.initial_iem())?;
        writeln!(output, "FORCE_PC {:016x}", header.initial_pc())?;
        for info in header.trace_infos() {
            writeln!(
                output,
                "TRACE_INFO {} {} {}",
                info.generator,
                info.version_string(),
                info.comment
            )?;
        }
        writeln!(output, "TRACE_INFO_FEATURE {}", header.features())?;
        if let Some(id) = header.process_id() {
            writeln!(
                output,
                "PROCESS_ID_EXT hw_thread_id={} pid={} tid={}",
                id.hw_thread_id, id.pid, id.tid
            )?;
        }
        if let Some(vlen) = header.vlen() {
            writeln!(output, "VLEN_CONFIG {vlen}")?;
        }
        if let Some(isa_extended) = header.explicit_isa_extended() {
            writeln!(output, "ISA_EXTENDED {isa_extended}")?;
        }
        writeln!(output, "END_HEADER")?;
        Ok(())
    }

    fn dump_record<W: Write>(&self, record: &Record, output: &mut W) -> Result<(), Error> {
        write!(output, "{}", record.descriptor())?;

        match record {
            Record::Identifier | Record::EndHeader => {}
            Record::Version { major, minor } => write!(output, " {major}.{minor}")?,
            Record::Comment { data } => write!(output, " {data}")?,
            Record::Isa { isa } => write!(output, " {isa}")?,
            Record::InstIem { iem } => write!(output, " {iem}")?,
            Record::TraceInfo(info) => write!(
                output,
                " {} {} {}",
                info.generator,
                info.version_string(),
                info.comment
            )?,
            Record::TraceInfoFeature { features } => write!(output, " {features}")?,
            Record::ProcessIdExt {
                hw_thread_id,
                pid,
                tid,
            } => write!(output, " hw_thread_id={hw_thread_id} pid={pid} tid={tid}")?,
            Record::VlenConfig { vlen } => write!(output, " {vlen}")?,
            Record::IsaExtended { isa } => write!(output, " {isa}")?,
            Record::ForcePc { addr }
            | Record::InstPcTarget { addr }
            | Record::EventPcTarget { addr } => write!(output, " {addr:016x}")?,
            Record::InstReg(reg) => {
                write!(output, " {} {}", reg.operand, reg.reg)?;
                for word in &reg.data {
                    write!(output, " {word:016x}")?;
                }
            }
            Record::InstReadyReg { reg } => write!(output, " {reg}")?,
            Record::PageTableWalk(walk) => {
                write!(
                    output,
                    " va={:016x} index={} page_size={:#x}",
                    walk.va, walk.index, walk.page_size
                )?;
                for entry in &walk.entries {
                    write!(output, " pa={:016x} pte={:016x}", entry.pa, entry.pte)?;
                }
            }
            Record::InstMemAccess(access) => write!(
                output,
                " {} {:016x} size={} attr={:#x}",
                access_name(access.access),
                access.address,
                access.size,
                access.attr
            )?,
            Record::InstMemContent { data } | Record::BusMasterContent { data } => {
                write!(output, " {data:016x}")?
            }
            Record::BusMasterAccess(access) => write!(
                output,
                " {} {:016x} size={} src={:?}:{} attr={:#x}",
                access_name(access.access),
                access.address,
                access.size,
                access.src_type,
                access.src_idx,
                access.attr
            )?,
            Record::Event { event, content } => {
                write!(output, " {event}")?;
                for word in content {
                    write!(output, " {word:#x}")?;
                }
            }
            Record::InstMicroop { size, microop } => write!(output, " {size} {microop:08x}")?,
            Record::InstOpcode32 { opcode, pc } => {
                if self.show_pc {
                    write!(output, " {pc:016x}")?;
                }
                write!(output, " {opcode:08x}")?;
            }
            Record::InstOpcode16 { opcode, pc } => {
                if self.show_pc {
                    write!(output, " {pc:016x}")?;
                }
                write!(output, "     {opcode:04x}")?;
            }
        }

        writeln!(output)?;
        Ok(())
    }
}

impl Default for DumpEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for DumpEncoder {
    fn encode<W: Write, I: IntoIterator<Item = RecordResult>>(
        &mut self,
        header: &Header,
        input: I,
        mut output: W,
    ) -> Result<(), Error> {
        Self::dump_header(header, &mut output)?;
        for record in input {
            self.dump_record(&record?, &mut output)?;
        }
        Ok(())
    }

    fn format(&self) -> &'static str {
        "dump"
    }
}

/// Newline-delimited JSON: the header object followed by one object per
/// record
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for JsonEncoder {
    fn encode<W: Write, I: IntoIterator<Item = RecordResult>>(
        &mut self,
        header: &Header,
        input: I,
        mut output: W,
    ) -> Result<(), Error> {
        serde_json::to_writer(&mut output, header)?;
        writeln!(output)?;
        for record in input {
            serde_json::to_writer(&mut output, &record?)?;
            writeln!(output)?;
        }
        Ok(())
    }

    fn format(&self) -> &'static str {
        "json"
    }
}
