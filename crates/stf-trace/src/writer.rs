use std::path::Path;

use anyhow::{Error, bail, ensure};
use log::{debug, warn};

use crate::{
    codec::{CURRENT_VERSION_MAJOR, CURRENT_VERSION_MINOR, encoder::RecordEncoder},
    descriptor::Descriptor,
    features::TraceFeatures,
    isa::{InstIem, Isa},
    reader::ProcessId,
    records::{Record, TraceInfo},
    stream::{OutputOptions, OutputStream, TraceOutput},
};

/// Header records that have already been written to the stream
#[derive(Debug, Default)]
struct WrittenHeader {
    comments: bool,
    isa: bool,
    iem: bool,
    trace_infos: bool,
    features: bool,
    process_id: bool,
    initial_pc: bool,
    vlen: bool,
    isa_extended: bool,
}

/// Writes an STF trace.
///
/// Header fields are collected by the setters and written in their
/// mandatory order by [`StfWriter::finalize_header`]. Body records passed to
/// [`StfWriter::write`] are checked against the record ordering rules.
pub struct StfWriter<W: TraceOutput = OutputStream> {
    encoder: RecordEncoder<W>,

    comments: Vec<String>,
    isa: Option<Isa>,
    iem: Option<InstIem>,
    initial_pc: Option<u64>,
    trace_infos: Vec<TraceInfo>,
    features: Option<TraceFeatures>,
    process_id: Option<ProcessId>,
    vlen: Option<u32>,
    isa_extended: Option<String>,
    force_32bit_events: bool,

    written: WrittenHeader,
    header_started: bool,
    header_finalized: bool,

    last_descriptor: Option<Descriptor>,
    wrote_event_record_group: bool,
    wrote_page_table_walk: bool,
    wrote_reg: bool,

    closed: bool,
}

impl StfWriter {
    /// Creates a trace at `path` with default compression settings.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be created or its extension has no writer.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stf_trace::{
    ///     features::TraceFeatures,
    ///     isa::{InstIem, Isa, TraceGenerator},
    ///     records::{Record, TraceInfo},
    ///     writer::StfWriter,
    /// };
    ///
    /// let mut writer = StfWriter::create("trace.zstf").unwrap();
    /// writer.set_isa(Isa::Riscv);
    /// writer.set_iem(InstIem::Rv64);
    /// writer.set_initial_pc(0x8000_0000);
    /// writer.add_trace_info(TraceInfo::new(TraceGenerator::Spike, 1, 0, 0, ""));
    /// writer.set_feature(TraceFeatures::RV64);
    /// writer.finalize_header().unwrap();
    ///
    /// writer.write(&Record::opcode32(0x0000_0013)).unwrap();
    /// writer.close().unwrap();
    /// ```
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::create_with(path, OutputOptions::default())
    }

    pub fn create_with<P: AsRef<Path>>(path: P, options: OutputOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!("Creating STF trace {}", path.display());
        Self::new(OutputStream::create(path, options)?)
    }
}

impl<W: TraceOutput> StfWriter<W> {
    /// Starts a trace on `output` by writing the IDENTIFIER and VERSION
    /// records
    pub fn new(output: W) -> Result<Self, Error> {
        let mut writer = Self {
            encoder: RecordEncoder::new(output),
            comments: Vec::new(),
            isa: None,
            iem: None,
            initial_pc: None,
            trace_infos: Vec::new(),
            features: None,
            process_id: None,
            vlen: None,
            isa_extended: None,
            force_32bit_events: false,
            written: WrittenHeader::default(),
            header_started: false,
            header_finalized: false,
            last_descriptor: None,
            wrote_event_record_group: false,
            wrote_page_table_walk: false,
            wrote_reg: false,
            closed: false,
        };

        writer.write(&Record::Identifier)?;
        writer.write(&Record::Version {
            major: CURRENT_VERSION_MAJOR,
            minor: CURRENT_VERSION_MINOR,
        })?;
        writer.header_started = true;

        Ok(writer)
    }

    pub fn add_comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    pub fn set_isa(&mut self, isa: Isa) {
        self.isa = Some(isa);
    }

    pub fn set_iem(&mut self, iem: InstIem) {
        self.iem = Some(iem);
    }

    pub fn set_initial_pc(&mut self, pc: u64) {
        self.initial_pc = Some(pc);
    }

    /// Appends a TRACE_INFO record. Every tool that touches a trace adds
    /// its own.
    pub fn add_trace_info(&mut self, info: TraceInfo) {
        self.trace_infos.push(info);
    }

    pub fn set_feature(&mut self, features: TraceFeatures) {
        self.features
            .get_or_insert_with(TraceFeatures::empty)
            .insert(features);
    }

    pub fn disable_feature(&mut self, features: TraceFeatures) {
        if let Some(current) = self.features.as_mut() {
            current.remove(features);
        }
    }

    pub fn set_process_id(&mut self, hw_thread_id: u32, pid: u32, tid: u32) {
        self.process_id = Some(ProcessId {
            hw_thread_id,
            pid,
            tid,
        });
    }

    pub fn set_vlen(&mut self, vlen: u32) -> Result<(), Error> {
        ensure!(vlen > 0, "Vector length must be greater than 0");
        self.vlen = Some(vlen);
        Ok(())
    }

    /// Sets the ISA_EXTENDED string. An empty string removes the record.
    pub fn set_isa_extended(&mut self, isa_extended: impl Into<String>) {
        let isa_extended = isa_extended.into();
        self.isa_extended = (!isa_extended.is_empty()).then_some(isa_extended);
    }

    /// Keeps EVENT records at 32 bits even for RV64 traces
    pub fn force_32bit_events(&mut self) {
        self.force_32bit_events = true;
    }

    pub fn header_finalized(&self) -> bool {
        self.header_finalized
    }

    /// Number of records written so far, including the header
    pub fn num_records(&self) -> u64 {
        self.encoder.state().num_records()
    }

    /// Number of instruction (marker) records written so far
    pub fn num_marker_records(&self) -> u64 {
        self.encoder.state().num_marker_records()
    }

    /// Writes all header records that have been set but not written yet.
    ///
    /// # Errors
    ///
    /// Fails once the header has been finalized, or if a header record
    /// would end up in front of a record that has already been written
    /// although it must come after it.
    pub fn flush_header(&mut self) -> Result<(), Error> {
        ensure!(
            !self.header_finalized,
            "Cannot write anything else to the header after it has been finalized"
        );

        if !self.comments.is_empty() && !self.written.comments {
            ensure!(
                !self.written.isa
                    && !self.written.iem
                    && !self.written.trace_infos
                    && !self.written.features
                    && !self.written.process_id
                    && !self.written.initial_pc
                    && !self.written.vlen
                    && !self.written.isa_extended,
                "Header comment block must come before any other header records"
            );
            for comment in std::mem::take(&mut self.comments) {
                self.write(&Record::Comment { data: comment })?;
            }
            self.written.comments = true;
        }

        if let (Some(isa), false) = (self.isa, self.written.isa) {
            ensure!(
                !self.written.iem
                    && !self.written.initial_pc
                    && !self.written.trace_infos
                    && !self.written.features,
                "ISA record must come before IEM, FORCE_PC, TRACE_INFO, or TRACE_INFO_FEATURE records"
            );
            self.write(&Record::Isa { isa })?;
            self.written.isa = true;
        }

        if let (Some(iem), false) = (self.iem, self.written.iem) {
            ensure!(self.written.isa, "ISA record must come before IEM record");
            ensure!(
                !self.written.initial_pc && !self.written.trace_infos && !self.written.features,
                "IEM record must come before FORCE_PC, TRACE_INFO, or TRACE_INFO_FEATURE records"
            );
            self.write(&Record::InstIem { iem })?;
            self.written.iem = true;
        }

        if !self.trace_infos.is_empty() && !self.written.trace_infos {
            ensure!(
                self.written.isa && self.written.iem,
                "ISA and IEM records must come before TRACE_INFO records"
            );
            ensure!(
                !self.written.initial_pc && !self.written.features,
                "TRACE_INFO records must come before FORCE_PC and TRACE_INFO_FEATURE records"
            );
            for info in std::mem::take(&mut self.trace_infos) {
                self.write(&Record::TraceInfo(info))?;
            }
            self.written.trace_infos = true;
        }

        if let (Some(features), false) = (self.features, self.written.features) {
            ensure!(
                self.written.isa && self.written.iem && self.written.trace_infos,
                "ISA, IEM, and TRACE_INFO records must come before TRACE_INFO_FEATURE records"
            );
            ensure!(
                !self.written.initial_pc,
                "TRACE_INFO_FEATURE record must come before FORCE_PC record"
            );
            self.write(&Record::TraceInfoFeature { features })?;
            self.written.features = true;
        }

        if let (Some(id), false) = (self.process_id, self.written.process_id) {
            self.write(&Record::ProcessIdExt {
                hw_thread_id: id.hw_thread_id,
                pid: id.pid,
                tid: id.tid,
            })?;
            self.written.process_id = true;
        }

        if let (Some(addr), false) = (self.initial_pc, self.written.initial_pc) {
            ensure!(
                self.written.isa
                    && self.written.iem
                    && self.written.trace_infos
                    && self.written.features,
                "ISA, IEM, TRACE_INFO, and TRACE_INFO_FEATURE records must come before FORCE_PC record"
            );
            self.write(&Record::ForcePc { addr })?;
            self.written.initial_pc = true;
        }

        if let (Some(vlen), false) = (self.vlen, self.written.vlen) {
            self.write(&Record::VlenConfig { vlen })?;
            self.written.vlen = true;
        }

        if let (Some(isa), false) = (self.isa_extended.clone(), self.written.isa_extended) {
            self.write(&Record::IsaExtended { isa })?;
            self.written.isa_extended = true;
        }

        Ok(())
    }

    /// Writes the remaining header records followed by END_HEADER. Calling
    /// it on a finalized header does nothing.
    ///
    /// RISC-V RV64 traces announce 64-bit events unless
    /// [`StfWriter::force_32bit_events`] was called.
    pub fn finalize_header(&mut self) -> Result<(), Error> {
        if self.header_finalized {
            return Ok(());
        }
        ensure!(
            self.header_started,
            "Attempted to finalize the header before anything has been written to it"
        );

        if !self.force_32bit_events
            && self.isa == Some(Isa::Riscv)
            && self.iem == Some(InstIem::Rv64)
        {
            self.set_feature(TraceFeatures::EVENT64);
        }

        self.flush_header()?;
        self.write(&Record::EndHeader)?;
        self.header_finalized = true;

        debug!(
            "Finalized STF header after {} records",
            self.encoder.state().num_records()
        );

        Ok(())
    }

    /// Writes a single record.
    ///
    /// # Errors
    ///
    /// Fails if the record breaks the record ordering, is a header record
    /// outside of the header (or a body record inside it), or cannot be
    /// encoded.
    pub fn write(&mut self, record: &Record) -> Result<(), Error> {
        ensure!(!self.closed, "Attempted to write to a closed STF writer");

        let descriptor = record.descriptor();
        let last = self.last_descriptor;
        let last_was = |expected: Descriptor| last == Some(expected);

        ensure!(
            !last_was(Descriptor::InstMemAccess) || descriptor == Descriptor::InstMemContent,
            "INST_MEM_CONTENT must follow INST_MEM_ACCESS"
        );
        ensure!(
            !last_was(Descriptor::BusMasterAccess) || descriptor == Descriptor::BusMasterContent,
            "BUS_MASTER_CONTENT must follow BUS_MASTER_ACCESS"
        );

        let in_order = last.is_none_or(|last| descriptor.id() >= last.id())
            || last.is_some_and(|last| last.is_instruction_record())
            || (last_was(Descriptor::InstMemContent) && descriptor == Descriptor::InstMemAccess)
            || (last_was(Descriptor::BusMasterContent)
                && descriptor == Descriptor::BusMasterAccess)
            || (self.wrote_event_record_group && descriptor == Descriptor::Event)
            || ((self.wrote_page_table_walk || self.wrote_reg)
                && descriptor == Descriptor::InstPcTarget)
            || (self.wrote_page_table_walk && descriptor == Descriptor::InstReg)
            || ((last_was(Descriptor::InstMemContent) || last_was(Descriptor::BusMasterContent))
                && descriptor == Descriptor::InstReg)
            || matches!(
                descriptor,
                Descriptor::Comment | Descriptor::ProcessIdExt | Descriptor::ForcePc
            );
        if let (false, Some(last)) = (in_order, last) {
            bail!("Attempted out of order write. {descriptor} should come before {last}");
        }

        match descriptor {
            Descriptor::Identifier | Descriptor::Version => ensure!(
                !self.header_started,
                "Attempted to write more than one {descriptor} record!"
            ),
            Descriptor::Isa
            | Descriptor::TraceInfo
            | Descriptor::TraceInfoFeature
            | Descriptor::VlenConfig
            | Descriptor::IsaExtended
            | Descriptor::EndHeader => {
                ensure!(
                    !self.header_finalized,
                    "Attempted to write {descriptor} record outside of the header"
                );
                ensure!(
                    self.header_started,
                    "Attempted to write {descriptor} record before the header has started"
                );
            }
            Descriptor::Comment
            | Descriptor::ProcessIdExt
            | Descriptor::InstIem
            | Descriptor::ForcePc => ensure!(
                self.header_started,
                "Attempted to write {descriptor} record before the header has started"
            ),
            Descriptor::InstPcTarget
            | Descriptor::InstReg
            | Descriptor::InstReadyReg
            | Descriptor::PageTableWalk
            | Descriptor::InstMemAccess
            | Descriptor::InstMemContent
            | Descriptor::BusMasterAccess
            | Descriptor::BusMasterContent
            | Descriptor::Event
            | Descriptor::EventPcTarget
            | Descriptor::InstMicroop
            | Descriptor::InstOpcode32
            | Descriptor::InstOpcode16 => ensure!(
                self.header_finalized,
                "Attempted to write {descriptor} record before finalizing the header"
            ),
            Descriptor::ProtocolId
            | Descriptor::ClockId
            | Descriptor::Transaction
            | Descriptor::TransactionDependency => {
                bail!("Attempted to write transaction record {descriptor} to an instruction trace")
            }
        }

        self.encoder.encode(record)?;

        if descriptor.is_instruction_record() {
            let next_pc = self.encoder.state().next_pc();
            self.encoder.get_mut().marker_record(next_pc)?;
        }

        self.wrote_event_record_group =
            descriptor == Descriptor::EventPcTarget && last_was(Descriptor::Event);
        self.wrote_page_table_walk = descriptor == Descriptor::PageTableWalk;
        self.wrote_reg = descriptor == Descriptor::InstReg;
        self.last_descriptor = Some(descriptor);

        Ok(())
    }

    /// Flushes and finalizes the underlying stream. Closing twice does
    /// nothing.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.header_finalized {
            warn!("Closing an STF trace whose header was never finalized");
        }

        self.encoder.get_mut().close()
    }

    pub fn get_ref(&self) -> &W {
        self.encoder.get_ref()
    }
}

impl<W: TraceOutput> Drop for StfWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close STF trace: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use tempfile::tempdir;

    use super::StfWriter;
    use crate::{
        event::EventCode,
        features::TraceFeatures,
        isa::{InstIem, Isa, TraceGenerator},
        reader::{StfReader, tests::header_writer},
        records::{InstReg, MemAccess, MemAccessType, Record, TraceInfo},
        registers::{OperandType, Reg},
        stream::OutputOptions,
    };

    fn mem_access(access: MemAccessType) -> Record {
        Record::InstMemAccess(MemAccess::new(0x2000, 8, 0, access))
    }

    fn reg(num: u16) -> Record {
        Record::InstReg(InstReg::scalar(Reg::gpr(num), OperandType::Dest, 7))
    }

    #[test]
    fn write_header_in_order() -> Result<(), Error> {
        let mut writer = StfWriter::new(Vec::new())?;
        writer.set_initial_pc(0x400);
        writer.set_feature(TraceFeatures::RV64);
        writer.add_trace_info(TraceInfo::new(TraceGenerator::Qemu, 1, 0, 0, "first"));
        writer.add_trace_info(TraceInfo::new(TraceGenerator::Spike, 2, 0, 0, "second"));
        writer.set_iem(InstIem::Rv64);
        writer.set_isa(Isa::Riscv);
        writer.add_comment("comment");
        writer.set_process_id(1, 2, 3);
        writer.set_isa_extended("rv64gc");
        writer.finalize_header()?;
        writer.finalize_header()?;
        writer.close()?;

        let reader = StfReader::from_stream(writer.get_ref().as_slice())?;
        let header = reader.header();
        assert_eq!(header.comments(), ["comment"]);
        assert_eq!(header.trace_infos().len(), 2);
        assert_eq!(header.latest_trace_info().unwrap().comment, "second");
        assert_eq!(header.initial_pc(), 0x400);
        assert_eq!(header.initial_tid(), 3);
        assert_eq!(header.explicit_isa_extended(), Some("rv64gc"));
        assert_eq!(
            header.features(),
            TraceFeatures::RV64 | TraceFeatures::EVENT64
        );

        Ok(())
    }

    #[test]
    fn keep_32bit_events_when_forced() -> Result<(), Error> {
        let mut writer = StfWriter::new(Vec::new())?;
        writer.set_isa(Isa::Riscv);
        writer.set_iem(InstIem::Rv64);
        writer.set_initial_pc(0);
        writer.add_trace_info(TraceInfo::new(TraceGenerator::Qemu, 1, 0, 0, ""));
        writer.set_feature(TraceFeatures::RV64 | TraceFeatures::EVENT);
        writer.disable_feature(TraceFeatures::EVENT);
        writer.force_32bit_events();
        writer.finalize_header()?;
        writer.write(&Record::event(EventCode::USER_ECALL, vec![93]))?;
        writer.write(&Record::opcode32(0x73))?;
        writer.close()?;

        let mut reader = StfReader::from_stream(writer.get_ref().as_slice())?;
        assert_eq!(reader.header().features(), TraceFeatures::RV64);
        assert_eq!(
            reader.next().unwrap()?,
            Record::event(EventCode::USER_ECALL, vec![93])
        );

        Ok(())
    }

    #[test]
    fn fail_on_header_order_violations() -> Result<(), Error> {
        let mut writer = StfWriter::new(Vec::new())?;
        writer.set_isa(Isa::Riscv);
        writer.flush_header()?;
        writer.add_comment("too late");
        let err = writer.flush_header().unwrap_err();
        assert!(err.to_string().contains("comment block"));

        let mut writer = StfWriter::new(Vec::new())?;
        writer.set_iem(InstIem::Rv32);
        let err = writer.flush_header().unwrap_err();
        assert!(err.to_string().contains("must come before IEM"));

        let mut writer = StfWriter::new(Vec::new())?;
        writer.set_isa(Isa::Riscv);
        writer.set_iem(InstIem::Rv32);
        writer.set_initial_pc(0);
        writer.flush_header().unwrap_err();

        writer.set_vlen(0).unwrap_err();

        Ok(())
    }

    #[test]
    fn fail_on_misplaced_records() -> Result<(), Error> {
        let mut writer = StfWriter::new(Vec::new())?;
        writer.write(&Record::Identifier).unwrap_err();
        writer.write(&Record::opcode32(0x13)).unwrap_err();

        let mut writer = header_writer(None)?;
        writer.write(&Record::Isa { isa: Isa::Riscv }).unwrap_err();
        writer.write(&Record::EndHeader).unwrap_err();
        writer.flush_header().unwrap_err();

        // Comments may appear anywhere
        writer.write(&Record::comment("body comment"))?;
        writer.write(&Record::opcode32(0x13))?;

        Ok(())
    }

    #[test]
    fn check_record_order() -> Result<(), Error> {
        let mut writer = header_writer(None)?;

        // Repeated memory access groups
        writer.write(&mem_access(MemAccessType::Read))?;
        writer.write(&Record::InstMemContent { data: 1 })?;
        writer.write(&mem_access(MemAccessType::Write))?;
        writer.write(&Record::InstMemContent { data: 2 })?;
        // REG after a content record
        writer.write(&reg(5))?;
        // PC_TARGET after REG
        writer.write(&Record::InstPcTarget { addr: 0x2000 })?;
        writer.write(&Record::opcode32(0x6f))?;

        // Repeated event groups
        writer.write(&Record::event(EventCode::INT_MACHINE_TIMER, vec![]))?;
        writer.write(&Record::EventPcTarget { addr: 0x3000 })?;
        writer.write(&Record::event(EventCode::MODE_CHANGE, vec![1, 3]))?;
        writer.write(&Record::opcode32(0x13))?;

        // MEM_ACCESS must be followed by its content
        writer.write(&mem_access(MemAccessType::Read))?;
        let err = writer.write(&Record::opcode32(0x13)).unwrap_err();
        assert!(err.to_string().contains("INST_MEM_CONTENT must follow"));

        let mut writer = header_writer(None)?;
        writer.write(&Record::event(EventCode::USER_ECALL, vec![93]))?;
        let err = writer.write(&reg(10)).unwrap_err();
        assert!(err.to_string().contains("out of order"));

        let mut writer = header_writer(None)?;
        writer.write(&mem_access(MemAccessType::Read))?;
        writer.write(&Record::InstMemContent { data: 1 })?;
        writer
            .write(&Record::InstReadyReg { reg: 1 })
            .unwrap_err();

        Ok(())
    }

    #[test]
    fn write_zstf_file() -> Result<(), Error> {
        let dir = tempdir()?;
        let path = dir.path().join("trace.zstf");

        let mut writer = StfWriter::create_with(
            &path,
            OutputOptions {
                chunk_size: 2,
                ..OutputOptions::default()
            },
        )?;
        writer.set_isa(Isa::Riscv);
        writer.set_iem(InstIem::Rv32);
        writer.set_initial_pc(0x100);
        writer.add_trace_info(TraceInfo::new(TraceGenerator::Spike, 1, 0, 0, ""));
        writer.set_feature(TraceFeatures::empty());
        writer.finalize_header()?;
        for _ in 0..5 {
            writer.write(&Record::opcode32(0x13))?;
        }
        assert_eq!(writer.num_marker_records(), 5);
        writer.close()?;
        drop(writer);

        let reader = StfReader::open_with(&path, true)?;
        let pcs = reader
            .map(|record| match record? {
                Record::InstOpcode32 { pc, .. } => Ok(pc),
                other => anyhow::bail!("Unexpected record {}", other.descriptor()),
            })
            .collect::<Result<Vec<_>, Error>>()?;
        assert_eq!(pcs, [0x100, 0x104, 0x108, 0x10c, 0x110]);

        Ok(())
    }

    #[test]
    fn keep_trace_readable_after_rejected_write() -> Result<(), Error> {
        let mut writer = header_writer(None)?;
        let err = writer
            .write(&Record::InstReg(InstReg::new(
                Reg::vector(2),
                OperandType::Dest,
                vec![1, 2],
            )))
            .unwrap_err();
        assert!(err.to_string().contains("VLEN_CONFIG"));

        writer.write(&Record::opcode32(0x13))?;
        writer.close()?;

        let records = StfReader::from_stream(writer.get_ref().as_slice())?
            .collect::<Result<Vec<_>, Error>>()?;
        assert_eq!(
            records,
            [Record::InstOpcode32 {
                opcode: 0x13,
                pc: 0x1000
            }]
        );

        Ok(())
    }
}
