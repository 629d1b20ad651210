use std::{
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Error, anyhow, bail, ensure};
use log::debug;

use crate::{
    codec::{OPCODE16_SIZE, OPCODE32_SIZE},
    event::EventCode,
    inst::{Inst, InstEvent, InstFlags, MemoryAccess, MicroOp},
    isa::{ExecutionMode, InstIem, Isa},
    reader::{Header, StfReader},
    records::{MemAccessType, Record},
    stream::{InputStream, single_threaded_from_env},
};

/// Options of an [`InstReader`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InstReaderBuilder {
    only_user_mode: bool,
    filter_mode_change_events: bool,
    single_threaded: Option<bool>,
}

impl InstReaderBuilder {
    /// Skips every instruction executed outside of user mode. A user mode
    /// ECALL is kept as a nop.
    pub fn only_user_mode(mut self, only_user_mode: bool) -> Self {
        self.only_user_mode = only_user_mode;
        self
    }

    /// Drops all MODE_CHANGE events from the instructions
    pub fn filter_mode_change_events(mut self, filter: bool) -> Self {
        self.filter_mode_change_events = filter;
        self
    }

    /// Overrides `STF_SINGLE_THREADED`
    pub fn single_threaded(mut self, single_threaded: bool) -> Self {
        self.single_threaded = Some(single_threaded);
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<InstReader, Error> {
        let single_threaded = match self.single_threaded {
            Some(single_threaded) => single_threaded,
            None => single_threaded_from_env()?,
        };
        self.from_reader(StfReader::open_with(path, single_threaded)?)
    }

    pub fn from_reader<R: Read>(self, reader: StfReader<R>) -> Result<InstReader<R>, Error> {
        let header = reader.header();
        let last_iem = header.initial_iem();
        let iem_changes_allowed = header.isa() != Isa::Riscv;

        Ok(InstReader {
            reader,
            only_user_mode: self.only_user_mode,
            filter_mode_change_events: self.filter_mode_change_events,
            iem_changes_allowed,
            last_iem,
            first_inst: true,
            asid: 0,
            tid: 0,
            tgid: 0,
            skipping_enabled: false,
            disable_skipping_on_next_inst: false,
            num_insts_read: 0,
            num_skipped: 0,
        })
    }
}

/// Groups the records of an STF trace into [`Inst`]s
pub struct InstReader<R: Read = BufReader<InputStream>> {
    reader: StfReader<R>,
    only_user_mode: bool,
    filter_mode_change_events: bool,

    iem_changes_allowed: bool,
    last_iem: InstIem,
    first_inst: bool,
    asid: u32,
    tid: u32,
    tgid: u32,

    skipping_enabled: bool,
    disable_skipping_on_next_inst: bool,
    num_insts_read: u64,
    num_skipped: u64,
}

impl InstReader {
    /// Opens the trace at `path` with default options.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stf_trace::inst_reader::InstReader;
    ///
    /// let reader = InstReader::builder()
    ///     .only_user_mode(true)
    ///     .open("trace.zstf")
    ///     .unwrap();
    ///
    /// for inst in reader {
    ///     let inst = inst.unwrap();
    ///     println!("{:#x}", inst.pc());
    /// }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::builder().open(path)
    }

    pub fn builder() -> InstReaderBuilder {
        InstReaderBuilder::default()
    }
}

impl<R: Read> InstReader<R> {
    pub fn header(&self) -> &Header {
        self.reader.header()
    }

    /// Number of instructions read so far, skipped instructions included
    pub fn num_insts_read(&self) -> u64 {
        self.num_insts_read
    }

    /// Number of instructions dropped by user mode skipping
    pub fn num_skipped(&self) -> u64 {
        self.num_skipped
    }

    fn next_record(&mut self) -> Result<Option<Record>, Error> {
        self.reader.next().transpose()
    }

    /// Reads records up to and including the next opcode record. Returns
    /// `None` at the end of the trace, dropping records that are not
    /// followed by an opcode.
    fn read_inst(&mut self) -> Result<Option<Inst>, Error> {
        let mut inst = Inst::default();
        let mut iem_changed = self.first_inst;
        self.first_inst = false;

        let mut event_valid = false;
        let mut last_event_filtered = false;
        let mut pending_user_syscall = false;

        if self.disable_skipping_on_next_inst {
            self.skipping_enabled = false;
            self.disable_skipping_on_next_inst = false;
        }

        loop {
            let Some(record) = self.next_record()? else {
                return Ok(None);
            };

            let (opcode, pc, opcode_size) = match record {
                Record::InstReg(reg) => {
                    if reg.reg.is_fpr() {
                        inst.flags.insert(InstFlags::FP);
                    }
                    if reg.reg.is_vector() {
                        inst.flags.insert(InstFlags::VECTOR);
                    }
                    inst.push_operand(reg);
                    continue;
                }
                Record::InstOpcode16 { opcode, pc } => {
                    inst.flags.insert(InstFlags::OPCODE16);
                    (u32::from(opcode), pc, OPCODE16_SIZE)
                }
                Record::InstOpcode32 { opcode, pc } => (opcode, pc, OPCODE32_SIZE),
                Record::InstMemAccess(access) => {
                    let data = match self.next_record()? {
                        Some(Record::InstMemContent { data }) => data,
                        _ => bail!("Invalid trace: memory access must be followed by memory content"),
                    };
                    let access_with_data = MemoryAccess {
                        address: access.address,
                        size: access.size,
                        attr: access.attr,
                        data,
                    };

                    match access.access {
                        MemAccessType::Read => {
                            inst.flags.insert(InstFlags::LOAD);
                            inst.mem_reads.push(access_with_data);
                        }
                        MemAccessType::Write => {
                            inst.flags.insert(InstFlags::STORE);
                            inst.mem_writes.push(access_with_data);
                        }
                        MemAccessType::Invalid => {
                            bail!("Memory access at {:#x} has an invalid type", access.address)
                        }
                    }
                    continue;
                }
                Record::InstMemContent { .. } => {
                    bail!("Saw INST_MEM_CONTENT without accompanying INST_MEM_ACCESS")
                }
                Record::InstPcTarget { addr } => {
                    inst.flags.insert(InstFlags::TAKEN_BRANCH);
                    inst.branch_target = Some(addr);
                    continue;
                }
                Record::Event { event, content } => {
                    event_valid = true;
                    last_event_filtered = self.handle_event(
                        &mut inst,
                        event,
                        &content,
                        &mut pending_user_syscall,
                    )?;
                    if !last_event_filtered {
                        inst.events.push(InstEvent {
                            event,
                            content,
                            target: None,
                        });
                    }
                    continue;
                }
                Record::EventPcTarget { addr } => {
                    ensure!(
                        event_valid,
                        "Saw EVENT_PC_TARGET without accompanying EVENT"
                    );
                    if !last_event_filtered {
                        if let Some(event) = inst.events.last_mut() {
                            event.target = Some(addr);
                        }
                    }
                    event_valid = false;
                    continue;
                }
                Record::ForcePc { .. } => {
                    inst.flags.insert(InstFlags::COF);
                    continue;
                }
                Record::ProcessIdExt {
                    hw_thread_id,
                    pid,
                    tid,
                } => {
                    self.asid = hw_thread_id;
                    self.tgid = pid;
                    self.tid = tid;
                    continue;
                }
                Record::InstIem { iem } => {
                    iem_changed = self.last_iem != iem;
                    ensure!(
                        !iem_changed || self.iem_changes_allowed,
                        "IEM changed even though IEM changes are not allowed in ISA {}",
                        self.reader.header().isa()
                    );
                    self.last_iem = iem;
                    continue;
                }
                Record::Comment { data } => {
                    inst.comments.push(data);
                    continue;
                }
                Record::InstMicroop { size, microop } => {
                    inst.microops.push(MicroOp { size, microop });
                    continue;
                }
                Record::InstReadyReg { reg } => {
                    inst.ready_regs.push(reg);
                    continue;
                }
                Record::PageTableWalk(walk) => {
                    inst.page_table_walks.push(walk);
                    continue;
                }
                _ => continue,
            };

            inst.opcode = opcode;
            inst.pc = pc;
            inst.opcode_size = opcode_size;
            inst.iem = Some(self.last_iem);
            inst.iem_changed = iem_changed;

            inst.skipped = self.skipping_enabled && !pending_user_syscall;
            self.num_insts_read += 1;
            if inst.skipped {
                self.num_skipped += 1;
            }
            if pending_user_syscall {
                inst.set_nop();
            }

            inst.index = self.num_insts_read - self.num_skipped;
            inst.asid = self.asid;
            inst.tid = self.tid;
            inst.tgid = self.tgid;

            return Ok(Some(inst));
        }
    }

    /// Updates the instruction flags and the skipping state for an event.
    /// Returns whether the event is filtered out.
    fn handle_event(
        &mut self,
        inst: &mut Inst,
        event: EventCode,
        content: &[u64],
        pending_user_syscall: &mut bool,
    ) -> Result<bool, Error> {
        if event.is_syscall() {
            inst.flags.insert(InstFlags::SYSCALL);
            if self.only_user_mode && event == EventCode::USER_ECALL {
                *pending_user_syscall = true;
            }
            return Ok(false);
        }

        if !event.is_mode_change() {
            return Ok(false);
        }

        let mode = content
            .first()
            .ok_or_else(|| anyhow!("MODE_CHANGE event without a target mode"))?;
        let change_to_user = ExecutionMode::try_from_id(*mode)? == ExecutionMode::User;
        inst.flags.insert(if change_to_user {
            InstFlags::CHANGE_TO_USER
        } else {
            InstFlags::CHANGE_FROM_USER
        });

        if self.only_user_mode {
            if change_to_user {
                self.disable_skipping_on_next_inst = true;
            } else {
                self.skipping_enabled = true;
            }
        }

        Ok(self.only_user_mode || self.filter_mode_change_events)
    }

    fn inner_next(&mut self) -> Result<Option<Inst>, Error> {
        loop {
            match self.read_inst()? {
                Some(inst) if inst.skipped => continue,
                Some(inst) => return Ok(Some(inst)),
                None => {
                    debug!(
                        "Read {} instructions, skipped {}",
                        self.num_insts_read, self.num_skipped
                    );
                    return Ok(None);
                }
            }
        }
    }
}

impl<R: Read> Iterator for InstReader<R> {
    type Item = Result<Inst, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::InstReader;
    use crate::{
        codec::encoder::RecordEncoder,
        event::EventCode,
        inst::NOP_OPCODE,
        isa::InstIem,
        reader::{StfReader, tests::header_writer},
        records::{InstReg, MemAccess, MemAccessType, Record},
        registers::{OperandType, Reg},
        writer::StfWriter,
    };

    fn body(writer: &mut StfWriter<Vec<u8>>, records: &[Record]) -> Result<Vec<u8>, Error> {
        for record in records {
            writer.write(record)?;
        }
        writer.close()?;
        Ok(writer.get_ref().clone())
    }

    fn mode_change(mode: u64) -> Record {
        Record::event(EventCode::MODE_CHANGE, vec![mode])
    }

    #[test]
    fn group_records_into_instructions() -> Result<(), Error> {
        let mut writer = header_writer(None)?;
        let trace = body(
            &mut writer,
            &[
                Record::InstReg(InstReg::scalar(Reg::gpr(1), OperandType::Source, 5)),
                Record::InstReg(InstReg::scalar(Reg::fpr(2), OperandType::Dest, 6)),
                Record::InstMemAccess(MemAccess::new(0x2000, 8, 0, MemAccessType::Read)),
                Record::InstMemContent { data: 0x42 },
                Record::opcode32(0x0000_b107),
                Record::InstPcTarget { addr: 0x3000 },
                Record::InstMemAccess(MemAccess::new(0x2008, 4, 0, MemAccessType::Write)),
                Record::InstMemContent { data: 0x43 },
                Record::opcode16(0xa001),
                Record::ProcessIdExt {
                    hw_thread_id: 1,
                    pid: 2,
                    tid: 3,
                },
                Record::ForcePc { addr: 0x4000 },
                Record::opcode32(0x13),
            ],
        )?;

        let mut reader = InstReader::builder().from_reader(StfReader::from_stream(trace.as_slice())?)?;

        let first = reader.next().unwrap()?;
        assert_eq!(first.index(), 1);
        assert_eq!(first.pc(), 0x1000);
        assert!(first.is_load() && first.is_fp() && !first.is_store());
        assert_eq!(first.mem_reads()[0].data, 0x42);
        assert_eq!(first.source_operands()[0].scalar_value(), 5);
        assert_eq!(first.dest_operands()[0].reg, Reg::fpr(2));
        assert_eq!(first.iem(), Some(InstIem::Rv64));
        assert!(first.iem_changed());

        let second = reader.next().unwrap()?;
        assert!(second.is_store() && second.is_taken_branch() && second.is_opcode16());
        assert_eq!(second.branch_target(), Some(0x3000));
        assert_eq!(second.pc(), 0x1004);
        assert_eq!(second.opcode_size(), 2);
        assert!(!second.iem_changed());

        let third = reader.next().unwrap()?;
        assert!(third.is_cof());
        assert_eq!(third.pc(), 0x4000);
        assert_eq!((third.asid(), third.tgid(), third.tid()), (1, 2, 3));
        assert_eq!(third.index(), 3);

        assert!(reader.next().is_none());
        assert_eq!(reader.num_insts_read(), 3);

        Ok(())
    }

    #[test]
    fn attach_event_targets() -> Result<(), Error> {
        let mut writer = header_writer(None)?;
        let trace = body(
            &mut writer,
            &[
                Record::event(EventCode::USER_ECALL, vec![93]),
                Record::EventPcTarget { addr: 0x8000 },
                Record::opcode32(0x73),
            ],
        )?;

        let mut reader = InstReader::builder().from_reader(StfReader::from_stream(trace.as_slice())?)?;
        let inst = reader.next().unwrap()?;
        assert!(inst.is_syscall());
        assert_eq!(inst.events().len(), 1);
        assert_eq!(inst.events()[0].target, Some(0x8000));

        Ok(())
    }

    #[test]
    fn skip_non_user_mode_instructions() -> Result<(), Error> {
        let mut writer = header_writer(None)?;
        let trace = body(
            &mut writer,
            &[
                // user ECALL that traps into the kernel
                Record::event(EventCode::USER_ECALL, vec![93]),
                Record::opcode32(0x73),
                mode_change(1),
                Record::opcode32(0x13),
                Record::opcode32(0x13),
                mode_change(0),
                Record::opcode32(0x10200073),
                Record::opcode32(0x33),
            ],
        )?;

        let mut reader = InstReader::builder()
            .only_user_mode(true)
            .from_reader(StfReader::from_stream(trace.as_slice())?)?;
        let insts = reader.by_ref().collect::<Result<Vec<_>, Error>>()?;

        let opcodes = insts.iter().map(|inst| inst.opcode()).collect::<Vec<_>>();
        assert_eq!(opcodes, [NOP_OPCODE, 0x33]);
        assert_eq!(
            insts.iter().map(|inst| inst.index()).collect::<Vec<_>>(),
            [1, 2]
        );
        assert!(insts.iter().all(|inst| inst.events().is_empty()));
        assert_eq!(reader.num_insts_read(), 5);
        assert_eq!(reader.num_skipped(), 3);

        Ok(())
    }

    #[test]
    fn filter_mode_change_events() -> Result<(), Error> {
        let records = [mode_change(3), Record::opcode32(0x13)];

        let mut writer = header_writer(None)?;
        let trace = body(&mut writer, &records)?;
        let inst = InstReader::builder()
            .from_reader(StfReader::from_stream(trace.as_slice())?)?
            .next()
            .unwrap()?;
        assert!(inst.is_change_from_user_mode());
        assert_eq!(inst.events().len(), 1);

        let inst = InstReader::builder()
            .filter_mode_change_events(true)
            .from_reader(StfReader::from_stream(trace.as_slice())?)?
            .next()
            .unwrap()?;
        assert!(inst.is_change_from_user_mode());
        assert!(inst.events().is_empty());

        Ok(())
    }

    /// A finalized header followed by records that bypass the writer checks
    fn raw_body(records: &[Record]) -> Result<Vec<u8>, Error> {
        let mut writer = header_writer(None)?;
        writer.close()?;

        let mut encoder = RecordEncoder::new(writer.get_ref().clone());
        for record in records {
            encoder.encode(record)?;
        }
        Ok(encoder.into_inner())
    }

    #[test]
    fn fail_on_malformed_instructions() -> Result<(), Error> {
        let malformed = [
            vec![
                Record::InstMemAccess(MemAccess::new(0x2000, 8, 0, MemAccessType::Read)),
                Record::opcode32(0x13),
            ],
            vec![Record::InstMemContent { data: 0 }, Record::opcode32(0x13)],
            vec![Record::EventPcTarget { addr: 0 }, Record::opcode32(0x13)],
            vec![Record::InstIem { iem: InstIem::Rv32 }, Record::opcode32(0x13)],
        ];

        for records in malformed {
            let trace = raw_body(&records)?;
            InstReader::builder()
                .from_reader(StfReader::from_stream(trace.as_slice())?)?
                .next()
                .unwrap()
                .unwrap_err();
        }

        let trace = raw_body(&[Record::InstIem { iem: InstIem::Rv32 }, Record::opcode32(0x13)])?;
        let err = InstReader::builder()
            .from_reader(StfReader::from_stream(trace.as_slice())?)?
            .next()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("IEM changed"));

        Ok(())
    }
}
