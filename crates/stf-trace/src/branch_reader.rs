use std::{
    collections::VecDeque,
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Error, anyhow, ensure};

use crate::{
    branch::Branch,
    branch_decoder,
    isa::InstIem,
    reader::{Header, StfReader},
    records::Record,
    registers::{OperandType, Reg},
    stream::{InputStream, single_threaded_from_env},
};

/// Records of the instruction currently being read
#[derive(Debug, Default)]
struct PendingInst {
    taken_target: Option<u64>,
    not_a_branch: bool,
    sources: Vec<(Reg, u64)>,
    dests: Vec<(Reg, u64)>,
}

fn operand_value(operands: &[(Reg, u64)], reg: Option<Reg>) -> u64 {
    reg.and_then(|reg| operands.iter().find(|(r, _)| *r == reg))
        .map_or(0, |(_, value)| *value)
}

/// Reads only the branch instructions of an STF trace.
///
/// A taken branch is held back until the instruction at its target has been
/// read, so that its target opcode is known when it is returned.
pub struct BranchReader<R: Read = BufReader<InputStream>> {
    reader: StfReader<R>,
    iem: InstIem,
    inst: PendingInst,
    last_taken: Option<Branch>,
    ready: VecDeque<Branch>,
    num_branches_read: u64,
}

impl BranchReader {
    /// Opens the trace at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the trace cannot be opened or its header is invalid.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open_with(path, single_threaded_from_env()?)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, single_threaded: bool) -> Result<Self, Error> {
        Ok(Self::from_reader(StfReader::open_with(path, single_threaded)?))
    }
}

impl<R: Read> BranchReader<R> {
    pub fn from_reader(reader: StfReader<R>) -> Self {
        let iem = reader.header().initial_iem();
        Self {
            reader,
            iem,
            inst: PendingInst::default(),
            last_taken: None,
            ready: VecDeque::new(),
            num_branches_read: 0,
        }
    }

    pub fn header(&self) -> &Header {
        self.reader.header()
    }

    /// Number of branches decoded so far
    pub fn num_branches_read(&self) -> u64 {
        self.num_branches_read
    }

    /// Checks the PC of the instruction following the last taken branch and
    /// records its opcode
    fn complete_last_taken(&mut self, pc: u64, opcode: u32) -> Result<(), Error> {
        if let Some(mut branch) = self.last_taken.take() {
            ensure!(
                branch.target == pc,
                "Mismatch between current PC ({pc:#x}) and expected target PC ({:#x}) of last taken branch",
                branch.target
            );
            branch.target_opcode = Some(opcode);
            self.ready.push_back(branch);
        }
        Ok(())
    }

    fn finish_inst(&mut self, pc: u64, opcode: u32, compressed: bool) -> Result<(), Error> {
        self.complete_last_taken(pc, opcode)?;
        let inst = std::mem::take(&mut self.inst);

        if inst.not_a_branch {
            return Ok(());
        }

        let Some(decoded) = branch_decoder::decode(self.iem, pc, opcode, compressed) else {
            ensure!(
                inst.taken_target.is_none(),
                "Branch was marked taken but also didn't decode as a branch: pc = {pc:#x}"
            );
            return Ok(());
        };

        let target = if decoded.indirect {
            inst.taken_target
                .ok_or_else(|| anyhow!("Indirect branch with invalid target: pc = {pc:#x}"))?
        } else {
            if let Some(trace_target) = inst.taken_target {
                ensure!(
                    trace_target == decoded.target,
                    "Branch target mismatch: pc = {pc:#x} trace = {trace_target:#x} calculated = {:#x}",
                    decoded.target
                );
            }
            decoded.target
        };

        self.num_branches_read += 1;
        let branch = Branch {
            index: self.num_branches_read,
            pc,
            target,
            opcode,
            target_opcode: None,
            taken: inst.taken_target.is_some(),
            decoded,
            rs1_value: operand_value(&inst.sources, decoded.rs1),
            rs2_value: operand_value(&inst.sources, decoded.rs2),
            rd_value: operand_value(&inst.dests, decoded.rd),
        };

        if branch.taken {
            self.last_taken = Some(branch);
        } else {
            self.ready.push_back(branch);
        }

        Ok(())
    }

    fn inner_next(&mut self) -> Result<Option<Branch>, Error> {
        loop {
            if let Some(branch) = self.ready.pop_front() {
                return Ok(Some(branch));
            }

            let Some(record) = self.reader.next().transpose()? else {
                return Ok(self.last_taken.take());
            };

            match record {
                Record::InstOpcode16 { opcode, pc } => {
                    self.finish_inst(pc, u32::from(opcode), true)?
                }
                Record::InstOpcode32 { opcode, pc } => self.finish_inst(pc, opcode, false)?,
                _ if self.inst.not_a_branch => {}
                Record::InstReg(reg) => {
                    // State snapshots say nothing about the instruction
                    if reg.operand == OperandType::State {
                        continue;
                    }
                    if reg.reg.is_fpr() || reg.reg.is_vector() {
                        self.inst.not_a_branch = true;
                        continue;
                    }
                    let value = reg.scalar_value();
                    match reg.operand {
                        OperandType::Source => self.inst.sources.push((reg.reg, value)),
                        OperandType::Dest => self.inst.dests.push((reg.reg, value)),
                        OperandType::State | OperandType::Reserved => {}
                    }
                }
                Record::InstMemAccess(_) | Record::Event { .. } => self.inst.not_a_branch = true,
                Record::InstPcTarget { addr } => self.inst.taken_target = Some(addr),
                _ => {}
            }
        }
    }
}

impl<R: Read> Iterator for BranchReader<R> {
    type Item = Result<Branch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::BranchReader;
    use crate::{
        branch::Branch,
        codec::encoder::RecordEncoder,
        event::EventCode,
        reader::{StfReader, tests::header_writer},
        records::{InstReg, MemAccess, MemAccessType, Record},
        registers::{OperandType, Reg},
    };

    fn branches(records: &[Record]) -> Result<Vec<Branch>, Error> {
        let mut writer = header_writer(None)?;
        for record in records {
            writer.write(record)?;
        }
        writer.close()?;

        BranchReader::from_reader(StfReader::from_stream(writer.get_ref().as_slice())?).collect()
    }

    #[test]
    fn read_branches() -> Result<(), Error> {
        let branches = branches(&[
            Record::opcode32(0x13),
            // beq x10, x11, -8 (not taken)
            Record::InstReg(InstReg::scalar(Reg::gpr(10), OperandType::Source, 1)),
            Record::InstReg(InstReg::scalar(Reg::gpr(11), OperandType::Source, 2)),
            Record::opcode32(0xfeb50ce3),
            // jal x1, +2048
            Record::InstReg(InstReg::scalar(Reg::gpr(1), OperandType::Dest, 0x100c)),
            Record::InstPcTarget { addr: 0x1808 },
            Record::opcode32(0x001000ef),
            // c.jr x1 back to the caller
            Record::InstReg(InstReg::scalar(Reg::gpr(1), OperandType::Source, 0x100c)),
            Record::InstPcTarget { addr: 0x100c },
            Record::opcode16(0x8082),
            Record::opcode32(0x33),
        ])?;

        assert_eq!(branches.len(), 3);

        let beq = &branches[0];
        assert_eq!((beq.index(), beq.pc()), (1, 0x1004));
        assert!(beq.is_conditional() && !beq.is_taken());
        assert_eq!((beq.rs1_value(), beq.rs2_value()), (1, 2));
        assert_eq!(beq.target(), 0x0ffc);
        assert_eq!(beq.target_opcode(), None);

        let call = &branches[1];
        assert!(call.is_call() && call.is_taken());
        assert_eq!(call.target(), 0x1808);
        assert_eq!(call.rd_value(), 0x100c);
        assert_eq!(call.target_opcode(), Some(0x8082));

        let ret = &branches[2];
        assert!(ret.is_return() && ret.is_indirect() && ret.is_compressed());
        assert_eq!(ret.target(), 0x100c);
        assert_eq!(ret.rs1_value(), 0x100c);
        assert_eq!(ret.target_opcode(), Some(0x33));
        assert!(ret.is_backwards());

        Ok(())
    }

    #[test]
    fn ignore_instructions_that_cannot_be_branches() -> Result<(), Error> {
        let branches = branches(&[
            // jal x0 with a memory access is not treated as a branch
            Record::InstMemAccess(MemAccess::new(0x2000, 8, 0, MemAccessType::Read)),
            Record::InstMemContent { data: 0 },
            Record::opcode32(0x0000006f),
            Record::InstReg(InstReg::scalar(Reg::fpr(1), OperandType::Source, 0)),
            Record::opcode32(0x0000006f),
            Record::event(EventCode::ILLEGAL_INST, vec![]),
            Record::opcode32(0x0000006f),
        ])?;
        assert!(branches.is_empty());

        Ok(())
    }

    #[test]
    fn ignore_fp_state_registers() -> Result<(), Error> {
        let branches = branches(&[
            Record::InstReg(InstReg::scalar(Reg::fpr(3), OperandType::State, 0)),
            Record::InstPcTarget { addr: 0x1800 },
            // jal x1, +2048
            Record::opcode32(0x001000ef),
            Record::opcode32(0x13),
        ])?;
        assert_eq!(branches.len(), 1);
        assert!(branches[0].is_call() && branches[0].is_taken());
        assert_eq!(branches[0].target_opcode(), Some(0x13));

        Ok(())
    }

    #[test]
    fn keep_last_taken_branch_at_end_of_trace() -> Result<(), Error> {
        let branches = branches(&[
            Record::InstPcTarget { addr: 0x1000 },
            // jal x0, 0
            Record::opcode32(0x0000006f),
        ])?;
        assert_eq!(branches.len(), 1);
        assert!(branches[0].is_taken());
        assert_eq!(branches[0].target_opcode(), None);

        Ok(())
    }

    fn raw_branches(records: &[Record]) -> Result<Vec<Branch>, Error> {
        let mut writer = header_writer(None)?;
        writer.close()?;

        let mut encoder = RecordEncoder::new(writer.get_ref().clone());
        for record in records {
            encoder.encode(record)?;
        }
        let trace = encoder.into_inner();

        BranchReader::from_reader(StfReader::from_stream(trace.as_slice())?).collect()
    }

    #[test]
    fn fail_on_inconsistent_branches() -> Result<(), Error> {
        // taken, but not a branch
        raw_branches(&[Record::InstPcTarget { addr: 0x2000 }, Record::opcode32(0x13)])
            .unwrap_err();

        // decoded target differs from the trace
        raw_branches(&[Record::InstPcTarget { addr: 0x2000 }, Record::opcode32(0x001000ef)])
            .unwrap_err();

        // indirect branch without a target
        raw_branches(&[Record::opcode32(0x00008067)]).unwrap_err();

        // the instruction after a taken branch is not at its target
        let err = raw_branches(&[
            Record::InstPcTarget { addr: 0x1800 },
            Record::opcode32(0x001000ef),
            Record::ForcePc { addr: 0x4000 },
            Record::opcode32(0x13),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("expected target PC"));

        Ok(())
    }
}
