use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use crate::{
    event::EventCode,
    isa::InstIem,
    records::{InstReg, PageTableWalk},
    registers::{OperandType, Reg},
};

/// Opcode of the RISC-V `addi x0, x0, 0` instruction
pub const NOP_OPCODE: u32 = 0x0000_0013;

bitflags! {
    /// Properties of an instruction derived from its records
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct InstFlags: u32 {
        const TAKEN_BRANCH = 1 << 1;
        const OPCODE16 = 1 << 2;
        /// The instruction was preceded by a FORCE_PC record
        const COF = 1 << 3;
        const LOAD = 1 << 5;
        const STORE = 1 << 6;
        const SYSCALL = 1 << 7;
        const FP = 1 << 8;
        const CHANGE_TO_USER = 1 << 9;
        const CHANGE_FROM_USER = 1 << 10;
        const VECTOR = 1 << 12;
    }
}

/// A memory access together with the data that was transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryAccess {
    pub address: u64,
    pub size: u16,
    pub attr: u16,
    pub data: u64,
}

/// An event raised by an instruction and the PC it redirected to, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstEvent {
    pub event: EventCode,
    pub content: Vec<u64>,
    pub target: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MicroOp {
    pub size: u8,
    pub microop: u32,
}

/// An instruction and every record that belongs to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inst {
    pub(crate) index: u64,
    pub(crate) pc: u64,
    pub(crate) opcode: u32,
    pub(crate) opcode_size: u64,
    pub(crate) branch_target: Option<u64>,
    pub(crate) flags: InstFlags,

    pub(crate) source_operands: Vec<InstReg>,
    pub(crate) dest_operands: Vec<InstReg>,
    pub(crate) state_operands: Vec<InstReg>,
    pub(crate) mem_reads: Vec<MemoryAccess>,
    pub(crate) mem_writes: Vec<MemoryAccess>,
    pub(crate) events: Vec<InstEvent>,
    pub(crate) microops: Vec<MicroOp>,
    pub(crate) ready_regs: Vec<u16>,
    pub(crate) page_table_walks: Vec<PageTableWalk>,
    pub(crate) comments: Vec<String>,

    pub(crate) asid: u32,
    pub(crate) tid: u32,
    pub(crate) tgid: u32,
    pub(crate) iem: Option<InstIem>,
    pub(crate) iem_changed: bool,

    #[serde(skip)]
    pub(crate) skipped: bool,
}

impl Inst {
    /// Position of the instruction in the trace, starting at 1. Skipped
    /// instructions are not counted.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Size of the opcode in bytes
    pub fn opcode_size(&self) -> u64 {
        self.opcode_size
    }

    /// Target of a taken branch
    pub fn branch_target(&self) -> Option<u64> {
        self.branch_target
    }

    pub fn flags(&self) -> InstFlags {
        self.flags
    }

    pub fn is_taken_branch(&self) -> bool {
        self.flags.contains(InstFlags::TAKEN_BRANCH)
    }

    pub fn is_opcode16(&self) -> bool {
        self.flags.contains(InstFlags::OPCODE16)
    }

    pub fn is_cof(&self) -> bool {
        self.flags.contains(InstFlags::COF)
    }

    pub fn is_load(&self) -> bool {
        self.flags.contains(InstFlags::LOAD)
    }

    pub fn is_store(&self) -> bool {
        self.flags.contains(InstFlags::STORE)
    }

    pub fn is_syscall(&self) -> bool {
        self.flags.contains(InstFlags::SYSCALL)
    }

    pub fn is_fp(&self) -> bool {
        self.flags.contains(InstFlags::FP)
    }

    pub fn is_vector(&self) -> bool {
        self.flags.contains(InstFlags::VECTOR)
    }

    pub fn is_change_to_user_mode(&self) -> bool {
        self.flags.contains(InstFlags::CHANGE_TO_USER)
    }

    pub fn is_change_from_user_mode(&self) -> bool {
        self.flags.contains(InstFlags::CHANGE_FROM_USER)
    }

    pub fn source_operands(&self) -> &[InstReg] {
        &self.source_operands
    }

    pub fn dest_operands(&self) -> &[InstReg] {
        &self.dest_operands
    }

    /// Register state records attached to the instruction
    pub fn state_operands(&self) -> &[InstReg] {
        &self.state_operands
    }

    pub fn mem_reads(&self) -> &[MemoryAccess] {
        &self.mem_reads
    }

    pub fn mem_writes(&self) -> &[MemoryAccess] {
        &self.mem_writes
    }

    pub fn events(&self) -> &[InstEvent] {
        &self.events
    }

    pub fn microops(&self) -> &[MicroOp] {
        &self.microops
    }

    pub fn ready_regs(&self) -> &[u16] {
        &self.ready_regs
    }

    pub fn page_table_walks(&self) -> &[PageTableWalk] {
        &self.page_table_walks
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn tgid(&self) -> u32 {
        self.tgid
    }

    /// The instruction encoding mode in effect for this instruction
    pub fn iem(&self) -> Option<InstIem> {
        self.iem
    }

    /// Whether the IEM differs from the previous instruction. The first
    /// instruction of a trace always reports a change.
    pub fn iem_changed(&self) -> bool {
        self.iem_changed
    }

    pub(crate) fn push_operand(&mut self, reg: InstReg) {
        match reg.operand {
            OperandType::Source => self.source_operands.push(reg),
            OperandType::Dest => self.dest_operands.push(reg),
            OperandType::State | OperandType::Reserved => self.state_operands.push(reg),
        }
    }

    /// Replaces the instruction with a nop reading x0. Register state and
    /// memory accesses are kept.
    pub(crate) fn set_nop(&mut self) {
        self.opcode = NOP_OPCODE;
        self.events.clear();
        self.source_operands.clear();
        self.dest_operands.clear();
        self.source_operands
            .push(InstReg::scalar(Reg::gpr(0), OperandType::Source, 0));
        self.flags = InstFlags::empty();
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>10} {:016x} ", self.index, self.pc)?;
        if self.is_opcode16() {
            write!(f, "    {:04x}", self.opcode)?;
        } else {
            write!(f, "{:08x}", self.opcode)?;
        }
        if let Some(target) = self.branch_target {
            write!(f, " -> {target:016x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Inst, InstFlags, NOP_OPCODE};
    use crate::{
        event::EventCode,
        inst::InstEvent,
        records::InstReg,
        registers::{OperandType, Reg},
    };

    #[test]
    fn turn_ecall_into_nop() {
        let mut inst = Inst {
            opcode: 0x73,
            flags: InstFlags::SYSCALL,
            ..Inst::default()
        };
        inst.push_operand(InstReg::scalar(Reg::gpr(17), OperandType::Source, 93));
        inst.push_operand(InstReg::scalar(Reg::gpr(10), OperandType::Dest, 0));
        inst.push_operand(InstReg::scalar(Reg::csr(0x300), OperandType::State, 8));
        inst.events.push(InstEvent {
            event: EventCode::USER_ECALL,
            content: vec![],
            target: Some(0x8000_0000),
        });

        inst.set_nop();

        assert_eq!(inst.opcode(), NOP_OPCODE);
        assert!(!inst.is_syscall());
        assert!(inst.events().is_empty());
        assert!(inst.dest_operands().is_empty());
        assert_eq!(inst.source_operands().len(), 1);
        assert_eq!(inst.source_operands()[0].reg, Reg::gpr(0));
        assert_eq!(inst.state_operands().len(), 1);
    }

    #[test]
    fn format_instructions() {
        let inst = Inst {
            index: 3,
            pc: 0x1000,
            opcode: 0x4501,
            flags: InstFlags::OPCODE16 | InstFlags::TAKEN_BRANCH,
            branch_target: Some(0x2000),
            ..Inst::default()
        };

        assert_eq!(
            inst.to_string(),
            "         3 0000000000001000     4501 -> 0000000000002000"
        );
    }
}
