use std::fmt;

use serde::Serialize;

use crate::{
    branch_decoder::{Comparison, DecodedBranch},
    registers::Reg,
};

/// A branch instruction read from a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub(crate) index: u64,
    pub(crate) pc: u64,
    pub(crate) target: u64,
    pub(crate) opcode: u32,
    pub(crate) target_opcode: Option<u32>,
    pub(crate) taken: bool,
    pub(crate) decoded: DecodedBranch,
    pub(crate) rs1_value: u64,
    pub(crate) rs2_value: u64,
    pub(crate) rd_value: u64,
}

impl Branch {
    /// Position among the branches of the trace, starting at 1
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// The PC the branch jumps to when taken
    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Opcode of the instruction at the target of a taken branch. `None` if
    /// the trace ends right after the branch.
    pub fn target_opcode(&self) -> Option<u32> {
        self.target_opcode
    }

    pub fn is_taken(&self) -> bool {
        self.taken
    }

    pub fn is_compressed(&self) -> bool {
        self.decoded.compressed
    }

    pub fn is_conditional(&self) -> bool {
        self.decoded.conditional
    }

    pub fn is_call(&self) -> bool {
        self.decoded.call
    }

    pub fn is_return(&self) -> bool {
        self.decoded.is_return
    }

    pub fn is_millicall(&self) -> bool {
        self.decoded.millicall
    }

    pub fn is_millireturn(&self) -> bool {
        self.decoded.millireturn
    }

    pub fn is_indirect(&self) -> bool {
        self.decoded.indirect
    }

    pub fn is_backwards(&self) -> bool {
        self.target <= self.pc
    }

    pub fn comparison(&self) -> Option<Comparison> {
        self.decoded.comparison
    }

    pub fn is_compare_unsigned(&self) -> bool {
        self.decoded.compare_unsigned
    }

    pub fn rs1(&self) -> Option<Reg> {
        self.decoded.rs1
    }

    pub fn rs1_value(&self) -> u64 {
        self.rs1_value
    }

    pub fn rs2(&self) -> Option<Reg> {
        self.decoded.rs2
    }

    pub fn rs2_value(&self) -> u64 {
        self.rs2_value
    }

    pub fn rd(&self) -> Option<Reg> {
        self.decoded.rd
    }

    pub fn rd_value(&self) -> u64 {
        self.rd_value
    }

    fn kind(&self) -> &'static str {
        if self.is_call() {
            "CALL"
        } else if self.is_return() {
            "RETURN"
        } else if self.is_indirect() {
            "INDIRECT"
        } else if self.is_conditional() {
            "COND"
        } else {
            "JUMP"
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}    {:08x}", self.pc, self.opcode)?;
        if self.taken {
            write!(f, "{:>5}    {:016x}", 'T', self.target)?;
        } else {
            write!(f, "{:>5}    {:16}", 'N', "")?;
        }
        write!(f, "{:>12}", self.kind())
    }
}
