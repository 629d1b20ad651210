//! RISC-V branch decoding for 32-bit and compressed opcodes.

use serde::Serialize;

use crate::{isa::InstIem, registers::Reg};

const X0: Reg = Reg::gpr(0);
const X1: Reg = Reg::gpr(1);
const X5: Reg = Reg::gpr(5);

/// The condition evaluated by a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    LessThan,
}

/// What the opcode of a branch tells about it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodedBranch {
    /// Target computed from the opcode. Zero for indirect branches.
    pub target: u64,
    pub rs1: Option<Reg>,
    pub rs2: Option<Reg>,
    pub rd: Option<Reg>,
    pub compressed: bool,
    pub conditional: bool,
    pub call: bool,
    pub is_return: bool,
    pub millicall: bool,
    pub millireturn: bool,
    pub indirect: bool,
    pub comparison: Option<Comparison>,
    pub compare_unsigned: bool,
}

fn bits(value: u32, hi: u32, lo: u32) -> u32 {
    (value >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn bit(value: u32, index: u32) -> u32 {
    (value >> index) & 1
}

fn relative_target(pc: u64, offset: u32, width: u32) -> u64 {
    let shift = 64 - width;
    let offset = (i64::from(offset) << shift) >> shift;
    pc.wrapping_add_signed(offset)
}

fn gpr(num: u32) -> Option<Reg> {
    u16::try_from(num).ok().map(Reg::gpr)
}

fn cj_target(pc: u64, opcode: u32) -> u64 {
    let offset = bit(opcode, 12) << 11
        | bit(opcode, 8) << 10
        | bits(opcode, 10, 9) << 8
        | bit(opcode, 6) << 7
        | bit(opcode, 7) << 6
        | bit(opcode, 2) << 5
        | bit(opcode, 11) << 4
        | bits(opcode, 5, 3) << 1;
    relative_target(pc, offset, 12)
}

/// Decodes a 16-bit opcode. C.JAL only exists on RV32.
pub fn decode16(iem: InstIem, pc: u64, opcode: u16) -> Option<DecodedBranch> {
    let opcode = u32::from(opcode);
    let top = bits(opcode, 15, 13);
    let bottom = bits(opcode, 1, 0);

    let mut branch = DecodedBranch {
        compressed: true,
        ..DecodedBranch::default()
    };

    match (top, bottom) {
        // C.JAL
        (0b001, 0b01) if iem == InstIem::Rv32 => {
            branch.target = cj_target(pc, opcode);
            branch.rd = Some(X1);
            branch.call = true;
        }
        // C.BEQZ, C.BNEZ
        (0b110 | 0b111, 0b01) => {
            let offset = bit(opcode, 12) << 8
                | bits(opcode, 6, 5) << 6
                | bit(opcode, 2) << 5
                | bits(opcode, 11, 10) << 3
                | bits(opcode, 4, 3) << 1;
            branch.target = relative_target(pc, offset, 9);
            branch.rs1 = gpr(bits(opcode, 9, 7) + 8);
            branch.rs2 = Some(X0);
            branch.conditional = true;
            branch.comparison = Some(if top == 0b110 {
                Comparison::Equal
            } else {
                Comparison::NotEqual
            });
        }
        // C.JR, C.JALR
        (0b100, 0b10) => {
            let rs1 = bits(opcode, 11, 7);
            if rs1 == 0 || bits(opcode, 6, 2) != 0 {
                return None;
            }

            branch.call = bit(opcode, 12) == 1;
            if branch.call {
                branch.rd = Some(X1);
            } else {
                branch.millireturn = rs1 == 5;
                branch.is_return = branch.millireturn || rs1 == 1;
                if branch.is_return {
                    branch.rd = Some(X0);
                }
            }
            branch.indirect = true;
            branch.rs1 = gpr(rs1);
        }
        // CM.POPRET, CM.POPRETZ
        (0b101, 0b10) => {
            let funct = bits(opcode, 12, 8);
            if funct != 0b11100 && funct != 0b11110 {
                return None;
            }
            branch.indirect = true;
            branch.is_return = true;
            branch.rs1 = Some(X1);
            branch.rd = Some(X0);
        }
        // C.J
        (0b101, 0b01) => branch.target = cj_target(pc, opcode),
        _ => return None,
    }

    Some(branch)
}

/// Decodes a 32-bit opcode
pub fn decode32(pc: u64, opcode: u32) -> Option<DecodedBranch> {
    if bits(opcode, 6, 5) != 0b11 {
        return None;
    }

    let mut branch = DecodedBranch::default();
    let rd = gpr(bits(opcode, 11, 7));
    let rs1 = gpr(bits(opcode, 19, 15));

    match bits(opcode, 4, 2) {
        // BRANCH
        0b000 => {
            let offset = bit(opcode, 31) << 12
                | bit(opcode, 7) << 11
                | bits(opcode, 30, 25) << 5
                | bits(opcode, 11, 8) << 1;
            branch.target = relative_target(pc, offset, 13);

            let lt_ge = bit(opcode, 14) == 1;
            let negate = bit(opcode, 12) == 1;
            branch.comparison = Some(match (lt_ge, negate) {
                (false, false) => Comparison::Equal,
                (false, true) => Comparison::NotEqual,
                (true, true) => Comparison::GreaterThanOrEqual,
                (true, false) => Comparison::LessThan,
            });
            branch.compare_unsigned = bit(opcode, 13) == 1;
            branch.rs1 = rs1;
            branch.rs2 = gpr(bits(opcode, 24, 20));
            branch.conditional = true;
        }
        // JALR
        0b001 => {
            branch.rs1 = rs1;
            branch.rd = rd;

            branch.millicall = rd == Some(X5);
            branch.call = branch.millicall || rd == Some(X1);

            let possible_return = rs1 != rd;
            branch.millireturn = possible_return && rs1 == Some(X5);
            branch.is_return = branch.millireturn || (possible_return && rs1 == Some(X1));

            branch.indirect = true;
        }
        // JAL
        0b011 => {
            let offset = bit(opcode, 31) << 20
                | bits(opcode, 19, 12) << 12
                | bit(opcode, 20) << 11
                | bits(opcode, 30, 21) << 1;
            branch.target = relative_target(pc, offset, 21);
            branch.rd = rd;
            branch.millicall = rd == Some(X5);
            branch.call = branch.millicall || rd == Some(X1);
        }
        _ => return None,
    }

    Some(branch)
}

/// Decodes an opcode of `opcode_size` bytes
pub fn decode(iem: InstIem, pc: u64, opcode: u32, compressed: bool) -> Option<DecodedBranch> {
    if compressed {
        decode16(iem, pc, u16::try_from(opcode).ok()?)
    } else {
        decode32(pc, opcode)
    }
}

pub fn is_branch(iem: InstIem, opcode: u32, compressed: bool) -> bool {
    decode(iem, 0, opcode, compressed).is_some()
}
