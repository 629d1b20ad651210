use std::fmt;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

/// Integer register number used for the program counter
pub const PC_REG_NUM: u16 = 0x20;

const CSR_NAMES: [(u16, &str); 44] = [
    (0x000, "ustatus"),
    (0x001, "fflags"),
    (0x002, "frm"),
    (0x003, "fcsr"),
    (0x008, "vstart"),
    (0x009, "vxsat"),
    (0x00a, "vxrm"),
    (0x00f, "vcsr"),
    (0x100, "sstatus"),
    (0x104, "sie"),
    (0x105, "stvec"),
    (0x106, "scounteren"),
    (0x140, "sscratch"),
    (0x141, "sepc"),
    (0x142, "scause"),
    (0x143, "stval"),
    (0x144, "sip"),
    (0x180, "satp"),
    (0x300, "mstatus"),
    (0x301, "misa"),
    (0x302, "medeleg"),
    (0x303, "mideleg"),
    (0x304, "mie"),
    (0x305, "mtvec"),
    (0x306, "mcounteren"),
    (0x340, "mscratch"),
    (0x341, "mepc"),
    (0x342, "mcause"),
    (0x343, "mtval"),
    (0x344, "mip"),
    (0x600, "hstatus"),
    (0x602, "hedeleg"),
    (0x603, "hideleg"),
    (0x680, "hgatp"),
    (0xc00, "cycle"),
    (0xc01, "time"),
    (0xc02, "instret"),
    (0xc20, "vl"),
    (0xc21, "vtype"),
    (0xc22, "vlenb"),
    (0xf11, "mvendorid"),
    (0xf12, "marchid"),
    (0xf13, "mimpid"),
    (0xf14, "mhartid"),
];

/// The register file a register belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegType {
    Reserved,
    Integer,
    FloatingPoint,
    Vector,
    Csr,
}

impl RegType {
    pub fn id(&self) -> u8 {
        match self {
            RegType::Reserved => 0,
            RegType::Integer => 1,
            RegType::FloatingPoint => 2,
            RegType::Vector => 3,
            RegType::Csr => 4,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(RegType::Reserved),
            1 => Ok(RegType::Integer),
            2 => Ok(RegType::FloatingPoint),
            3 => Ok(RegType::Vector),
            4 => Ok(RegType::Csr),
            _ => Err(anyhow!("Invalid register type: {id}")),
        }
    }
}

/// How an instruction uses a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    Reserved,
    State,
    Source,
    Dest,
}

impl OperandType {
    pub fn id(&self) -> u8 {
        match self {
            OperandType::Reserved => 0,
            OperandType::State => 1,
            OperandType::Source => 2,
            OperandType::Dest => 3,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(OperandType::Reserved),
            1 => Ok(OperandType::State),
            2 => Ok(OperandType::Source),
            3 => Ok(OperandType::Dest),
            _ => Err(anyhow!("Invalid operand type: {id}")),
        }
    }
}

impl fmt::Display for OperandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperandType::Reserved => "RESERVED",
            OperandType::State => "STATE",
            OperandType::Source => "SOURCE",
            OperandType::Dest => "DEST",
        })
    }
}

/// A register, identified by its number inside its register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reg {
    num: u16,
    reg_type: RegType,
}

impl Reg {
    pub const fn new(num: u16, reg_type: RegType) -> Self {
        Self { num, reg_type }
    }

    pub const fn gpr(num: u16) -> Self {
        Self::new(num, RegType::Integer)
    }

    pub const fn fpr(num: u16) -> Self {
        Self::new(num, RegType::FloatingPoint)
    }

    pub const fn vector(num: u16) -> Self {
        Self::new(num, RegType::Vector)
    }

    pub const fn csr(num: u16) -> Self {
        Self::new(num, RegType::Csr)
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn reg_type(&self) -> RegType {
        self.reg_type
    }

    pub fn is_gpr(&self) -> bool {
        self.reg_type == RegType::Integer
    }

    pub fn is_fpr(&self) -> bool {
        self.reg_type == RegType::FloatingPoint
    }

    pub fn is_vector(&self) -> bool {
        self.reg_type == RegType::Vector
    }

    pub fn is_csr(&self) -> bool {
        self.reg_type == RegType::Csr
    }

    /// Combines register number and type into a single packed value
    pub fn packed(&self) -> u32 {
        u32::from(self.num) | (u32::from(self.reg_type.id()) << 16)
    }

    /// Packs the operand and register type into an INST_REG metadata byte
    pub fn metadata(&self, operand: OperandType) -> u8 {
        (operand.id() << 4) | (self.reg_type.id() & 0xF)
    }

    /// Splits an INST_REG metadata byte into register and operand type
    pub fn split_metadata(metadata: u8) -> Result<(RegType, OperandType), Error> {
        Ok((
            RegType::try_from_id(metadata & 0xF)?,
            OperandType::try_from_id(metadata >> 4)?,
        ))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reg_type {
            RegType::Integer if self.num == PC_REG_NUM => write!(f, "pc"),
            RegType::Integer => write!(f, "x{}", self.num),
            RegType::FloatingPoint => write!(f, "f{}", self.num),
            RegType::Vector => write!(f, "v{}", self.num),
            RegType::Csr => match CSR_NAMES.iter().find(|(num, _)| *num == self.num) {
                Some((_, name)) => f.write_str(name),
                None => write!(f, "csr_{:#x}", self.num),
            },
            RegType::Reserved => write!(f, "reserved_{}", self.num),
        }
    }
}

/// Number of 64-bit words a vector register occupies for the given vlen
pub fn vector_words(vlen: u32) -> usize {
    (vlen as usize).div_ceil(64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_register_metadata() -> Result<(), Error> {
        let reg = Reg::fpr(3);
        let metadata = reg.metadata(OperandType::Dest);
        assert_eq!(metadata, 0x32);
        assert_eq!(
            Reg::split_metadata(metadata)?,
            (RegType::FloatingPoint, OperandType::Dest)
        );
        assert_eq!(reg.packed(), 0x2_0003);

        Reg::split_metadata(0x45).unwrap_err();
        Reg::split_metadata(0x07).unwrap_err();

        Ok(())
    }

    #[test]
    fn format_register_names() {
        assert_eq!(Reg::gpr(5).to_string(), "x5");
        assert_eq!(Reg::gpr(PC_REG_NUM).to_string(), "pc");
        assert_eq!(Reg::fpr(31).to_string(), "f31");
        assert_eq!(Reg::vector(8).to_string(), "v8");
        assert_eq!(Reg::csr(0x342).to_string(), "mcause");
        assert_eq!(Reg::csr(0x7c0).to_string(), "csr_0x7c0");
    }

    #[test]
    fn vector_word_count() {
        assert_eq!(vector_words(64), 1);
        assert_eq!(vector_words(128), 2);
        assert_eq!(vector_words(256), 4);
        assert_eq!(vector_words(65), 2);
    }
}
