use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::Descriptor,
    event::EventCode,
    features::TraceFeatures,
    isa::{InstIem, Isa, TraceGenerator},
    registers::{OperandType, Reg},
};

/// Direction of a memory or bus access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemAccessType {
    Invalid,
    Read,
    Write,
}

impl MemAccessType {
    pub fn id(&self) -> u8 {
        match self {
            MemAccessType::Invalid => 0,
            MemAccessType::Read => 1,
            MemAccessType::Write => 2,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(MemAccessType::Invalid),
            1 => Ok(MemAccessType::Read),
            2 => Ok(MemAccessType::Write),
            _ => Err(anyhow!("Invalid memory access type: {id}")),
        }
    }
}

/// The kind of agent that issued a bus master access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusMasterType {
    Invalid,
    Core,
    Gpu,
    Dma,
    Pcie,
    Srio,
    Icn,
}

impl BusMasterType {
    pub fn id(&self) -> u8 {
        match self {
            BusMasterType::Invalid => 0,
            BusMasterType::Core => 1,
            BusMasterType::Gpu => 2,
            BusMasterType::Dma => 3,
            BusMasterType::Pcie => 4,
            BusMasterType::Srio => 5,
            BusMasterType::Icn => 6,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(BusMasterType::Invalid),
            1 => Ok(BusMasterType::Core),
            2 => Ok(BusMasterType::Gpu),
            3 => Ok(BusMasterType::Dma),
            4 => Ok(BusMasterType::Pcie),
            5 => Ok(BusMasterType::Srio),
            6 => Ok(BusMasterType::Icn),
            _ => Err(anyhow!("Invalid bus master type: {id}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub generator: TraceGenerator,
    pub major: u8,
    pub minor: u8,
    pub minor_minor: u8,
    pub comment: String,
}

impl TraceInfo {
    pub fn new(
        generator: TraceGenerator,
        major: u8,
        minor: u8,
        minor_minor: u8,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            major,
            minor,
            minor_minor,
            comment: comment.into(),
        }
    }

    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.minor_minor)
    }
}

/// A register operand and its value.
///
/// Scalar registers hold exactly one word, vector registers hold as many
/// 64-bit words as the configured vlen requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstReg {
    pub reg: Reg,
    pub operand: OperandType,
    pub data: Vec<u64>,
}

impl InstReg {
    pub fn new(reg: Reg, operand: OperandType, data: Vec<u64>) -> Self {
        Self { reg, operand, data }
    }

    pub fn scalar(reg: Reg, operand: OperandType, value: u64) -> Self {
        Self::new(reg, operand, vec![value])
    }

    /// First data word, which is the full value of a scalar register
    pub fn scalar_value(&self) -> u64 {
        self.data.first().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTableEntry {
    pub pa: u64,
    pub pte: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTableWalk {
    pub va: u64,
    pub index: u64,
    pub page_size: u32,
    pub entries: Vec<PageTableEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccess {
    pub address: u64,
    pub size: u16,
    pub attr: u16,
    pub access: MemAccessType,
}

impl MemAccess {
    pub fn new(address: u64, size: u16, attr: u16, access: MemAccessType) -> Self {
        Self {
            address,
            size,
            attr,
            access,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMasterAccess {
    pub address: u64,
    pub size: u16,
    pub src_type: BusMasterType,
    pub src_idx: u8,
    pub attr: u32,
    pub access: MemAccessType,
}

/// A single record of an instruction trace.
///
/// Opcode records carry the PC of their instruction. The PC is derived from
/// the surrounding FORCE_PC and PC target records while decoding and is not
/// part of the on-disk encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Record {
    Identifier,
    Version { major: u32, minor: u32 },
    Comment { data: String },
    Isa { isa: Isa },
    InstIem { iem: InstIem },
    TraceInfo(TraceInfo),
    TraceInfoFeature { features: TraceFeatures },
    ProcessIdExt { hw_thread_id: u32, pid: u32, tid: u32 },
    ForcePc { addr: u64 },
    VlenConfig { vlen: u32 },
    IsaExtended { isa: String },
    EndHeader,
    InstPcTarget { addr: u64 },
    InstReg(InstReg),
    InstReadyReg { reg: u16 },
    PageTableWalk(PageTableWalk),
    InstMemAccess(MemAccess),
    InstMemContent { data: u64 },
    BusMasterAccess(BusMasterAccess),
    BusMasterContent { data: u64 },
    Event { event: EventCode, content: Vec<u64> },
    EventPcTarget { addr: u64 },
    InstMicroop { size: u8, microop: u32 },
    InstOpcode32 { opcode: u32, pc: u64 },
    InstOpcode16 { opcode: u16, pc: u64 },
}

pub type RecordResult = Result<Record, Error>;

impl Record {
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Record::Identifier => Descriptor::Identifier,
            Record::Version { .. } => Descriptor::Version,
            Record::Comment { .. } => Descriptor::Comment,
            Record::Isa { .. } => Descriptor::Isa,
            Record::InstIem { .. } => Descriptor::InstIem,
            Record::TraceInfo(_) => Descriptor::TraceInfo,
            Record::TraceInfoFeature { .. } => Descriptor::TraceInfoFeature,
            Record::ProcessIdExt { .. } => Descriptor::ProcessIdExt,
            Record::ForcePc { .. } => Descriptor::ForcePc,
            Record::VlenConfig { .. } => Descriptor::VlenConfig,
            Record::IsaExtended { .. } => Descriptor::IsaExtended,
            Record::EndHeader => Descriptor::EndHeader,
            Record::InstPcTarget { .. } => Descriptor::InstPcTarget,
            Record::InstReg(_) => Descriptor::InstReg,
            Record::InstReadyReg { .. } => Descriptor::InstReadyReg,
            Record::PageTableWalk(_) => Descriptor::PageTableWalk,
            Record::InstMemAccess(_) => Descriptor::InstMemAccess,
            Record::InstMemContent { .. } => Descriptor::InstMemContent,
            Record::BusMasterAccess(_) => Descriptor::BusMasterAccess,
            Record::BusMasterContent { .. } => Descriptor::BusMasterContent,
            Record::Event { .. } => Descriptor::Event,
            Record::EventPcTarget { .. } => Descriptor::EventPcTarget,
            Record::InstMicroop { .. } => Descriptor::InstMicroop,
            Record::InstOpcode32 { .. } => Descriptor::InstOpcode32,
            Record::InstOpcode16 { .. } => Descriptor::InstOpcode16,
        }
    }

    pub fn opcode32(opcode: u32) -> Self {
        Record::InstOpcode32 { opcode, pc: 0 }
    }

    pub fn opcode16(opcode: u16) -> Self {
        Record::InstOpcode16 { opcode, pc: 0 }
    }

    pub fn event(event: EventCode, content: Vec<u64>) -> Self {
        Record::Event { event, content }
    }

    pub fn comment(data: impl Into<String>) -> Self {
        Record::Comment { data: data.into() }
    }
}
