use std::fmt;

use anyhow::{Error, anyhow};
use serde::{Deserialize, Serialize};

/// The encoded descriptor that prefixes every record of an STF trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Descriptor {
    Identifier,
    Version,
    Comment,
    Isa,
    InstIem,
    TraceInfo,
    TraceInfoFeature,
    ProcessIdExt,
    ForcePc,
    VlenConfig,
    ProtocolId,
    ClockId,
    IsaExtended,
    EndHeader,
    InstPcTarget,
    InstReg,
    InstReadyReg,
    PageTableWalk,
    InstMemAccess,
    InstMemContent,
    BusMasterAccess,
    BusMasterContent,
    Event,
    EventPcTarget,
    InstMicroop,
    InstOpcode32,
    InstOpcode16,
    Transaction,
    TransactionDependency,
}

impl Descriptor {
    /// Returns the byte that identifies the descriptor inside a trace
    pub fn id(&self) -> u8 {
        match self {
            Descriptor::Identifier => 1,
            Descriptor::Version => 2,
            Descriptor::Comment => 3,
            Descriptor::Isa => 4,
            Descriptor::InstIem => 5,
            Descriptor::TraceInfo => 6,
            Descriptor::TraceInfoFeature => 7,
            Descriptor::ProcessIdExt => 8,
            Descriptor::ForcePc => 9,
            Descriptor::VlenConfig => 10,
            Descriptor::ProtocolId => 11,
            Descriptor::ClockId => 12,
            Descriptor::IsaExtended => 13,
            Descriptor::EndHeader => 19,
            Descriptor::InstPcTarget => 31,
            Descriptor::InstReg => 40,
            Descriptor::InstReadyReg => 41,
            Descriptor::PageTableWalk => 50,
            Descriptor::InstMemAccess => 60,
            Descriptor::InstMemContent => 61,
            Descriptor::BusMasterAccess => 62,
            Descriptor::BusMasterContent => 63,
            Descriptor::Event => 100,
            Descriptor::EventPcTarget => 101,
            Descriptor::InstMicroop => 230,
            Descriptor::InstOpcode32 => 240,
            Descriptor::InstOpcode16 => 241,
            Descriptor::Transaction => 250,
            Descriptor::TransactionDependency => 251,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            1 => Ok(Descriptor::Identifier),
            2 => Ok(Descriptor::Version),
            3 => Ok(Descriptor::Comment),
            4 => Ok(Descriptor::Isa),
            5 => Ok(Descriptor::InstIem),
            6 => Ok(Descriptor::TraceInfo),
            7 => Ok(Descriptor::TraceInfoFeature),
            8 => Ok(Descriptor::ProcessIdExt),
            9 => Ok(Descriptor::ForcePc),
            10 => Ok(Descriptor::VlenConfig),
            11 => Ok(Descriptor::ProtocolId),
            12 => Ok(Descriptor::ClockId),
            13 => Ok(Descriptor::IsaExtended),
            19 => Ok(Descriptor::EndHeader),
            31 => Ok(Descriptor::InstPcTarget),
            40 => Ok(Descriptor::InstReg),
            41 => Ok(Descriptor::InstReadyReg),
            50 => Ok(Descriptor::PageTableWalk),
            60 => Ok(Descriptor::InstMemAccess),
            61 => Ok(Descriptor::InstMemContent),
            62 => Ok(Descriptor::BusMasterAccess),
            63 => Ok(Descriptor::BusMasterContent),
            100 => Ok(Descriptor::Event),
            101 => Ok(Descriptor::EventPcTarget),
            230 => Ok(Descriptor::InstMicroop),
            240 => Ok(Descriptor::InstOpcode32),
            241 => Ok(Descriptor::InstOpcode16),
            250 => Ok(Descriptor::Transaction),
            251 => Ok(Descriptor::TransactionDependency),
            _ => Err(anyhow!("Unknown STF record descriptor: {id}")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Descriptor::Identifier => "IDENTIFIER",
            Descriptor::Version => "VERSION",
            Descriptor::Comment => "COMMENT",
            Descriptor::Isa => "ISA",
            Descriptor::InstIem => "INST_IEM",
            Descriptor::TraceInfo => "TRACE_INFO",
            Descriptor::TraceInfoFeature => "TRACE_INFO_FEATURE",
            Descriptor::ProcessIdExt => "PROCESS_ID_EXT",
            Descriptor::ForcePc => "FORCE_PC",
            Descriptor::VlenConfig => "VLEN_CONFIG",
            Descriptor::ProtocolId => "PROTOCOL_ID",
            Descriptor::ClockId => "CLOCK_ID",
            Descriptor::IsaExtended => "ISA_EXTENDED",
            Descriptor::EndHeader => "END_HEADER",
            Descriptor::InstPcTarget => "INST_PC_TARGET",
            Descriptor::InstReg => "INST_REG",
            Descriptor::InstReadyReg => "INST_READY_REG",
            Descriptor::PageTableWalk => "PAGE_TABLE_WALK",
            Descriptor::InstMemAccess => "INST_MEM_ACCESS",
            Descriptor::InstMemContent => "INST_MEM_CONTENT",
            Descriptor::BusMasterAccess => "BUS_MASTER_ACCESS",
            Descriptor::BusMasterContent => "BUS_MASTER_CONTENT",
            Descriptor::Event => "EVENT",
            Descriptor::EventPcTarget => "EVENT_PC_TARGET",
            Descriptor::InstMicroop => "INST_MICROOP",
            Descriptor::InstOpcode32 => "INST_OPCODE32",
            Descriptor::InstOpcode16 => "INST_OPCODE16",
            Descriptor::Transaction => "TRANSACTION",
            Descriptor::TransactionDependency => "TRANSACTION_DEPENDENCY",
        }
    }

    /// Opcode records terminate an instruction and act as marker records
    /// for chunking compressed traces.
    pub fn is_instruction_record(&self) -> bool {
        matches!(self, Descriptor::InstOpcode32 | Descriptor::InstOpcode16)
    }

    /// Records that only occur in transaction traces
    pub fn is_transaction_record(&self) -> bool {
        matches!(
            self,
            Descriptor::ProtocolId
                | Descriptor::ClockId
                | Descriptor::Transaction
                | Descriptor::TransactionDependency
        )
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::Descriptor;

    const VALID_IDS: [u8; 29] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 19, 31, 40, 41, 50, 60, 61, 62, 63, 100, 101,
        230, 240, 241, 250, 251,
    ];

    #[test]
    fn fail_on_invalid_descriptor_id() {
        for id in (0..=u8::MAX).filter(|id| !VALID_IDS.contains(id)) {
            Descriptor::try_from_id(id).unwrap_err();
        }
    }

    #[test]
    fn validate_correct_descriptor_ids() {
        for id in VALID_IDS {
            let descriptor = Descriptor::try_from_id(id).unwrap();
            assert_eq!(descriptor.id(), id);
        }
    }

    #[test]
    fn only_opcodes_are_instruction_records() {
        let instruction_records: Vec<Descriptor> = VALID_IDS
            .into_iter()
            .map(|id| Descriptor::try_from_id(id).unwrap())
            .filter(Descriptor::is_instruction_record)
            .collect();

        assert_eq!(
            instruction_records,
            [Descriptor::InstOpcode32, Descriptor::InstOpcode16]
        );
        assert_eq!(Descriptor::InstReg.to_string(), "INST_REG");
    }
}
