use std::fmt;

use anyhow::{Error, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Extensions implied by a RISC-V trace that carries no ISA_EXTENDED record
const DEFAULT_RISCV_ISA_EXTENSIONS: &str = "imafdcvh_zicbom_zicbop_zicboz_zicsr_zicond_zifencei_zihintpause_zfhmin_zba_zbb_zbs_zihintntl_zvbb_zvbc_zvkg_zvkned_zvknhb_zvksed_zvksh_zvkt_smaia_smstateen_ss1p12_ssaia_sscofpmf_ssstateen_sv48_svinval_svnapot_svpbmt";

/// The instruction set architecture of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isa {
    Reserved,
    Riscv,
    Arm,
    X86,
    Power,
}

impl Isa {
    pub fn id(&self) -> u16 {
        match self {
            Isa::Reserved => 0,
            Isa::Riscv => 1,
            Isa::Arm => 2,
            Isa::X86 => 3,
            Isa::Power => 4,
        }
    }

    pub fn try_from_id(id: u16) -> Result<Self, Error> {
        match id {
            0 => Ok(Isa::Reserved),
            1 => Ok(Isa::Riscv),
            2 => Ok(Isa::Arm),
            3 => Ok(Isa::X86),
            4 => Ok(Isa::Power),
            _ => Err(anyhow!("Invalid ISA: {id}")),
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Isa::Reserved => "RESERVED",
            Isa::Riscv => "RISCV",
            Isa::Arm => "ARM",
            Isa::X86 => "X86",
            Isa::Power => "POWER",
        })
    }
}

/// The instruction encoding mode of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstIem {
    Invalid,
    Rv32,
    Rv64,
}

impl InstIem {
    pub fn id(&self) -> u16 {
        match self {
            InstIem::Invalid => 0,
            InstIem::Rv32 => 1,
            InstIem::Rv64 => 2,
        }
    }

    pub fn try_from_id(id: u16) -> Result<Self, Error> {
        match id {
            0 => Ok(InstIem::Invalid),
            1 => Ok(InstIem::Rv32),
            2 => Ok(InstIem::Rv64),
            _ => Err(anyhow!("Invalid INST_IEM: {id}")),
        }
    }
}

impl fmt::Display for InstIem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstIem::Invalid => "INVALID",
            InstIem::Rv32 => "RV32",
            InstIem::Rv64 => "RV64",
        })
    }
}

/// Privilege level carried by mode change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    User,
    Supervisor,
    Hypervisor,
    Machine,
}

impl ExecutionMode {
    pub fn id(&self) -> u64 {
        match self {
            ExecutionMode::User => 0,
            ExecutionMode::Supervisor => 1,
            ExecutionMode::Hypervisor => 2,
            ExecutionMode::Machine => 3,
        }
    }

    pub fn try_from_id(id: u64) -> Result<Self, Error> {
        match id {
            0 => Ok(ExecutionMode::User),
            1 => Ok(ExecutionMode::Supervisor),
            2 => Ok(ExecutionMode::Hypervisor),
            3 => Ok(ExecutionMode::Machine),
            _ => Err(anyhow!("Invalid execution mode: {id}")),
        }
    }
}

/// The tool that generated (or last rewrote) a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceGenerator {
    Reserved,
    Qemu,
    AndroidEmulator,
    Gem5,
    PteGen,
    Imperas,
    Spike,
    StfExtract,
    StfMerge,
    StfFilterEvt,
    Athena,
    StfMorph,
    Dromajo,
    Pegasus,
    StfTransactionExtract,
    StfTransactionExample,
}

impl TraceGenerator {
    pub fn id(&self) -> u8 {
        match self {
            TraceGenerator::Reserved => 0,
            TraceGenerator::Qemu => 1,
            TraceGenerator::AndroidEmulator => 2,
            TraceGenerator::Gem5 => 3,
            TraceGenerator::PteGen => 4,
            TraceGenerator::Imperas => 5,
            TraceGenerator::Spike => 6,
            TraceGenerator::StfExtract => 7,
            TraceGenerator::StfMerge => 8,
            TraceGenerator::StfFilterEvt => 9,
            TraceGenerator::Athena => 10,
            TraceGenerator::StfMorph => 11,
            TraceGenerator::Dromajo => 12,
            TraceGenerator::Pegasus => 13,
            TraceGenerator::StfTransactionExtract => 14,
            TraceGenerator::StfTransactionExample => 0x40,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(TraceGenerator::Reserved),
            1 => Ok(TraceGenerator::Qemu),
            2 => Ok(TraceGenerator::AndroidEmulator),
            3 => Ok(TraceGenerator::Gem5),
            4 => Ok(TraceGenerator::PteGen),
            5 => Ok(TraceGenerator::Imperas),
            6 => Ok(TraceGenerator::Spike),
            7 => Ok(TraceGenerator::StfExtract),
            8 => Ok(TraceGenerator::StfMerge),
            9 => Ok(TraceGenerator::StfFilterEvt),
            10 => Ok(TraceGenerator::Athena),
            11 => Ok(TraceGenerator::StfMorph),
            12 => Ok(TraceGenerator::Dromajo),
            13 => Ok(TraceGenerator::Pegasus),
            14 => Ok(TraceGenerator::StfTransactionExtract),
            0x40 => Ok(TraceGenerator::StfTransactionExample),
            _ => Err(anyhow!("Invalid trace generator: {id}")),
        }
    }
}

impl fmt::Display for TraceGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceGenerator::Reserved => "RESERVED",
            TraceGenerator::Qemu => "QEMU",
            TraceGenerator::AndroidEmulator => "ANDROID_EMULATOR",
            TraceGenerator::Gem5 => "GEM5",
            TraceGenerator::PteGen => "PTE_GEN",
            TraceGenerator::Imperas => "IMPERAS",
            TraceGenerator::Spike => "SPIKE",
            TraceGenerator::StfExtract => "STF_EXTRACT",
            TraceGenerator::StfMerge => "STF_MERGE",
            TraceGenerator::StfFilterEvt => "STF_FILTER_EVT",
            TraceGenerator::Athena => "ATHENA",
            TraceGenerator::StfMorph => "STF_MORPH",
            TraceGenerator::Dromajo => "DROMAJO",
            TraceGenerator::Pegasus => "PEGASUS",
            TraceGenerator::StfTransactionExtract => "STF_TRANSACTION_EXTRACT",
            TraceGenerator::StfTransactionExample => "STF_TRANSACTION_EXAMPLE",
        })
    }
}

/// Returns the extended ISA string implied by `isa` and `iem` for traces
/// that do not carry an explicit ISA_EXTENDED record.
///
/// # Errors
///
/// Fails for RISC-V traces without a valid encoding mode and for the
/// reserved ISA.
pub fn default_isa_extended(isa: Isa, iem: InstIem) -> Result<String, Error> {
    match isa {
        Isa::Riscv => match iem {
            InstIem::Rv32 => Ok(format!("rv32{DEFAULT_RISCV_ISA_EXTENSIONS}")),
            InstIem::Rv64 => Ok(format!("rv64{DEFAULT_RISCV_ISA_EXTENSIONS}")),
            InstIem::Invalid => bail!("Invalid INST_IEM for RISCV: {iem}"),
        },
        Isa::Arm | Isa::X86 | Isa::Power => Ok(String::new()),
        Isa::Reserved => bail!("Invalid ISA type"),
    }
}
