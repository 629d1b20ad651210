use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// The feature bits announced by a TRACE_INFO_FEATURE record. Unknown
    /// bits are kept.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TraceFeatures: u64 {
        const PHYSICAL_ADDRESS = 0x1;
        const DATA_ATTRIBUTE = 0x2;
        const OPERAND_VALUE = 0x4;
        const EVENT = 0x8;
        const SYSTEMCALL_VALUE = 0x10;
        const RV64 = 0x20;
        const INT_DIV_OPERAND_VALUE = 0x40;
        const SAMPLING = 0x80;
        const PTE = 0x100;
        const SIMPOINT = 0x200;
        const PROCESS_ID = 0x400;
        const PTE_ONLY = 0x800;
        const NEED_POST_PROCESS = 0x1000;
        const REG_STATE = 0x2000;
        const MICROOP = 0x4000;
        const MULTI_THREAD = 0x8000;
        const MULTI_CORE = 0x10000;
        const PTE_HW_AD = 0x20000;
        const VEC = 0x40000;
        const EVENT64 = 0x80000;
        const TRANSACTIONS = 0x100000;
    }
}

impl TraceFeatures {
    /// Names of all known features that are set
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl fmt::Display for TraceFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}
