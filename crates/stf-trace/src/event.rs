use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit marking asynchronous events
pub const INTERRUPT_MASK: u64 = 1 << 63;
/// Bit marking special (non-architectural) events
pub const SPECIAL_MASK: u64 = 1 << 62;

const EVENT32_INTERRUPT_MASK: u32 = 1 << 31;
const EVENT32_SPECIAL_MASK: u32 = 1 << 30;
const EVENT32_TOP_BITS: u32 = EVENT32_INTERRUPT_MASK | EVENT32_SPECIAL_MASK;
const EVENT64_TOP_BITS: u64 = INTERRUPT_MASK | SPECIAL_MASK;

const USER_ECALL: u64 = 0x8;
const MACHINE_ECALL: u64 = 0xb;

const EXCEPTION_NAMES: [(u64, &str); 19] = [
    (0x0, "INST_ADDR_MISALIGN"),
    (0x1, "INST_ADDR_FAULT"),
    (0x2, "ILLEGAL_INST"),
    (0x3, "BREAKPOINT"),
    (0x4, "LOAD_ADDR_MISALIGN"),
    (0x5, "LOAD_ACCESS_FAULT"),
    (0x6, "STORE_ADDR_MISALIGN"),
    (0x7, "STORE_ACCESS_FAULT"),
    (0x8, "USER_ECALL"),
    (0x9, "SUPERVISOR_ECALL"),
    (0xa, "HYPERVISOR_ECALL"),
    (0xb, "MACHINE_ECALL"),
    (0xc, "INST_PAGE_FAULT"),
    (0xd, "LOAD_PAGE_FAULT"),
    (0xf, "STORE_PAGE_FAULT"),
    (0x14, "GUEST_INST_PAGE_FAULT"),
    (0x15, "GUEST_LOAD_PAGE_FAULT"),
    (0x16, "VIRTUAL_INST"),
    (0x17, "GUEST_STORE_PAGE_FAULT"),
];

const INTERRUPT_NAMES: [(u64, &str); 14] = [
    (0x0, "INT_USER_SOFTWARE"),
    (0x1, "INT_SUPERVISOR_SOFTWARE"),
    (0x2, "INT_HYPERVISOR_SOFTWARE"),
    (0x3, "INT_MACHINE_SOFTWARE"),
    (0x4, "INT_USER_TIMER"),
    (0x5, "INT_SUPERVISOR_TIMER"),
    (0x6, "INT_HYPERVISOR_TIMER"),
    (0x7, "INT_MACHINE_TIMER"),
    (0x8, "INT_USER_EXT"),
    (0x9, "INT_SUPERVISOR_EXT"),
    (0xa, "INT_HYPERVISOR_EXT"),
    (0xb, "INT_MACHINE_EXT"),
    (0xc, "INT_COPROCESSOR"),
    (0xd, "INT_HOST"),
];

/// The raw event code of an EVENT record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCode(u64);

impl EventCode {
    pub const USER_ECALL: Self = Self(USER_ECALL);
    pub const SUPERVISOR_ECALL: Self = Self(0x9);
    pub const MACHINE_ECALL: Self = Self(MACHINE_ECALL);
    pub const ILLEGAL_INST: Self = Self(0x2);
    pub const LOAD_PAGE_FAULT: Self = Self(0xd);
    pub const INT_MACHINE_TIMER: Self = Self(0x7 | INTERRUPT_MASK);
    pub const MODE_CHANGE: Self = Self(SPECIAL_MASK);

    pub const fn new(code: u64) -> Self {
        Self(code)
    }

    pub const fn code(&self) -> u64 {
        self.0
    }

    /// Packs the event into the 32-bit on-disk representation
    pub const fn to_event32(&self) -> u32 {
        (self.0 as u32) | ((self.0 & EVENT64_TOP_BITS) >> 32) as u32
    }

    /// Unpacks an event from its 32-bit on-disk representation
    pub const fn from_event32(event32: u32) -> Self {
        Self((event32 & !EVENT32_TOP_BITS) as u64 | ((event32 & EVENT32_TOP_BITS) as u64) << 32)
    }

    pub const fn is_interrupt(&self) -> bool {
        self.0 & INTERRUPT_MASK != 0
    }

    pub const fn is_mode_change(&self) -> bool {
        self.0 == SPECIAL_MASK
    }

    pub const fn is_syscall(&self) -> bool {
        self.0 >= USER_ECALL && self.0 <= MACHINE_ECALL
    }

    pub const fn is_fault(&self) -> bool {
        !self.is_mode_change() && !self.is_interrupt() && !self.is_syscall()
    }

    pub fn name(&self) -> Option<&'static str> {
        if self.is_mode_change() {
            return Some("MODE_CHANGE");
        }

        let (table, code): (&[(u64, &'static str)], u64) = if self.is_interrupt() {
            (INTERRUPT_NAMES.as_slice(), self.0 & !INTERRUPT_MASK)
        } else {
            (EXCEPTION_NAMES.as_slice(), self.0)
        };

        table
            .iter()
            .find(|(value, _)| *value == code)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN_EVENT({:#x})", self.0),
        }
    }
}
