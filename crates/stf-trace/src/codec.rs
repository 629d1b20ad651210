//! Utilities to decode and encode the records of an STF trace.
//!
//! Every record starts with a one byte descriptor followed by its
//! little-endian fields. Some records change how later records are laid out
//! (VLEN_CONFIG and TRACE_INFO_FEATURE), so both directions share a
//! [`StreamState`].

use crate::{features::TraceFeatures, pc_tracker::PcTracker, records::Record};

pub mod encoder;
pub mod parser;

/// Payload of the IDENTIFIER record
pub const STF_IDENTIFIER: [u8; 3] = *b"STF";

/// The format version written by this crate
pub const CURRENT_VERSION_MAJOR: u32 = 1;
pub const CURRENT_VERSION_MINOR: u32 = 6;

/// The oldest format version that can still be read
pub const OLDEST_VERSION_MAJOR: u32 = 1;
pub const OLDEST_VERSION_MINOR: u32 = 2;

/// Size of an INST_OPCODE32 instruction in bytes
pub const OPCODE32_SIZE: u64 = 4;
/// Size of an INST_OPCODE16 instruction in bytes
pub const OPCODE16_SIZE: u64 = 2;

/// State carried along a record stream
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    vlen: Option<u32>,
    event32: bool,
    pc_tracker: PcTracker,
    num_records: u64,
    num_marker_records: u64,
}

impl StreamState {
    pub fn vlen(&self) -> Option<u32> {
        self.vlen
    }

    pub fn event32(&self) -> bool {
        self.event32
    }

    pub fn pc(&self) -> u64 {
        self.pc_tracker.pc()
    }

    pub fn next_pc(&self) -> u64 {
        self.pc_tracker.next_pc()
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn num_marker_records(&self) -> u64 {
        self.num_marker_records
    }

    /// Applies the side effects of a record that has just been decoded or
    /// encoded. Returns the PC of opcode records.
    pub fn track(&mut self, record: &Record) -> Option<u64> {
        self.num_records += 1;

        match record {
            Record::VlenConfig { vlen } => self.vlen = Some(*vlen),
            Record::TraceInfoFeature { features } => {
                self.event32 = !features.contains(TraceFeatures::EVENT64)
            }
            Record::ForcePc { addr } => self.pc_tracker.force_pc(*addr),
            Record::InstPcTarget { addr } | Record::EventPcTarget { addr } => {
                self.pc_tracker.branch_target(*addr)
            }
            Record::InstOpcode32 { .. } => {
                self.num_marker_records += 1;
                return Some(self.pc_tracker.advance(OPCODE32_SIZE));
            }
            Record::InstOpcode16 { .. } => {
                self.num_marker_records += 1;
                return Some(self.pc_tracker.advance(OPCODE16_SIZE));
            }
            _ => {}
        }

        None
    }
}

/// Checks whether `major.minor` lies in the range of readable versions
pub fn is_supported_version(major: u32, minor: u32) -> bool {
    (major, minor) >= (OLDEST_VERSION_MAJOR, OLDEST_VERSION_MINOR)
        && (major, minor) <= (CURRENT_VERSION_MAJOR, CURRENT_VERSION_MINOR)
}
