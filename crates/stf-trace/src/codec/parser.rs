use std::io::{ErrorKind, Read};

use anyhow::{Error, bail, ensure};

use crate::{
    descriptor::Descriptor,
    event::EventCode,
    features::TraceFeatures,
    isa::{InstIem, Isa, TraceGenerator},
    records::{
        BusMasterAccess, BusMasterType, InstReg, MemAccess, MemAccessType, PageTableEntry,
        PageTableWalk, Record, RecordResult, TraceInfo,
    },
    registers::{Reg, RegType, vector_words},
};

use super::{STF_IDENTIFIER, StreamState};

/// Decodes the records of an STF stream one by one
pub struct RecordParser<R: Read> {
    input: R,
    state: StreamState,
}

impl<R: Read> RecordParser<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            state: StreamState::default(),
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    fn read_descriptor(&mut self) -> Result<Option<Descriptor>, Error> {
        let mut id = [0; 1];
        if let Err(e) = self.input.read_exact(&mut id) {
            match e.kind() {
                ErrorKind::UnexpectedEof => return Ok(None),
                _ => bail!(e),
            }
        }

        Descriptor::try_from_id(id[0]).map(Some)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buffer = [0; N];
        if let Err(e) = self.input.read_exact(&mut buffer) {
            match e.kind() {
                ErrorKind::UnexpectedEof => bail!("STF stream ended in the middle of a record"),
                _ => bail!(e),
            }
        }

        Ok(buffer)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(u8::from_le_bytes(self.read_array()?))
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_u64_vec(&mut self, len: usize) -> Result<Vec<u64>, Error> {
        (0..len).map(|_| self.read_u64()).collect()
    }

    fn read_string(&mut self, len: usize) -> Result<String, Error> {
        let mut buffer = vec![0; len];
        if let Err(e) = self.input.read_exact(&mut buffer) {
            match e.kind() {
                ErrorKind::UnexpectedEof => bail!("STF stream ended in the middle of a record"),
                _ => bail!(e),
            }
        }

        Ok(String::from_utf8(buffer)?)
    }

    fn read_inst_reg(&mut self) -> Result<InstReg, Error> {
        let num = self.read_u16()?;
        let (reg_type, operand) = Reg::split_metadata(self.read_u8()?)?;

        let data = if reg_type == RegType::Vector {
            let Some(vlen) = self.state.vlen() else {
                bail!("Vector register record found before VLEN_CONFIG");
            };
            self.read_u64_vec(vector_words(vlen))?
        } else {
            vec![self.read_u64()?]
        };

        Ok(InstReg::new(Reg::new(num, reg_type), operand, data))
    }

    fn read_record(&mut self, descriptor: Descriptor) -> RecordResult {
        let record = match descriptor {
            Descriptor::Identifier => {
                ensure!(
                    self.read_array::<3>()? == STF_IDENTIFIER,
                    "Not an STF file: invalid identifier"
                );
                Record::Identifier
            }
            Descriptor::Version => Record::Version {
                major: self.read_u32()?,
                minor: self.read_u32()?,
            },
            Descriptor::Comment => {
                let len = self.read_u32()?;
                Record::Comment {
                    data: self.read_string(usize::try_from(len)?)?,
                }
            }
            Descriptor::Isa => Record::Isa {
                isa: Isa::try_from_id(self.read_u16()?)?,
            },
            Descriptor::InstIem => Record::InstIem {
                iem: InstIem::try_from_id(self.read_u16()?)?,
            },
            Descriptor::TraceInfo => {
                let generator = TraceGenerator::try_from_id(self.read_u8()?)?;
                let major = self.read_u8()?;
                let minor = self.read_u8()?;
                let minor_minor = self.read_u8()?;
                let len = self.read_u16()?;
                let comment = self.read_string(usize::from(len))?;
                Record::TraceInfo(TraceInfo::new(
                    generator,
                    major,
                    minor,
                    minor_minor,
                    comment,
                ))
            }
            Descriptor::TraceInfoFeature => Record::TraceInfoFeature {
                features: TraceFeatures::from_bits_retain(self.read_u64()?),
            },
            Descriptor::ProcessIdExt => Record::ProcessIdExt {
                hw_thread_id: self.read_u32()?,
                pid: self.read_u32()?,
                tid: self.read_u32()?,
            },
            Descriptor::ForcePc => Record::ForcePc {
                addr: self.read_u64()?,
            },
            Descriptor::VlenConfig => {
                let vlen = self.read_u32()?;
                ensure!(vlen != 0, "VLEN_CONFIG record with a vlen of 0");
                Record::VlenConfig { vlen }
            }
            Descriptor::IsaExtended => {
                let len = self.read_u32()?;
                Record::IsaExtended {
                    isa: self.read_string(usize::try_from(len)?)?,
                }
            }
            Descriptor::EndHeader => Record::EndHeader,
            Descriptor::InstPcTarget => Record::InstPcTarget {
                addr: self.read_u64()?,
            },
            Descriptor::InstReg => Record::InstReg(self.read_inst_reg()?),
            Descriptor::InstReadyReg => Record::InstReadyReg {
                reg: self.read_u16()?,
            },
            Descriptor::PageTableWalk => {
                let va = self.read_u64()?;
                let index = self.read_u64()?;
                let page_size = self.read_u32()?;
                let count = self.read_u8()?;
                let mut entries = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    entries.push(PageTableEntry {
                        pa: self.read_u64()?,
                        pte: self.read_u64()?,
                    });
                }
                Record::PageTableWalk(PageTableWalk {
                    va,
                    index,
                    page_size,
                    entries,
                })
            }
            Descriptor::InstMemAccess => Record::InstMemAccess(MemAccess {
                address: self.read_u64()?,
                size: self.read_u16()?,
                attr: self.read_u16()?,
                access: MemAccessType::try_from_id(self.read_u8()?)?,
            }),
            Descriptor::InstMemContent => Record::InstMemContent {
                data: self.read_u64()?,
            },
            Descriptor::BusMasterAccess => Record::BusMasterAccess(BusMasterAccess {
                address: self.read_u64()?,
                size: self.read_u16()?,
                src_type: BusMasterType::try_from_id(self.read_u8()?)?,
                src_idx: self.read_u8()?,
                attr: self.read_u32()?,
                access: MemAccessType::try_from_id(self.read_u8()?)?,
            }),
            Descriptor::BusMasterContent => Record::BusMasterContent {
                data: self.read_u64()?,
            },
            Descriptor::Event => {
                let event = if self.state.event32() {
                    EventCode::from_event32(self.read_u32()?)
                } else {
                    EventCode::new(self.read_u64()?)
                };
                let count = self.read_u8()?;
                Record::Event {
                    event,
                    content: self.read_u64_vec(usize::from(count))?,
                }
            }
            Descriptor::EventPcTarget => Record::EventPcTarget {
                addr: self.read_u64()?,
            },
            Descriptor::InstMicroop => Record::InstMicroop {
                size: self.read_u8()?,
                microop: self.read_u32()?,
            },
            Descriptor::InstOpcode32 => Record::InstOpcode32 {
                opcode: self.read_u32()?,
                pc: 0,
            },
            Descriptor::InstOpcode16 => Record::InstOpcode16 {
                opcode: self.read_u16()?,
                pc: 0,
            },
            Descriptor::ProtocolId
            | Descriptor::ClockId
            | Descriptor::Transaction
            | Descriptor::TransactionDependency => {
                bail!("Transaction trace opened with an instruction reader: found a {descriptor} record")
            }
        };

        Ok(record)
    }

    fn inner_next(&mut self) -> Result<Option<Record>, Error> {
        let Some(descriptor) = self.read_descriptor()? else {
            return Ok(None);
        };

        let mut record = self.read_record(descriptor)?;
        if let Some(inst_pc) = self.state.track(&record) {
            if let Record::InstOpcode32 { pc, .. } | Record::InstOpcode16 { pc, .. } = &mut record {
                *pc = inst_pc;
            }
        }

        Ok(Some(record))
    }
}

impl<R: Read> Iterator for RecordParser<R> {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::RecordParser;
    use crate::{
        event::{EventCode, SPECIAL_MASK},
        records::{InstReg, MemAccess, MemAccessType, Record},
        registers::{OperandType, Reg},
    };

    #[test]
    fn parse_instruction_records() -> Result<(), Error> {
        let mut binary_trace = Vec::new();
        // FORCE_PC 0x1000
        binary_trace.push(9);
        binary_trace.extend(0x1000_u64.to_le_bytes());
        // INST_REG x5 source = 7
        binary_trace.push(40);
        binary_trace.extend(5_u16.to_le_bytes());
        binary_trace.push(0x21);
        binary_trace.extend(7_u64.to_le_bytes());
        // INST_MEM_ACCESS + INST_MEM_CONTENT
        binary_trace.push(60);
        binary_trace.extend(0x8000_u64.to_le_bytes());
        binary_trace.extend(8_u16.to_le_bytes());
        binary_trace.extend(0_u16.to_le_bytes());
        binary_trace.push(1);
        binary_trace.push(61);
        binary_trace.extend(0xdead_u64.to_le_bytes());
        // INST_OPCODE32 ld
        binary_trace.push(240);
        binary_trace.extend(0x0002b283_u32.to_le_bytes());
        // INST_OPCODE16 c.nop
        binary_trace.push(241);
        binary_trace.extend(0x0001_u16.to_le_bytes());

        let parsed: Result<Vec<Record>, Error> = RecordParser::new(binary_trace.as_slice()).collect();
        let expected = vec![
            Record::ForcePc { addr: 0x1000 },
            Record::InstReg(InstReg::scalar(Reg::gpr(5), OperandType::Source, 7)),
            Record::InstMemAccess(MemAccess::new(0x8000, 8, 0, MemAccessType::Read)),
            Record::InstMemContent { data: 0xdead },
            Record::InstOpcode32 {
                opcode: 0x0002b283,
                pc: 0x1000,
            },
            Record::InstOpcode16 {
                opcode: 0x0001,
                pc: 0x1004,
            },
        ];

        assert_eq!(expected, parsed?);

        Ok(())
    }

    #[test]
    fn parse_32_bit_events() -> Result<(), Error> {
        let mut binary_trace = Vec::new();
        // TRACE_INFO_FEATURE without EVENT64
        binary_trace.push(7);
        binary_trace.extend(0x20_u64.to_le_bytes());
        // EVENT mode change to user in 32-bit encoding
        binary_trace.push(100);
        binary_trace.extend(0x4000_0000_u32.to_le_bytes());
        binary_trace.push(1);
        binary_trace.extend(0_u64.to_le_bytes());

        let mut parser = RecordParser::new(binary_trace.as_slice());
        parser.next().unwrap()?;
        assert_eq!(
            parser.next().unwrap()?,
            Record::event(EventCode::new(SPECIAL_MASK), vec![0])
        );
        assert!(parser.next().is_none());
        assert_eq!(parser.state().num_records(), 2);

        Ok(())
    }

    #[test]
    fn parse_vector_registers() -> Result<(), Error> {
        let mut binary_trace = Vec::new();
        binary_trace.push(10);
        binary_trace.extend(128_u32.to_le_bytes());
        binary_trace.push(40);
        binary_trace.extend(2_u16.to_le_bytes());
        binary_trace.push(0x33);
        binary_trace.extend(1_u64.to_le_bytes());
        binary_trace.extend(2_u64.to_le_bytes());

        let parsed: Result<Vec<Record>, Error> = RecordParser::new(binary_trace.as_slice()).collect();
        let parsed = parsed?;
        assert_eq!(
            parsed[1],
            Record::InstReg(InstReg::new(Reg::vector(2), OperandType::Dest, vec![1, 2]))
        );

        Ok(())
    }

    #[test]
    fn fail_on_vector_register_without_vlen() {
        let mut binary_trace = vec![40];
        binary_trace.extend(2_u16.to_le_bytes());
        binary_trace.push(0x33);
        binary_trace.extend(1_u64.to_le_bytes());

        let mut parser = RecordParser::new(binary_trace.as_slice());
        parser.next().unwrap().unwrap_err();
    }

    #[test]
    fn fail_on_truncated_record() {
        let mut binary_trace = vec![9];
        binary_trace.extend(0x1000_u32.to_le_bytes());

        let mut parser = RecordParser::new(binary_trace.as_slice());
        let err = parser.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("middle of a record"));
    }

    #[test]
    fn fail_on_unknown_descriptor() {
        let binary_trace = [42_u8];
        let mut parser = RecordParser::new(&binary_trace[..]);
        parser.next().unwrap().unwrap_err();
    }

    #[test]
    fn fail_on_transaction_records() {
        let binary_trace = [250_u8, 0, 0];
        let mut parser = RecordParser::new(&binary_trace[..]);
        let err = parser.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("Transaction trace"));
    }

    #[test]
    fn fail_on_invalid_identifier() {
        let binary_trace = [1_u8, b'S', b'T', b'G'];
        let mut parser = RecordParser::new(&binary_trace[..]);
        parser.next().unwrap().unwrap_err();

        let binary_trace = [1_u8, b'S', b'T', b'F'];
        let mut parser = RecordParser::new(&binary_trace[..]);
        assert_eq!(parser.next().unwrap().unwrap(), Record::Identifier);
    }
}
