use std::io::Write;

use anyhow::{Error, bail, ensure};

use crate::{
    records::{InstReg, Record},
    registers::vector_words,
};

use super::{STF_IDENTIFIER, StreamState};

/// Encodes records into the binary STF representation
pub struct RecordEncoder<W: Write> {
    output: W,
    state: StreamState,
    /// The record being encoded. Nothing reaches `output` unless the whole
    /// record encoded successfully.
    scratch: Vec<u8>,
}

impl<W: Write> RecordEncoder<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            state: StreamState::default(),
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.output
    }

    pub fn into_inner(self) -> W {
        self.output
    }

    /// Writes a single record. The PC of opcode records is ignored, it is
    /// implied by the records written before.
    pub fn encode(&mut self, record: &Record) -> Result<(), Error> {
        self.scratch.clear();
        self.scratch.push(record.descriptor().id());

        match record {
            Record::Identifier => self.scratch.extend_from_slice(&STF_IDENTIFIER),
            Record::Version { major, minor } => {
                self.write_u32(*major);
                self.write_u32(*minor);
            }
            Record::Comment { data } => {
                self.write_u32(u32::try_from(data.len())?);
                self.scratch.extend_from_slice(data.as_bytes());
            }
            Record::Isa { isa } => self.write_u16(isa.id()),
            Record::InstIem { iem } => self.write_u16(iem.id()),
            Record::TraceInfo(info) => {
                self.scratch.extend_from_slice(&[
                    info.generator.id(),
                    info.major,
                    info.minor,
                    info.minor_minor,
                ]);
                self.write_u16(u16::try_from(info.comment.len())?);
                self.scratch.extend_from_slice(info.comment.as_bytes());
            }
            Record::TraceInfoFeature { features } => self.write_u64(features.bits()),
            Record::ProcessIdExt {
                hw_thread_id,
                pid,
                tid,
            } => {
                self.write_u32(*hw_thread_id);
                self.write_u32(*pid);
                self.write_u32(*tid);
            }
            Record::ForcePc { addr }
            | Record::InstPcTarget { addr }
            | Record::EventPcTarget { addr } => self.write_u64(*addr),
            Record::VlenConfig { vlen } => {
                ensure!(*vlen != 0, "VLEN_CONFIG record with a vlen of 0");
                self.write_u32(*vlen);
            }
            Record::IsaExtended { isa } => {
                self.write_u32(u32::try_from(isa.len())?);
                self.scratch.extend_from_slice(isa.as_bytes());
            }
            Record::EndHeader => {}
            Record::InstReg(reg) => self.write_inst_reg(reg)?,
            Record::InstReadyReg { reg } => self.write_u16(*reg),
            Record::PageTableWalk(walk) => {
                self.write_u64(walk.va);
                self.write_u64(walk.index);
                self.write_u32(walk.page_size);
                self.scratch.push(u8::try_from(walk.entries.len())?);
                for entry in &walk.entries {
                    self.write_u64(entry.pa);
                    self.write_u64(entry.pte);
                }
            }
            Record::InstMemAccess(access) => {
                self.write_u64(access.address);
                self.write_u16(access.size);
                self.write_u16(access.attr);
                self.scratch.push(access.access.id());
            }
            Record::InstMemContent { data } | Record::BusMasterContent { data } => {
                self.write_u64(*data)
            }
            Record::BusMasterAccess(access) => {
                self.write_u64(access.address);
                self.write_u16(access.size);
                self.scratch.extend_from_slice(&[access.src_type.id(), access.src_idx]);
                self.write_u32(access.attr);
                self.scratch.push(access.access.id());
            }
            Record::Event { event, content } => {
                if self.state.event32() {
                    self.write_u32(event.to_event32());
                } else {
                    self.write_u64(event.code());
                }
                self.scratch.push(u8::try_from(content.len())?);
                for word in content {
                    self.write_u64(*word);
                }
            }
            Record::InstMicroop { size, microop } => {
                self.scratch.push(*size);
                self.write_u32(*microop);
            }
            Record::InstOpcode32 { opcode, .. } => self.write_u32(*opcode),
            Record::InstOpcode16 { opcode, .. } => self.write_u16(*opcode),
        }

        self.output.write_all(&self.scratch)?;
        self.state.track(record);

        Ok(())
    }

    fn write_inst_reg(&mut self, reg: &InstReg) -> Result<(), Error> {
        if reg.reg.is_vector() {
            let Some(vlen) = self.state.vlen() else {
                bail!("Attempted to write a vector register before VLEN_CONFIG");
            };
            ensure!(
                reg.data.len() == vector_words(vlen),
                "Vector register {} holds {} words, but vlen {vlen} requires {}",
                reg.reg,
                reg.data.len(),
                vector_words(vlen)
            );
        } else {
            ensure!(
                reg.data.len() == 1,
                "Scalar register {} must hold exactly one word",
                reg.reg
            );
        }

        self.write_u16(reg.reg.num());
        self.scratch.push(reg.reg.metadata(reg.operand));
        for word in &reg.data {
            self.write_u64(*word);
        }

        Ok(())
    }

    fn write_u16(&mut self, value: u16) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.scratch.extend_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use rand_xoshiro::{
        Xoshiro256PlusPlus,
        rand_core::{RngCore, SeedableRng},
    };

    use super::RecordEncoder;
    use crate::{
        codec::parser::RecordParser,
        event::EventCode,
        features::TraceFeatures,
        records::{InstReg, MemAccess, MemAccessType, PageTableEntry, PageTableWalk, Record},
        registers::{OperandType, Reg},
    };

    /// Builds a pseudo-random instruction stream
    struct ExampleTraceBuilder {
        num_insts: usize,
        with_vectors: bool,
        with_32_bit_events: bool,
    }

    impl ExampleTraceBuilder {
        fn new(num_insts: usize) -> Self {
            Self {
                num_insts,
                with_vectors: false,
                with_32_bit_events: false,
            }
        }

        fn with_vectors(mut self) -> Self {
            self.with_vectors = true;
            self
        }

        fn with_32_bit_events(mut self) -> Self {
            self.with_32_bit_events = true;
            self
        }

        fn build(self) -> Vec<Record> {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
            let mut trace = Vec::new();

            let features = if self.with_32_bit_events {
                TraceFeatures::RV64
            } else {
                TraceFeatures::RV64 | TraceFeatures::EVENT64
            };
            trace.push(Record::TraceInfoFeature { features });
            trace.push(Record::ForcePc { addr: 0x1_0000 });
            if self.with_vectors {
                trace.push(Record::VlenConfig { vlen: 256 });
            }

            for _ in 0..self.num_insts {
                match rng.next_u32() % 6 {
                    0 => trace.push(Record::InstReg(InstReg::scalar(
                        Reg::gpr((rng.next_u32() % 32) as u16),
                        OperandType::Source,
                        rng.next_u64(),
                    ))),
                    1 => {
                        trace.push(Record::InstMemAccess(MemAccess::new(
                            rng.next_u64(),
                            8,
                            0,
                            MemAccessType::Write,
                        )));
                        trace.push(Record::InstMemContent {
                            data: rng.next_u64(),
                        });
                    }
                    2 => trace.push(Record::event(
                        EventCode::INT_MACHINE_TIMER,
                        vec![rng.next_u64()],
                    )),
                    3 => trace.push(Record::InstPcTarget {
                        addr: rng.next_u64() & !1,
                    }),
                    4 if self.with_vectors => trace.push(Record::InstReg(InstReg::new(
                        Reg::vector((rng.next_u32() % 32) as u16),
                        OperandType::Dest,
                        (0..4).map(|_| rng.next_u64()).collect(),
                    ))),
                    _ => trace.push(Record::PageTableWalk(PageTableWalk {
                        va: rng.next_u64(),
                        index: 0,
                        page_size: 4096,
                        entries: vec![PageTableEntry {
                            pa: rng.next_u64(),
                            pte: rng.next_u64(),
                        }],
                    })),
                }

                if rng.next_u32() % 2 == 0 {
                    trace.push(Record::opcode32(rng.next_u32()));
                } else {
                    trace.push(Record::opcode16(rng.next_u32() as u16));
                }
            }

            trace
        }
    }

    fn encode_all(trace: &[Record]) -> Result<Vec<u8>, Error> {
        let mut encoder = RecordEncoder::new(Vec::new());
        for record in trace {
            encoder.encode(record)?;
        }
        Ok(encoder.into_inner())
    }

    fn without_pcs(trace: Vec<Record>) -> Vec<Record> {
        trace
            .into_iter()
            .map(|record| match record {
                Record::InstOpcode32 { opcode, .. } => Record::opcode32(opcode),
                Record::InstOpcode16 { opcode, .. } => Record::opcode16(opcode),
                other => other,
            })
            .collect()
    }

    #[test]
    fn encode_and_reparse_random_traces() -> Result<(), Error> {
        for builder in [
            ExampleTraceBuilder::new(500),
            ExampleTraceBuilder::new(500).with_vectors(),
            ExampleTraceBuilder::new(500).with_32_bit_events(),
        ] {
            let trace = builder.build();
            let binary = encode_all(&trace)?;

            let parsed: Result<Vec<Record>, Error> = RecordParser::new(binary.as_slice()).collect();
            assert_eq!(without_pcs(parsed?), trace);
        }

        Ok(())
    }

    #[test]
    fn encode_32_bit_events() -> Result<(), Error> {
        let binary = encode_all(&[
            Record::TraceInfoFeature {
                features: TraceFeatures::RV64,
            },
            Record::event(EventCode::INT_MACHINE_TIMER, vec![]),
        ])?;

        assert_eq!(&binary[9..], &[100, 0x07, 0x00, 0x00, 0x80, 0x00]);

        Ok(())
    }

    #[test]
    fn encoded_opcodes_track_pcs() -> Result<(), Error> {
        let mut encoder = RecordEncoder::new(Vec::new());
        encoder.encode(&Record::ForcePc { addr: 0x2000 })?;
        encoder.encode(&Record::opcode32(0x13))?;
        encoder.encode(&Record::opcode16(0x1))?;
        assert_eq!(encoder.state().pc(), 0x2004);
        assert_eq!(encoder.state().next_pc(), 0x2006);
        assert_eq!(encoder.state().num_marker_records(), 2);

        Ok(())
    }

    #[test]
    fn fail_on_malformed_registers() {
        let mut encoder = RecordEncoder::new(Vec::new());
        encoder
            .encode(&Record::InstReg(InstReg::new(
                Reg::vector(1),
                OperandType::Source,
                vec![0; 2],
            )))
            .unwrap_err();

        encoder.encode(&Record::VlenConfig { vlen: 128 }).unwrap();
        encoder
            .encode(&Record::InstReg(InstReg::new(
                Reg::vector(1),
                OperandType::Source,
                vec![0; 3],
            )))
            .unwrap_err();
        encoder
            .encode(&Record::InstReg(InstReg::new(
                Reg::gpr(1),
                OperandType::Source,
                vec![],
            )))
            .unwrap_err();
        encoder.encode(&Record::VlenConfig { vlen: 0 }).unwrap_err();
    }

    #[test]
    fn rejected_records_leave_no_bytes() -> Result<(), Error> {
        let mut encoder = RecordEncoder::new(Vec::new());
        encoder.encode(&Record::ForcePc { addr: 0x1000 })?;
        let len = encoder.get_ref().len();

        encoder
            .encode(&Record::InstReg(InstReg::new(
                Reg::vector(1),
                OperandType::Source,
                vec![0; 2],
            )))
            .unwrap_err();
        encoder
            .encode(&Record::event(EventCode::USER_ECALL, vec![0; 256]))
            .unwrap_err();
        assert_eq!(encoder.get_ref().len(), len);
        assert_eq!(encoder.state().num_records(), 1);

        encoder.encode(&Record::opcode32(0x13))?;
        let parsed: Result<Vec<Record>, Error> =
            RecordParser::new(encoder.get_ref().as_slice()).collect();
        assert_eq!(
            parsed?,
            [
                Record::ForcePc { addr: 0x1000 },
                Record::InstOpcode32 {
                    opcode: 0x13,
                    pc: 0x1000
                }
            ]
        );

        Ok(())
    }
}
