/// Reconstructs instruction PCs from FORCE_PC, PC target and opcode records
#[derive(Debug, Clone, Copy, Default)]
pub struct PcTracker {
    pc: u64,
    next_pc: u64,
    target: Option<u64>,
}

impl PcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_pc(&mut self, addr: u64) {
        self.next_pc = addr;
    }

    /// Records a pending branch target for the instruction currently being read
    pub fn branch_target(&mut self, addr: u64) {
        self.target = Some(addr);
    }

    /// Moves to the next instruction with an opcode of `size` bytes and
    /// returns its PC
    pub fn advance(&mut self, size: u64) -> u64 {
        self.pc = self.next_pc;
        self.next_pc = match self.target.take() {
            Some(target) => target,
            None => self.pc.wrapping_add(size),
        };
        self.pc
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn next_pc(&self) -> u64 {
        self.next_pc
    }
}
