use std::collections::{HashMap, VecDeque};

use num_traits::FromPrimitive;

use super::{Address, DmaMemory, RegisterIo, TrmReg};
use crate::trm::regs::ScsiCommand;
use crate::trm::sg::SgEntry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub reg: TrmReg,
    pub access: Access,
    pub val: u32,
}

/// Scripted register file and DMA memory for driving the engine without
/// hardware.
///
/// Reads return the last value set with [`TestRegs::set`], except for the
/// SCSI FIFO (pops bytes queued with [`TestRegs::push_fifo`]) and the
/// interrupt status register, which clears itself and the pending
/// interrupt bit in the SCSI status register on read, as the chip does.
/// Writes never change what reads return; they are only traced.
#[derive(Default)]
pub struct TestRegs {
    regs: HashMap<TrmReg, u32>,
    fifo: VecDeque<u8>,
    pub mem: HashMap<Address, u8>,
    sg_tables: HashMap<Address, Vec<SgEntry>>,
    trace: Vec<TraceEntry>,
}

impl TestRegs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value subsequent reads of `reg` return
    pub fn set(&mut self, reg: TrmReg, val: u32) {
        self.regs.insert(reg, val);
    }

    pub fn push_fifo(&mut self, data: &[u8]) {
        self.fifo.extend(data);
    }

    pub fn fifo_pending(&self) -> usize {
        self.fifo.len()
    }

    pub fn load_mem(&mut self, addr: Address, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.mem.insert(addr + i as Address, b);
        }
    }

    /// Last scatter-gather table published at `addr`
    pub fn sg_table(&self, addr: Address) -> Option<&[SgEntry]> {
        self.sg_tables.get(&addr).map(Vec::as_slice)
    }

    pub fn reset_trace(&mut self) {
        self.trace.clear();
    }

    pub fn get_trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// All values written to `reg` since the last trace reset
    pub fn writes(&self, reg: TrmReg) -> Vec<u32> {
        self.trace
            .iter()
            .filter(|t| t.access == Access::Write && t.reg == reg)
            .map(|t| t.val)
            .collect()
    }

    /// Bytes pushed into the SCSI FIFO since the last trace reset
    pub fn fifo_writes(&self) -> Vec<u8> {
        self.writes(TrmReg::ScsiFifo)
            .into_iter()
            .map(|v| v as u8)
            .collect()
    }

    /// SCSI command opcodes issued since the last trace reset
    pub fn commands(&self) -> Vec<ScsiCommand> {
        self.writes(TrmReg::ScsiCommand)
            .into_iter()
            .filter_map(|v| ScsiCommand::from_u32(v))
            .collect()
    }

    pub fn last_command(&self) -> Option<ScsiCommand> {
        self.commands().last().copied()
    }

    /// True if any write to `reg` had all bits of `mask` set
    pub fn wrote_bits(&self, reg: TrmReg, mask: u32) -> bool {
        self.writes(reg).iter().any(|&v| v & mask == mask)
    }
}

impl RegisterIo for TestRegs {
    fn read(&mut self, reg: TrmReg) -> u32 {
        let val = match reg {
            TrmReg::ScsiFifo => self.fifo.pop_front().map_or(0, u32::from),
            TrmReg::ScsiIntStatus => {
                if let Some(status) = self.regs.get_mut(&TrmReg::ScsiStatus) {
                    *status &= !0x0080;
                }
                self.regs.remove(&reg).unwrap_or(0)
            }
            _ => self.regs.get(&reg).copied().unwrap_or(0),
        };
        self.trace.push(TraceEntry {
            reg,
            access: Access::Read,
            val,
        });
        val
    }

    fn write(&mut self, reg: TrmReg, val: u32) {
        self.trace.push(TraceEntry {
            reg,
            access: Access::Write,
            val,
        });
    }
}

impl DmaMemory for TestRegs {
    fn publish_sg_table(&mut self, addr: Address, entries: &[SgEntry]) {
        self.sg_tables.insert(addr, entries.to_vec());
    }

    fn read_dma(&mut self, addr: Address, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.mem.get(&(addr + i as Address)).copied().unwrap_or(0);
        }
    }
}
