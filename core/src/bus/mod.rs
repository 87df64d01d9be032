//! Register and DMA memory access for the TRM-S1040

pub mod testbus;

use serde::{Deserialize, Serialize};

use crate::trm::sg::SgEntry;

/// PCI bus address as seen by the controller's DMA engine
pub type Address = u32;

/// Controller registers, as mapped in the S1040 I/O space.
///
/// Several offsets have a different meaning for reads and writes; those
/// are separate variants here.
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, strum::IntoStaticStr, Serialize, Deserialize,
)]
pub enum TrmReg {
    /// (r) SCSI status (80)
    ScsiStatus,
    /// (w) SCSI control (80)
    ScsiControl,
    /// (r) SCSI FIFO count (82)
    ScsiFifoCnt,
    /// (r) SCSI interrupt status, clears on read (84)
    ScsiIntStatus,
    /// (w) Synchronous offset (84)
    ScsiOffset,
    /// Synchronous control (85)
    ScsiSync,
    /// Target ID (86)
    ScsiTargetId,
    /// (r) Identify message of a reselecting target (87)
    ScsiIdMsg,
    /// (w) Host ID (87)
    ScsiHostId,
    /// SCSI transfer counter (88)
    ScsiXCnt,
    /// SCSI interrupt enable (8C)
    ScsiIntEn,
    /// SCSI configuration 0 (8D)
    ScsiConfig0,
    /// SCSI configuration 1 (8E)
    ScsiConfig1,
    /// SCSI command (90)
    ScsiCommand,
    /// Selection timeout (91)
    ScsiTimeout,
    /// SCSI FIFO (98)
    ScsiFifo,
    /// DMA command (A0)
    DmaCommand,
    /// (w) DMA control (A1)
    DmaControl,
    /// (r) DMA FIFO status (A2)
    DmaFifoStatus,
    /// (r) DMA status (A3)
    DmaStatus,
    /// DMA interrupt enable (A4)
    DmaIntEn,
    /// DMA configuration (A6)
    DmaConfig,
    /// DMA transfer counter (A8)
    DmaXCnt,
    /// DMA low address (B0)
    DmaXLowAddr,
    /// DMA high address (B4)
    DmaXHighAddr,
    /// General control (D4)
    GenControl,
    /// (r) General status (D5)
    GenStatus,
}

impl TrmReg {
    /// Offset in the controller's I/O space
    pub const fn offset(self) -> u8 {
        match self {
            Self::ScsiStatus | Self::ScsiControl => 0x80,
            Self::ScsiFifoCnt => 0x82,
            Self::ScsiIntStatus | Self::ScsiOffset => 0x84,
            Self::ScsiSync => 0x85,
            Self::ScsiTargetId => 0x86,
            Self::ScsiIdMsg | Self::ScsiHostId => 0x87,
            Self::ScsiXCnt => 0x88,
            Self::ScsiIntEn => 0x8C,
            Self::ScsiConfig0 => 0x8D,
            Self::ScsiConfig1 => 0x8E,
            Self::ScsiCommand => 0x90,
            Self::ScsiTimeout => 0x91,
            Self::ScsiFifo => 0x98,
            Self::DmaCommand => 0xA0,
            Self::DmaControl => 0xA1,
            Self::DmaFifoStatus => 0xA2,
            Self::DmaStatus => 0xA3,
            Self::DmaIntEn => 0xA4,
            Self::DmaConfig => 0xA6,
            Self::DmaXCnt => 0xA8,
            Self::DmaXLowAddr => 0xB0,
            Self::DmaXHighAddr => 0xB4,
            Self::GenControl => 0xD4,
            Self::GenStatus => 0xD5,
        }
    }

    /// Access width in bytes
    pub const fn width(self) -> usize {
        match self {
            Self::ScsiStatus | Self::ScsiControl | Self::DmaCommand | Self::DmaConfig => 2,
            Self::ScsiXCnt | Self::DmaXCnt | Self::DmaXLowAddr | Self::DmaXHighAddr => 4,
            _ => 1,
        }
    }
}

/// Register access to a controller instance.
///
/// Writes must be visible to the controller before the next read of a
/// register that depends on them.
pub trait RegisterIo {
    fn read(&mut self, reg: TrmReg) -> u32;
    fn write(&mut self, reg: TrmReg, val: u32);

    /// Pushes a sequence of bytes into a byte-wide register (the FIFO)
    fn write_multi(&mut self, reg: TrmReg, data: &[u8]) {
        for &b in data {
            self.write(reg, b.into());
        }
    }
}

/// Host memory shared with the controller's DMA engine
pub trait DmaMemory {
    /// Makes a scatter-gather table visible to the controller at `addr`
    fn publish_sg_table(&mut self, addr: Address, entries: &[SgEntry]);

    /// Reads back memory the controller has written to
    fn read_dma(&mut self, addr: Address, buf: &mut [u8]);
}
