//! TRM-S1040 register layouts and command opcodes

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

bitfield! {
    /// SCSI status register (read side of 80h)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScsiStatus(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Current bus phase (MSG/CD/IO)
        pub phase: u8 @ 0..=2,
        pub parity_error: bool @ 3,
        pub phase_mismatch: bool @ 4,
        pub sequencer_active: bool @ 5,
        pub command_abort: bool @ 6,
        /// Interrupt pending, interrupt status register is valid
        pub scsi_interrupt: bool @ 7,
        /// Transfer counter reached zero
        pub xfercnt_zero: bool @ 8,
        /// Transfer finished, FIFO drained
        pub xfer_done: bool @ 11,
        pub command_phase_done: bool @ 13,
    }
}

bitfield! {
    /// SCSI interrupt status (read side of 84h)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct IntStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub cmd_done: bool @ 0,
        pub bus_service: bool @ 1,
        pub scsi_reset: bool @ 2,
        pub reselected: bool @ 3,
        pub disconnect: bool @ 4,
        pub sel_timeout: bool @ 5,
        pub select: bool @ 6,
        pub scam: bool @ 7,
    }
}

bitfield! {
    /// Synchronous control register (85h)
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SyncCtl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Index into the clock period table
        pub period_index: u8 @ 0..=2,
        pub alt_sync: bool @ 3,
        pub wide: bool @ 4,
        pub lvds: bool @ 5,
    }
}

bitfield! {
    /// SCSI FIFO count register (82h)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FifoCnt(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// Bytes, or words on a wide transfer
        pub count: u8 @ 0..=4,
        pub empty: bool @ 6,
    }
}

bitfield! {
    /// DMA status register (A3h)
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DmaStatus(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub xfer_error: bool @ 0,
        pub xfer_complete: bool @ 1,
        pub scsi_interrupt: bool @ 4,
    }
}

/// SCSI control register bits (write side of 80h)
pub const DO_HWRESELECT: u32 = 0x0001;
pub const DO_DATALATCH: u32 = 0x0002;
pub const DO_CLRFIFO: u32 = 0x0004;
pub const DO_RSTSCSI: u32 = 0x0008;
pub const DO_RSTMODULE: u32 = 0x0010;
pub const DO_CMDABORT: u32 = 0x0100;
pub const DO_SETATN: u32 = 0x0200;
pub const DO_CLRATN: u32 = 0x0400;

/// DMA control register bits (A1h)
pub const STARTDMAXFER: u32 = 0x01;
pub const CLRXFIFO: u32 = 0x02;
pub const ABORTXFER: u32 = 0x04;
pub const STOPDMAXFER: u32 = 0x08;

/// DMA command register bits (A0h)
pub const XFERDATAIN: u32 = 0x01;
pub const SGXFER: u32 = 0x02;

/// DMA FIFO status (A2h)
pub const DMA_FIFO_EMPTY: u32 = 0x80;

/// SCSI interrupt enable (8Ch)
pub const EN_CMDDONE: u32 = 0x01;
pub const EN_BUSSERVICE: u32 = 0x02;
pub const EN_SCSIRESET: u32 = 0x04;
pub const EN_RESELECTED: u32 = 0x08;
pub const EN_DISCONNECT: u32 = 0x10;
pub const EN_SELTIMEOUT: u32 = 0x20;

/// DMA interrupt enable (A4h)
pub const EN_SCSIINTR: u32 = 0x01;

/// SCSI configuration 0 (8Dh)
pub const BLOCKRST: u32 = 0x01;
pub const PARITYCHECK: u32 = 0x08;
pub const INITIATOR: u32 = 0x20;
pub const PHASELATCH: u32 = 0x40;

/// SCSI configuration 1 (8Eh)
pub const ACTIVE_NEGPLUS: u32 = 0x02;

/// DMA configuration (A6h)
pub const DMA_ENHANCE: u32 = 0x8000;

/// General control (D4h)
pub const EN_LED: u32 = 0x80;

/// General status (D5h)
pub const WIDESCSI: u32 = 0x20;

/// Selection timeout register value for 250ms
pub const SEL_TIMEOUT_250MS: u32 = 153;

/// Opcodes accepted by the SCSI command register (90h)
#[allow(non_camel_case_types)]
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, strum::IntoStaticStr,
)]
pub enum ScsiCommand {
    /// Initiator command complete sequence (status + message)
    Comp = 0x12,
    /// Select with ATN, send IDENTIFY and CDB
    SelAtn = 0x60,
    /// Select with ATN, send IDENTIFY, queue tag and CDB
    SelAtn3 = 0x64,
    /// Select with ATN and stop after selection
    SelAtnStop = 0xB8,
    FifoOut = 0xC0,
    DmaOut = 0xC1,
    FifoIn = 0xC2,
    DmaIn = 0xC3,
    /// Release ACK on a received message byte
    MsgAccept = 0xD8,
}

/// Synchronous transfer periods selectable by the period index, in 4ns units
pub const CLOCK_PERIOD: [u8; 8] = [13, 18, 25, 31, 37, 43, 50, 62];
