//! Commands exchanged with the SCSI midlayer

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use super::sg::SgEntry;
use crate::bus::Address;
use crate::tickable::Ticks;

/// A command submitted by the midlayer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xfer {
    /// Midlayer handle, echoed back in the completion
    pub id: u64,
    pub target: u8,
    pub lun: u8,
    pub cdb: Vec<u8>,
    /// DMA-mapped data buffer
    #[serde(default)]
    pub sg: Vec<SgEntry>,
    #[serde(default)]
    pub datalen: u32,
    /// Bus address of a sense buffer for auto request-sense
    #[serde(default)]
    pub sense_addr: Option<Address>,
    /// Watchdog timeout; none if the midlayer polls for completion itself
    #[serde(default)]
    pub timeout: Option<Ticks>,
    /// Reset the SCSI bus instead of running a command
    #[serde(default)]
    pub reset: bool,
}

impl Xfer {
    pub fn new(id: u64, target: u8, lun: u8, cdb: &[u8]) -> Self {
        Self {
            id,
            target,
            lun,
            cdb: cdb.to_vec(),
            sg: vec![],
            datalen: 0,
            sense_addr: None,
            timeout: None,
            reset: false,
        }
    }

    /// Midlayer request to reset the bus
    pub fn bus_reset(id: u64) -> Self {
        Self {
            reset: true,
            ..Self::new(id, 0, 0, &[])
        }
    }

    /// Attaches a data buffer. A list covering more than 4 GiB saturates
    /// `datalen`, which submission rejects as too large.
    pub fn with_data(mut self, sg: &[SgEntry]) -> Self {
        let total = sg.iter().map(|e| u64::from(e.length)).sum::<u64>();
        self.datalen = u32::try_from(total).unwrap_or(u32::MAX);
        self.sg = sg.to_vec();
        self
    }

    pub fn with_sense(mut self, addr: Address) -> Self {
        self.sense_addr = Some(addr);
        self
    }

    pub fn with_timeout(mut self, timeout: Ticks) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome classes reported to the midlayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, Serialize, Deserialize)]
pub enum XferError {
    NoError,
    /// Check condition, sense data attached
    Sense,
    SelTimeout,
    Timeout,
    Busy,
    DriverStuffup,
    ResourceShortage,
    /// Completed by a bus reset requested by the midlayer
    Reset,
    /// Killed by an ABORT message
    Aborted,
}

/// Adapter status codes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    FromPrimitive,
    ToPrimitive,
    strum::IntoStaticStr,
    Serialize,
    Deserialize,
)]
pub enum HostStatus {
    #[default]
    Good = 0x00,
    SelTimeout = 0x11,
    OverUnderRun = 0x12,
    UnexpectedBusFree = 0x13,
    TargetPhaseFailure = 0x14,
    InvalidCcbOp = 0x16,
    DuplicateCcb = 0x19,
    BadCcbOrSg = 0x1A,
    Abort = 0xFF,
}

/// Final report for a submitted command, delivered exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub id: u64,
    pub target: u8,
    pub lun: u8,
    pub error: XferError,
    pub host_status: HostStatus,
    /// SCSI status byte returned by the target
    pub status: u8,
    /// Sense data, when `error` is [`XferError::Sense`]
    pub sense: Option<Vec<u8>>,
    /// Bytes not transferred
    pub resid: u32,
}

impl Completion {
    pub(super) fn failed(xfer: &Xfer, error: XferError, host_status: HostStatus) -> Self {
        Self {
            id: xfer.id,
            target: xfer.target,
            lun: xfer.lun,
            error,
            host_status,
            status: 0,
            sense: None,
            resid: xfer.datalen,
        }
    }
}
