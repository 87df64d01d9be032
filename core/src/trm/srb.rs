//! SCSI request blocks and their pool

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use arrayvec::ArrayVec;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use super::dcb::DcbId;
use super::phase::Phase;
use super::sg::{SG_TABLE_SIZE, SgList};
use super::xfer::{HostStatus, Xfer};
use crate::bus::Address;
use crate::scsi::{CMD_INQUIRY, CMD_REQUEST_SENSE};
use crate::tickable::Ticks;

/// Commands that can be outstanding on one adapter
pub const MAX_SRB: usize = 32;

/// Longest CDB the engine sends
pub const MAX_CDB_LEN: usize = 12;

/// Index of an SRB in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SrbHandle(u8);

impl SrbHandle {
    /// Reserved SRB for reselections that match no command, never handed out
    pub const SCRATCH: Self = Self(MAX_SRB as u8);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primary SRB state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::IntoStaticStr)]
pub enum SrbState {
    #[default]
    Free,
    Wait,
    Ready,
    /// Selection armed, IDENTIFY and CDB sent by the chip
    Start,
    /// Selected with ATN stop, negotiation goes out in the next message-out phase
    MsgOut,
    Command,
    DataXfer,
    Disconnect,
    Status,
    MsgIn,
    Completed,
}

bitfield! {
    /// Orthogonal SRB flags
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SrbFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// SDTR sent, reply outstanding
        pub do_sync_nego: bool @ 0,
        /// WDTR sent, reply outstanding
        pub do_wide_nego: bool @ 1,
        pub abort_sent: bool @ 2,
        /// Reselection could not be matched to a command
        pub unexpect_resel: bool @ 3,
        /// Pad transfer substituted for a data phase
        pub xferpad: bool @ 4,
        /// Collecting a multi-byte message
        pub extend_msgin: bool @ 5,
        /// Running REQUEST SENSE on behalf of the original command
        pub auto_reqsense: bool @ 6,
        /// IDENTIFY already went out on this connection
        pub identified: bool @ 7,
    }
}

bitfield! {
    /// Transfer error summary
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SrbStat(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub overrun: bool @ 2,
        pub parity_error: bool @ 4,
    }
}

/// Queue an SRB currently sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrbSlot {
    #[default]
    Free,
    Waiting(DcbId),
    Active(DcbId),
}

/// Original command, parked while auto request-sense runs
#[derive(Debug, Clone)]
pub struct SavedCommand {
    pub cdb: ArrayVec<u8, MAX_CDB_LEN>,
    pub sg: SgList,
    pub buflen: u32,
    pub transferred: u32,
}

#[derive(Debug, Default)]
pub struct Srb {
    pub(crate) slot: SrbSlot,
    pub(crate) xfer: Option<Xfer>,
    pub(crate) cdb: ArrayVec<u8, MAX_CDB_LEN>,
    pub(crate) sg: SgList,
    /// Untouched copy of the list for restarts
    pub(crate) sg_orig: SgList,
    pub(crate) saved: Option<SavedCommand>,
    /// Sense data captured by auto request-sense
    pub(crate) sense: Option<Vec<u8>>,
    /// Where this SRB's table lives in DMA memory
    pub(crate) sg_table_addr: Address,
    /// Bytes still to transfer
    pub(crate) buflen: u32,
    pub(crate) transferred: u32,
    pub(crate) state: SrbState,
    pub(crate) flags: SrbFlags,
    pub(crate) phase: Phase,
    pub(crate) host_status: HostStatus,
    pub(crate) target_status: u8,
    pub(crate) stat: SrbStat,
    /// Tag slot held in the DCB's tag mask
    pub(crate) tag: Option<u8>,
    pub(crate) retry: u8,
    pub(crate) msgin: ArrayVec<u8, 8>,
    pub(crate) msgout: ArrayVec<u8, 8>,
    pub(crate) deadline: Option<Ticks>,
}

impl Srb {
    pub fn state(&self) -> SrbState {
        self.state
    }

    pub fn slot(&self) -> SrbSlot {
        self.slot
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn sg(&self) -> &SgList {
        &self.sg
    }

    pub fn buflen(&self) -> u32 {
        self.buflen
    }

    pub fn transferred(&self) -> u32 {
        self.transferred
    }

    /// INQUIRY and REQUEST SENSE carry negotiation on a fresh device
    pub(crate) fn is_inquiry_like(&self) -> bool {
        self.flags.auto_reqsense()
            || matches!(self.cdb.first(), Some(&CMD_INQUIRY) | Some(&CMD_REQUEST_SENSE))
    }

    /// Drops per-connection state before (re)selection
    pub(crate) fn clear_connection(&mut self) {
        let auto_reqsense = self.flags.auto_reqsense();
        self.flags = SrbFlags::default().with_auto_reqsense(auto_reqsense);
        self.msgin.clear();
        self.msgout.clear();
        self.phase = Phase::BusFree;
    }

    /// Abandons a running auto request-sense and restores the original CDB
    pub(crate) fn abandon_sense(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.cdb = saved.cdb;
        }
        self.flags.set_auto_reqsense(false);
    }

    /// Rewinds the data pointers to the start of the buffer
    pub(crate) fn rewind(&mut self) {
        self.sg = self.sg_orig.clone();
        self.buflen = self.sg.total() as u32;
        self.transferred = 0;
        self.stat = SrbStat::default();
        self.host_status = HostStatus::Good;
        self.target_status = 0;
    }
}

/// Fixed pool of SRBs plus the scratch SRB
pub struct SrbPool {
    srbs: Vec<Srb>,
    free: VecDeque<SrbHandle>,
}

impl SrbPool {
    pub fn new(sg_table_base: Address) -> Self {
        let srbs = (0..=MAX_SRB)
            .map(|i| Srb {
                sg_table_addr: sg_table_base + (i as Address) * SG_TABLE_SIZE,
                ..Default::default()
            })
            .collect();
        Self {
            srbs,
            free: (0..MAX_SRB as u8).map(SrbHandle).collect(),
        }
    }

    pub fn alloc(&mut self) -> Option<SrbHandle> {
        let h = self.free.pop_front()?;
        let srb = &mut self.srbs[h.index()];
        debug_assert_eq!(srb.slot, SrbSlot::Free);
        *srb = Srb {
            sg_table_addr: srb.sg_table_addr,
            ..Default::default()
        };
        Some(h)
    }

    pub fn release(&mut self, h: SrbHandle) {
        debug_assert_ne!(h, SrbHandle::SCRATCH);
        let srb = &mut self.srbs[h.index()];
        if srb.slot == SrbSlot::Free && self.free.contains(&h) {
            log::error!("SRB {} released twice", h.index());
            return;
        }
        srb.slot = SrbSlot::Free;
        srb.state = SrbState::Free;
        srb.xfer = None;
        srb.deadline = None;
        self.free.push_back(h);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Prepares the scratch SRB for an unmatched or pending reselection
    pub fn take_scratch(&mut self) -> SrbHandle {
        let srb = &mut self.srbs[SrbHandle::SCRATCH.index()];
        *srb = Srb {
            sg_table_addr: srb.sg_table_addr,
            ..Default::default()
        };
        SrbHandle::SCRATCH
    }

    /// Handles of SRBs not in the free pool
    pub fn in_use(&self) -> impl Iterator<Item = SrbHandle> + '_ {
        (0..MAX_SRB as u8)
            .map(SrbHandle)
            .filter(|h| self.srbs[h.index()].slot != SrbSlot::Free)
    }
}

impl Index<SrbHandle> for SrbPool {
    type Output = Srb;

    fn index(&self, h: SrbHandle) -> &Srb {
        &self.srbs[h.index()]
    }
}

impl IndexMut<SrbHandle> for SrbPool {
    fn index_mut(&mut self, h: SrbHandle) -> &mut Srb {
        &mut self.srbs[h.index()]
    }
}
