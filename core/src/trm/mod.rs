//! Tekram TRM-S1040 initiator-mode protocol engine
//!
//! The engine is driven entirely from the outside: the glue calls
//! [`Adapter::submit`] for new commands, [`Adapter::interrupt`] when the
//! controller raises its interrupt line and [`Adapter::tick`] from a timer.
//! Every call takes `&mut self`, so one owner (an interrupt handler holding
//! a lock, or a single polling thread) serializes all state changes.
//! Completions leave through a channel.

pub mod config;
pub mod dcb;
pub mod nego;
pub mod phase;
mod recovery;
pub mod regs;
mod sched;
pub mod sg;
pub mod srb;
pub mod xfer;

use std::collections::HashMap;

use anyhow::Result;
use itertools::Itertools;
use log::*;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{DmaMemory, RegisterIo, TrmReg};
use crate::debuggable::{
    Debuggable, DebuggableProperties, DebuggableProperty, DebuggablePropertyValue,
};
use crate::tickable::{Tickable, Ticks};
use crate::types::{CompletionReceiver, CompletionSender};
use crate::{
    dbgprop_bool, dbgprop_byte, dbgprop_byte_bin, dbgprop_enum, dbgprop_group, dbgprop_header,
    dbgprop_long, dbgprop_string, dbgprop_udec,
};

use config::AdapterConfig;
use dcb::{Dcb, DcbId};
use regs::*;
use srb::{SrbHandle, SrbPool};
use xfer::Completion;

/// Logs every register access
const TRM_TRACE: bool = false;

/// Driver-internal errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrmError {
    #[error("Scatter-gather list too long ({0} entries)")]
    SgTooLong(usize),
    #[error("Scatter-gather list covers {sg} bytes, transfer is {datalen}")]
    SgLengthMismatch { sg: u64, datalen: u32 },
    #[error("Transfer too large ({0} bytes)")]
    XferTooLarge(u32),
    #[error("Invalid CDB {0:02X?}")]
    InvalidCdb(Vec<u8>),
    #[error("Invalid nexus {0}:{1}")]
    InvalidNexus(u8, u8),
    #[error("No free tag on {0}")]
    NoFreeTag(DcbId),
    #[error("Command {0} already queued on {1}")]
    DuplicateCommand(u64, DcbId),
}

bitfield! {
    /// Bus reset bookkeeping
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct AdapterFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        /// We pulled RST and wait for the reset interrupt
        pub reset_dev: bool @ 0,
        /// Somebody else reset the bus
        pub reset_detect: bool @ 1,
        pub reset_done: bool @ 2,
    }
}

/// Command currently connected to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nexus {
    /// None for a reselection by a target/LUN we never addressed
    pub dcb: Option<DcbId>,
    pub srb: SrbHandle,
}

pub struct Adapter<B: RegisterIo + DmaMemory> {
    bus: B,
    config: AdapterConfig,
    pub(crate) srbs: SrbPool,
    pub(crate) dcbs: HashMap<DcbId, Dcb>,
    /// DCBs in creation order, walked by the scheduler
    pub(crate) dcb_order: Vec<DcbId>,
    /// Next DCB to serve, taken modulo the length of `dcb_order`
    pub(crate) rr: usize,
    pub(crate) nexus: Option<Nexus>,
    pub(crate) flags: AdapterFlags,
    wide_card: bool,
    maxid: u8,
    /// Sync offset agreed with the last LUN 0 negotiated
    cur_offset: u8,
    clock: Ticks,
    done: CompletionSender,
}

impl<B: RegisterIo + DmaMemory> Adapter<B> {
    /// Brings up the controller and returns the adapter together with the
    /// receiving end of the completion channel.
    pub fn new(bus: B, config: AdapterConfig) -> Result<(Self, CompletionReceiver)> {
        config.validate()?;
        let (done, done_recv) = crossbeam_channel::unbounded();
        let mut adapter = Self {
            bus,
            srbs: SrbPool::new(config.sg_table_base),
            config,
            dcbs: HashMap::new(),
            dcb_order: vec![],
            rr: 0,
            nexus: None,
            flags: AdapterFlags::default(),
            wide_card: false,
            maxid: 7,
            cur_offset: 0,
            clock: 0,
            done,
        };
        adapter.init_chip();
        if adapter.config.reset_on_attach() {
            adapter.reset_bus();
        }
        Ok((adapter, done_recv))
    }

    fn init_chip(&mut self) {
        self.wide_card = self.read(TrmReg::GenStatus) & WIDESCSI != 0;
        self.maxid = if self.wide_card { 15 } else { 7 };

        let parity = if self.config.parity() { PARITYCHECK } else { 0 };
        self.write(TrmReg::ScsiConfig0, PHASELATCH | INITIATOR | BLOCKRST | parity);
        self.write(TrmReg::ScsiConfig1, ACTIVE_NEGPLUS);
        self.write(TrmReg::ScsiTimeout, SEL_TIMEOUT_250MS);
        self.write(TrmReg::ScsiHostId, self.config.scsi_id.into());
        self.write(TrmReg::ScsiOffset, 0);
        self.write(TrmReg::ScsiSync, 0);
        self.write(TrmReg::GenControl, 0);
        self.write(TrmReg::DmaConfig, DMA_ENHANCE);

        // Drop anything latched before we took over
        self.read(TrmReg::ScsiIntStatus);
        self.write(TrmReg::ScsiControl, DO_CLRFIFO);
        self.write(TrmReg::DmaControl, CLRXFIFO);
        self.enable_interrupts();

        info!(
            "TRM-S1040: {} bus, host ID {}, {} tags",
            if self.wide_card { "wide" } else { "narrow" },
            self.config.scsi_id,
            self.config.maxtag()
        );
    }

    pub(crate) fn enable_interrupts(&mut self) {
        self.write(
            TrmReg::ScsiIntEn,
            EN_SELTIMEOUT | EN_DISCONNECT | EN_RESELECTED | EN_SCSIRESET | EN_BUSSERVICE | EN_CMDDONE,
        );
        self.write(TrmReg::DmaIntEn, EN_SCSIINTR);
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn wide_card(&self) -> bool {
        self.wide_card
    }

    pub fn dcb(&self, target: u8, lun: u8) -> Option<&Dcb> {
        self.dcbs.get(&DcbId { target, lun })
    }

    pub fn srb(&self, h: SrbHandle) -> &srb::Srb {
        &self.srbs[h]
    }

    pub fn nexus(&self) -> Option<Nexus> {
        self.nexus
    }

    pub fn free_srbs(&self) -> usize {
        self.srbs.free_count()
    }

    pub fn flags(&self) -> AdapterFlags {
        self.flags
    }

    /// Scheduling is held off until a bus reset settles
    pub fn reset_in_progress(&self) -> bool {
        self.flags.reset_dev() || self.flags.reset_detect() || self.flags.reset_done()
    }

    pub(crate) fn read(&mut self, reg: TrmReg) -> u32 {
        let val = self.bus.read(reg);
        if TRM_TRACE {
            trace!("Read {:?}: {:X}", reg, val);
        }
        val
    }

    pub(crate) fn write(&mut self, reg: TrmReg, val: u32) {
        if TRM_TRACE {
            trace!("Write {:?}: {:X}", reg, val);
        }
        self.bus.write(reg, val);
    }

    pub(crate) fn write_fifo(&mut self, data: &[u8]) {
        if TRM_TRACE {
            trace!("FIFO out: {:02X?}", data);
        }
        self.bus.write_multi(TrmReg::ScsiFifo, data);
    }

    /// Programs the target's transfer parameters into the chip
    pub(crate) fn program_sync(&mut self, id: DcbId) {
        if let Some(dcb) = self.dcbs.get(&id) {
            let (synctl, offset) = (dcb.synctl.0, dcb.offset);
            self.write(TrmReg::ScsiSync, synctl.into());
            self.write(TrmReg::ScsiOffset, offset.into());
        }
    }

    /// Wide transfers active on the connected nexus
    pub(crate) fn nexus_wide(&self) -> bool {
        self.nexus
            .and_then(|n| n.dcb)
            .and_then(|id| self.dcbs.get(&id))
            .is_some_and(Dcb::wide)
    }

    /// Hands a finished command to the midlayer
    pub(crate) fn deliver(&self, c: Completion) {
        debug!(
            "Command {} on {}:{} done: {:?} status {:02X} resid {}",
            c.id, c.target, c.lun, c.error, c.status, c.resid
        );
        if let Err(e) = self.done.send(c) {
            error!("Completion dropped, midlayer gone: {}", e);
        }
    }

    /// Services a controller interrupt. Returns false if the controller
    /// had nothing pending (shared interrupt line).
    pub fn interrupt(&mut self) -> bool {
        let stat = ScsiStatus(self.read(TrmReg::ScsiStatus) as u16);
        if !stat.scsi_interrupt() {
            return false;
        }
        let intstat = IntStatus(self.read(TrmReg::ScsiIntStatus) as u8);
        trace!("Interrupt {:?} {:?}", stat, intstat);

        if intstat.sel_timeout() || intstat.disconnect() {
            self.disconnect(intstat);
        } else if intstat.reselected() {
            self.reselect();
        } else if intstat.scsi_reset() {
            self.reset_detect();
        } else if intstat.bus_service() || intstat.cmd_done() {
            self.service(stat);
        }
        true
    }
}

impl<B: RegisterIo + DmaMemory> Tickable for Adapter<B> {
    /// Advances the watchdog clock, timing out at most one expired command
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.clock += ticks;
        let now = self.clock;
        let expired = self
            .srbs
            .in_use()
            .filter(|&h| self.srbs[h].deadline.is_some_and(|d| d <= now))
            .min_by_key(|&h| self.srbs[h].deadline);
        if let Some(h) = expired {
            self.timeout(h);
        }
        Ok(ticks)
    }
}

impl<B: RegisterIo + DmaMemory> Debuggable for Adapter<B> {
    fn get_debug_properties(&self) -> DebuggableProperties {
        let mut result = vec![
            dbgprop_header!("Adapter"),
            dbgprop_byte!("Host ID", self.config.scsi_id),
            dbgprop_bool!("Wide", self.wide_card),
            dbgprop_udec!("Free SRBs", self.srbs.free_count()),
            dbgprop_byte_bin!("Reset flags", self.flags.0),
            dbgprop_string!(
                "Nexus",
                self.nexus.map_or_else(
                    || "-".to_string(),
                    |n| format!(
                        "{} SRB {}",
                        n.dcb.map_or_else(|| "?".to_string(), |d| d.to_string()),
                        n.srb.index()
                    )
                )
            ),
        ];
        for id in &self.dcb_order {
            let Some(dcb) = self.dcbs.get(id) else {
                continue;
            };
            let srbs = dcb
                .active
                .iter()
                .map(|&h| {
                    let srb = &self.srbs[h];
                    let state: &'static str = srb.state.into();
                    format!("{}:{}", srb.tag.unwrap_or(0), state)
                })
                .join(" ");
            result.push(dbgprop_group!(
                format!("DCB {}", id),
                vec![
                    dbgprop_byte_bin!("Mode", dcb.mode.0),
                    dbgprop_byte!("Sync", dcb.synctl.0),
                    dbgprop_udec!("Offset", dcb.offset),
                    dbgprop_udec!("Period", dcb.period),
                    dbgprop_udec!("Max commands", dcb.maxcmd),
                    dbgprop_long!("Tags", dcb.tagmask),
                    dbgprop_udec!("Waiting", dcb.waiting.len()),
                    dbgprop_string!("Active", srbs),
                    dbgprop_enum!(
                        "Phase",
                        dcb.actsrb.map_or(phase::Phase::BusFree, |h| self.srbs[h].phase)
                    ),
                ]
            ));
        }
        result
    }
}
