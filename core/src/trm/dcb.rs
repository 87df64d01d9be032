//! Device control blocks: per target/LUN transfer parameters and queues

use std::collections::VecDeque;

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use super::TrmError;
use super::config::{MAX_TAGS, TargetConfig, ntc};
use super::regs::{CLOCK_PERIOD, SyncCtl};
use super::srb::SrbHandle;
use crate::scsi::msg;

/// Addresses a logical unit
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DcbId {
    pub target: u8,
    pub lun: u8,
}

impl std::fmt::Display for DcbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target, self.lun)
    }
}

bitfield! {
    /// Negotiation and queuing mode
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DcbMode(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub sync_nego_enable: bool @ 0,
        pub sync_nego_done: bool @ 1,
        pub wide_nego_enable: bool @ 2,
        pub wide_nego_done: bool @ 3,
        pub tag_queuing: bool @ 4,
        pub atn_stop: bool @ 5,
    }
}

#[derive(Debug)]
pub struct Dcb {
    pub(crate) id: DcbId,
    /// Submitted, not yet given to the chip
    pub(crate) waiting: VecDeque<SrbHandle>,
    /// Issued to the target (connected or disconnected)
    pub(crate) active: VecDeque<SrbHandle>,
    /// Last SRB that held the bus for this DCB
    pub(crate) actsrb: Option<SrbHandle>,
    pub(crate) maxcmd: usize,
    /// One bit per tag slot held by an active SRB
    pub(crate) tagmask: u32,
    /// Target config0 from NVRAM
    pub(crate) tacfg: u8,
    pub(crate) idmsg: u8,
    /// Period factor offered in SDTR, agreed period afterwards
    pub(crate) period: u8,
    pub(crate) synctl: SyncCtl,
    pub(crate) offset: u8,
    pub(crate) mode: DcbMode,
    /// Peripheral device type from INQUIRY
    pub(crate) dev_type: Option<u8>,
    /// Device presence not established yet
    pub(crate) scanning: bool,
    /// ABORT requested by the midlayer
    pub(crate) abort_dev: bool,
}

impl Dcb {
    pub fn new(id: DcbId, cfg: &TargetConfig, wide_card: bool, cur_offset: u8) -> Self {
        let mut dcb = Self {
            id,
            waiting: VecDeque::new(),
            active: VecDeque::new(),
            actsrb: None,
            maxcmd: 1,
            tagmask: 0,
            tacfg: 0,
            idmsg: 0,
            period: 0,
            synctl: SyncCtl::default(),
            offset: 0,
            mode: DcbMode::default(),
            dev_type: None,
            scanning: true,
            abort_dev: false,
        };
        dcb.load_defaults(cfg, wide_card, cur_offset);
        dcb
    }

    /// Forgets negotiated parameters and reloads the NVRAM settings.
    ///
    /// Tag queuing survives, it reflects device capability.
    pub(crate) fn load_defaults(&mut self, cfg: &TargetConfig, wide_card: bool, cur_offset: u8) {
        self.tacfg = cfg.config0;
        self.idmsg = msg::identify(self.id.lun, self.tacfg & ntc::DO_DISCONNECT != 0);
        self.period = CLOCK_PERIOD[usize::from(cfg.period & 7)];
        self.synctl = SyncCtl::default();
        self.offset = 0;

        let sync = self.tacfg & ntc::DO_SYNC_NEGO != 0 && (self.id.lun == 0 || cur_offset > 0);
        let wide = self.tacfg & ntc::DO_WIDE_NEGO != 0 && wide_card;
        self.mode = DcbMode::default()
            .with_tag_queuing(self.mode.tag_queuing())
            .with_atn_stop(self.mode.atn_stop())
            .with_sync_nego_enable(sync)
            .with_wide_nego_enable(wide);
    }

    pub fn id(&self) -> DcbId {
        self.id
    }

    pub fn maxcmd(&self) -> usize {
        self.maxcmd
    }

    pub fn tagmask(&self) -> u32 {
        self.tagmask
    }

    pub fn mode(&self) -> DcbMode {
        self.mode
    }

    pub fn synctl(&self) -> SyncCtl {
        self.synctl
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn period(&self) -> u8 {
        self.period
    }

    pub fn waiting(&self) -> &VecDeque<SrbHandle> {
        &self.waiting
    }

    pub fn active(&self) -> &VecDeque<SrbHandle> {
        &self.active
    }

    pub fn wide(&self) -> bool {
        self.synctl.wide()
    }

    /// A negotiation still has to run before data can move at full speed
    pub fn nego_pending(&self) -> bool {
        (self.mode.wide_nego_enable() && !self.mode.wide_nego_done())
            || (self.mode.sync_nego_enable() && !self.mode.sync_nego_done())
    }

    pub(crate) fn at_limit(&self) -> bool {
        self.active.len() >= self.maxcmd
    }

    /// Claims the lowest free tag
    pub(crate) fn alloc_tag(&mut self) -> Result<u8, TrmError> {
        let tag = (!self.tagmask).trailing_zeros() as usize;
        if tag >= MAX_TAGS {
            return Err(TrmError::NoFreeTag(self.id));
        }
        self.tagmask |= 1 << tag;
        Ok(tag as u8)
    }

    pub(crate) fn release_tag(&mut self, tag: u8) {
        debug_assert!(self.tagmask & (1 << tag) != 0);
        self.tagmask &= !(1 << tag);
    }

    pub(crate) fn remove_active(&mut self, h: SrbHandle) -> bool {
        if let Some(pos) = self.active.iter().position(|&a| a == h) {
            self.active.remove(pos);
            if self.actsrb == Some(h) {
                self.actsrb = None;
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn remove_waiting(&mut self, h: SrbHandle) -> bool {
        if let Some(pos) = self.waiting.iter().position(|&a| a == h) {
            self.waiting.remove(pos);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dcb(lun: u8, config0: u8) -> Dcb {
        Dcb::new(
            DcbId { target: 2, lun },
            &TargetConfig { config0, period: 2 },
            true,
            0,
        )
    }

    #[test]
    fn defaults() {
        let d = dcb(0, 0x77);
        assert_eq!(d.maxcmd, 1);
        assert_eq!(d.idmsg, 0xC0);
        assert_eq!(d.period, 25);
        assert!(d.mode.sync_nego_enable());
        assert!(d.mode.wide_nego_enable());
        assert!(!d.mode.tag_queuing());
        assert!(d.nego_pending());
        assert!(d.scanning);
    }

    #[test]
    fn lun_sync_follows_lun0() {
        // No sync offset agreed on LUN 0 yet
        let d = dcb(1, 0x77);
        assert!(!d.mode.sync_nego_enable());
        assert_eq!(d.idmsg, 0xC1);

        let d = Dcb::new(
            DcbId { target: 2, lun: 1 },
            &TargetConfig::default(),
            false,
            15,
        );
        assert!(d.mode.sync_nego_enable());
        assert!(!d.mode.wide_nego_enable());
    }

    #[test]
    fn no_disconnect() {
        let d = dcb(0, ntc::DO_SYNC_NEGO);
        assert_eq!(d.idmsg, 0x80);
        assert!(!d.mode.wide_nego_enable());
    }

    #[test]
    fn tags_lowest_first() {
        let mut d = dcb(0, 0x77);
        assert_eq!(d.alloc_tag().unwrap(), 0);
        assert_eq!(d.alloc_tag().unwrap(), 1);
        assert_eq!(d.alloc_tag().unwrap(), 2);
        d.release_tag(1);
        assert_eq!(d.tagmask, 0b101);
        assert_eq!(d.alloc_tag().unwrap(), 1);
        assert_eq!(d.alloc_tag().unwrap(), 3);
        assert_eq!(d.tagmask.count_ones(), 4);
    }

    #[test]
    fn tags_exhausted() {
        let mut d = dcb(0, 0x77);
        for i in 0..32 {
            assert_eq!(d.alloc_tag().unwrap(), i);
        }
        assert!(matches!(d.alloc_tag(), Err(TrmError::NoFreeTag(_))));
    }

    #[test]
    fn defaults_keep_tagging() {
        let mut d = dcb(0, 0x77);
        d.mode.set_tag_queuing(true);
        d.mode.set_wide_nego_done(true);
        d.offset = 15;
        d.load_defaults(&TargetConfig::default(), true, 0);
        assert!(d.mode.tag_queuing());
        assert!(!d.mode.wide_nego_done());
        assert_eq!(d.offset, 0);
        assert_eq!(d.period, 13);
    }
}
