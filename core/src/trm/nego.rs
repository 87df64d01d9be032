//! Wide and synchronous transfer negotiation (WDTR/SDTR)

use log::*;

use super::dcb::Dcb;
use super::regs::{CLOCK_PERIOD, SyncCtl};
use crate::scsi::msg;

/// REQ/ACK offset offered in SDTR
pub const SYNC_NEGO_OFFSET: u8 = 15;

pub fn wdtr(width: u8) -> [u8; 4] {
    [msg::EXTENDED, msg::EXT_WDTR_LEN, msg::EXT_WDTR, width]
}

pub fn sdtr(period: u8, offset: u8) -> [u8; 5] {
    [msg::EXTENDED, msg::EXT_SDTR_LEN, msg::EXT_SDTR, period, offset]
}

/// Smallest supported period not shorter than the one requested
pub fn period_index(period: u8) -> u8 {
    CLOCK_PERIOD[..7]
        .iter()
        .position(|&p| period <= p)
        .unwrap_or(7) as u8
}

/// Transfer rate in units of 10kB/s
pub fn rate(index: u8, wide: bool) -> u32 {
    let r = 100_000 / (u32::from(CLOCK_PERIOD[usize::from(index & 7)]) * 4);
    if wide { r * 2 } else { r }
}

/// Target's answer to a WDTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdtrReply {
    Narrow,
    Wide,
    /// 32-bit transfers asked for, counter with 16-bit
    TooWide,
    Malformed,
}

/// Target's answer to an SDTR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdtrReply {
    Async,
    Sync { period: u8, offset: u8 },
    Malformed,
}

/// Decodes a complete extended WDTR message
pub fn parse_wdtr(m: &[u8]) -> WdtrReply {
    if m.len() != 4 || m[1] != msg::EXT_WDTR_LEN {
        return WdtrReply::Malformed;
    }
    match m[3] {
        msg::WDTR_BUS_8_BIT => WdtrReply::Narrow,
        msg::WDTR_BUS_16_BIT => WdtrReply::Wide,
        msg::WDTR_BUS_32_BIT => WdtrReply::TooWide,
        _ => WdtrReply::Malformed,
    }
}

/// Decodes a complete extended SDTR message
pub fn parse_sdtr(m: &[u8]) -> SdtrReply {
    if m.len() != 5 || m[1] != msg::EXT_SDTR_LEN {
        return SdtrReply::Malformed;
    }
    if m[3] == 0 || m[4] == 0 {
        SdtrReply::Async
    } else {
        SdtrReply::Sync {
            period: m[3],
            offset: m[4],
        }
    }
}

impl Dcb {
    /// Records the outcome of wide negotiation.
    ///
    /// Any sync agreement is void after a width change.
    pub(crate) fn wide_settled(&mut self, wide: bool) {
        self.mode.set_wide_nego_done(true);
        self.mode.set_wide_nego_enable(false);
        self.mode.set_sync_nego_done(false);
        self.synctl = SyncCtl::default().with_wide(wide);
        self.offset = 0;
    }

    /// Target rejected WDTR: stay narrow for good
    pub(crate) fn wide_rejected(&mut self) {
        self.wide_settled(false);
    }

    /// Target rejected SDTR or asked for async: never try sync again
    pub(crate) fn sync_disabled(&mut self) {
        self.mode.set_sync_nego_enable(false);
        self.mode.set_sync_nego_done(false);
        self.synctl = SyncCtl::default().with_wide(self.synctl.wide());
        self.offset = 0;
    }

    /// Applies an agreed synchronous period and offset
    pub(crate) fn sync_settled(&mut self, period: u8, offset: u8) {
        let index = period_index(period);
        self.mode.set_sync_nego_enable(true);
        self.mode.set_sync_nego_done(true);
        self.period = period;
        self.offset = offset.min(SYNC_NEGO_OFFSET);
        self.synctl = SyncCtl::default()
            .with_wide(self.synctl.wide())
            .with_period_index(index)
            .with_alt_sync(true);

        if self.id.lun == 0 {
            let r = rate(index, self.wide());
            info!(
                "Target {}: {} {}.{:02} MB/s, offset {}",
                self.id.target,
                if self.wide() { "16-bit" } else { "8-bit" },
                r / 100,
                r % 100,
                self.offset
            );
        }
    }

    /// Copies negotiated parameters from another LUN of the same target
    pub(crate) fn adopt_transfer(&mut self, from: &Self) {
        debug_assert_eq!(self.id.target, from.id.target);
        self.synctl = from.synctl;
        self.offset = from.offset;
        self.period = from.period;
        let tag_queuing = self.mode.tag_queuing();
        let atn_stop = self.mode.atn_stop();
        self.mode = from
            .mode
            .with_tag_queuing(tag_queuing)
            .with_atn_stop(atn_stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trm::config::TargetConfig;
    use crate::trm::dcb::DcbId;

    fn dcb() -> Dcb {
        Dcb::new(
            DcbId { target: 0, lun: 0 },
            &TargetConfig::default(),
            true,
            0,
        )
    }

    #[test]
    fn messages() {
        assert_eq!(wdtr(1), [0x01, 0x02, 0x03, 0x01]);
        assert_eq!(sdtr(12, 15), [0x01, 0x03, 0x01, 12, 15]);
    }

    #[test]
    fn period_mapping() {
        assert_eq!(period_index(10), 0);
        assert_eq!(period_index(13), 0);
        assert_eq!(period_index(14), 1);
        assert_eq!(period_index(25), 2);
        assert_eq!(period_index(50), 6);
        assert_eq!(period_index(51), 7);
        assert_eq!(period_index(200), 7);
    }

    #[test]
    fn rates() {
        // 25 * 4ns = 100ns = 10MB/s
        assert_eq!(rate(2, false), 1000);
        assert_eq!(rate(2, true), 2000);
    }

    #[test]
    fn wdtr_replies() {
        assert_eq!(parse_wdtr(&[1, 2, 3, 0]), WdtrReply::Narrow);
        assert_eq!(parse_wdtr(&[1, 2, 3, 1]), WdtrReply::Wide);
        assert_eq!(parse_wdtr(&[1, 2, 3, 2]), WdtrReply::TooWide);
        assert_eq!(parse_wdtr(&[1, 2, 3, 7]), WdtrReply::Malformed);
        assert_eq!(parse_wdtr(&[1, 3, 3, 1, 0]), WdtrReply::Malformed);
    }

    #[test]
    fn sdtr_replies() {
        assert_eq!(
            parse_sdtr(&[1, 3, 1, 25, 8]),
            SdtrReply::Sync {
                period: 25,
                offset: 8
            }
        );
        assert_eq!(parse_sdtr(&[1, 3, 1, 25, 0]), SdtrReply::Async);
        assert_eq!(parse_sdtr(&[1, 3, 1, 0, 8]), SdtrReply::Async);
        assert_eq!(parse_sdtr(&[1, 2, 1, 25]), SdtrReply::Malformed);
    }

    #[test]
    fn wide_then_sync() {
        let mut d = dcb();
        d.wide_settled(true);
        assert!(d.wide());
        assert!(d.mode.wide_nego_done());
        assert!(!d.mode.wide_nego_enable());
        d.sync_settled(25, 8);
        assert_eq!(d.synctl.0, 0x1A);
        assert_eq!(d.offset, 8);
        assert!(!d.nego_pending());
    }

    #[test]
    fn width_change_voids_sync() {
        let mut d = dcb();
        d.sync_settled(25, 8);
        d.wide_settled(true);
        assert_eq!(d.offset, 0);
        assert_eq!(d.synctl.period_index(), 0);
        assert!(!d.mode.sync_nego_done());
    }

    #[test]
    fn async_keeps_width() {
        let mut d = dcb();
        d.wide_settled(true);
        d.sync_disabled();
        assert!(d.wide());
        assert_eq!(d.offset, 0);
        assert!(!d.mode.sync_nego_enable());
        assert!(!d.nego_pending());
    }

    #[test]
    fn offset_capped() {
        let mut d = dcb();
        d.sync_settled(12, 31);
        assert_eq!(d.offset, SYNC_NEGO_OFFSET);
    }

    #[test]
    fn idempotent() {
        let run = |d: &mut Dcb| {
            d.wide_settled(true);
            d.sync_settled(18, 12);
            (d.synctl, d.offset, d.period, d.mode)
        };
        let mut d = dcb();
        let first = run(&mut d);
        // Same reply again without a reset
        let again = run(&mut d);
        assert_eq!(first, again);
        // And after renegotiating from scratch
        d.load_defaults(&TargetConfig::default(), true, 0);
        let after_reset = run(&mut d);
        assert_eq!(first, after_reset);
    }

    #[test]
    fn other_lun_adopts() {
        let mut lun0 = dcb();
        lun0.wide_settled(true);
        lun0.sync_settled(25, 8);
        let mut lun1 = Dcb::new(
            DcbId { target: 0, lun: 1 },
            &TargetConfig::default(),
            true,
            8,
        );
        lun1.mode.set_tag_queuing(true);
        lun1.adopt_transfer(&lun0);
        assert_eq!(lun1.synctl, lun0.synctl);
        assert_eq!(lun1.offset, 8);
        assert!(lun1.mode.tag_queuing());
        assert!(!lun1.nego_pending());
    }
}
