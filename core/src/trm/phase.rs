//! Bus phase handling.
//!
//! A bus service interrupt is handled in two stages. Stage 0 closes out the
//! phase the connected SRB was in before the interrupt: residual accounting
//! for data phases, reading the status byte, parsing message bytes. Stage 1
//! then programs the controller for the phase the bus is in now and arms it
//! with a single SCSI command. Stage 0 may cut this short by accepting a
//! message, which leaves the SRB in bus-free until the target's next move.

use log::*;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use super::dcb::DcbId;
use super::nego::{self, SdtrReply, WdtrReply};
use super::regs::*;
use super::sg::{MAX_XFER_LEN, SgEntry, fifo_residue};
use super::srb::{SrbHandle, SrbState};
use super::xfer::HostStatus;
use super::{Adapter, Nexus};
use crate::bus::{Address, DmaMemory, RegisterIo, TrmReg};
use crate::scsi::msg;

/// SCSI bus phase as encoded in the MSG/CD/IO lines
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
pub enum Phase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    Reserved = 4,
    #[default]
    BusFree = 5,
    MsgOut = 6,
    MsgIn = 7,
}

impl Phase {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => Self::DataOut,
            1 => Self::DataIn,
            2 => Self::Command,
            3 => Self::Status,
            4 => Self::Reserved,
            5 => Self::BusFree,
            6 => Self::MsgOut,
            _ => Self::MsgIn,
        }
    }
}

/// Outcome of stage 0
#[derive(Debug)]
pub(super) enum Next {
    /// Program the controller for this phase
    Phase(Phase),
    /// Release ACK on the message byte just read
    Accept,
}

impl<B: RegisterIo + DmaMemory> Adapter<B> {
    /// Bus service or command done on the connected nexus
    pub(super) fn service(&mut self, stat: ScsiStatus) {
        let hw = Phase::from_bits(stat.phase());
        let Some(nexus) = self.nexus else {
            warn!("Bus service in phase {:?} without a connected command", hw);
            return;
        };
        if let Some(id) = nexus.dcb {
            self.check_abort(id, nexus.srb);
        }

        let prev = self.srbs[nexus.srb].phase;
        let next = self.phase0(prev, hw, nexus.srb, stat);

        // A tag message may have switched the nexus over to the real SRB
        let Some(Nexus { srb: h, .. }) = self.nexus else {
            return;
        };
        let cmd = match next {
            Next::Accept => {
                self.srbs[h].phase = Phase::BusFree;
                Some(ScsiCommand::MsgAccept)
            }
            Next::Phase(p) => {
                self.srbs[h].phase = p;
                self.phase1(p, h)
            }
        };
        if let Some(cmd) = cmd {
            self.arm(cmd);
        }
    }

    /// Starts the next controller sequence
    pub(crate) fn arm(&mut self, cmd: ScsiCommand) {
        self.write(TrmReg::ScsiControl, DO_DATALATCH);
        self.write(TrmReg::ScsiCommand, cmd as u32);
    }

    /// Queues a message for the next message-out phase and raises ATN
    pub(crate) fn queue_message(&mut self, h: SrbHandle, m: &[u8]) {
        let srb = &mut self.srbs[h];
        srb.msgout.clear();
        if srb.msgout.try_extend_from_slice(m).is_err() {
            error!("Message too long for SRB {}: {:02X?}", h.index(), m);
            return;
        }
        self.write(TrmReg::ScsiControl, DO_SETATN);
    }

    /// Pending abort request for the connected DCB
    fn check_abort(&mut self, id: DcbId, h: SrbHandle) {
        if h == SrbHandle::SCRATCH {
            return;
        }
        let abort_dev = self.dcbs.get(&id).is_some_and(|d| d.abort_dev);
        let srb = &self.srbs[h];
        if abort_dev && !srb.flags.abort_sent() && srb.msgout.is_empty() {
            debug!("Sending ABORT to {}", id);
            self.queue_message(h, &[msg::ABORT]);
        }
    }

    fn phase0(&mut self, prev: Phase, hw: Phase, h: SrbHandle, stat: ScsiStatus) -> Next {
        match prev {
            Phase::DataOut => return self.data_phase0(h, stat, true),
            Phase::DataIn => return self.data_phase0(h, stat, false),
            Phase::Status => {
                let status = self.read(TrmReg::ScsiFifo) as u8;
                let srb = &mut self.srbs[h];
                srb.target_status = status;
                srb.state = SrbState::Completed;
                return Next::Accept;
            }
            Phase::MsgIn => return self.msgin_phase0(h),
            Phase::MsgOut => {
                let flags = self.srbs[h].flags;
                if flags.unexpect_resel() || flags.abort_sent() {
                    return Next::Phase(Phase::BusFree);
                }
            }
            Phase::Command | Phase::Reserved | Phase::BusFree => (),
        }
        Next::Phase(hw)
    }

    fn phase1(&mut self, phase: Phase, h: SrbHandle) -> Option<ScsiCommand> {
        match phase {
            Phase::DataOut => Some(self.data_phase1(h, true)),
            Phase::DataIn => Some(self.data_phase1(h, false)),
            Phase::Command => {
                self.write(TrmReg::ScsiControl, DO_CLRATN | DO_CLRFIFO);
                let cdb = self.srbs[h].cdb.clone();
                self.write_fifo(&cdb);
                self.srbs[h].state = SrbState::Command;
                Some(ScsiCommand::FifoOut)
            }
            Phase::Status => Some(self.status_phase1(h)),
            Phase::MsgOut => Some(self.msgout_phase1(h)),
            Phase::MsgIn => {
                self.write(TrmReg::ScsiControl, DO_CLRFIFO);
                self.write(TrmReg::ScsiXCnt, 1);
                let srb = &mut self.srbs[h];
                if !matches!(
                    srb.state,
                    SrbState::MsgIn | SrbState::Disconnect | SrbState::Completed
                ) {
                    srb.state = SrbState::MsgIn;
                    srb.flags.set_extend_msgin(false);
                    srb.msgin.clear();
                }
                Some(ScsiCommand::FifoIn)
            }
            Phase::BusFree => None,
            Phase::Reserved => {
                warn!("Target entered a reserved bus phase, aborting SRB {}", h.index());
                let tagged = h != SrbHandle::SCRATCH && self.nexus_tagged();
                let srb = &mut self.srbs[h];
                let m = if tagged && srb.tag.is_some() {
                    msg::ABORT_TAG
                } else {
                    msg::ABORT
                };
                if h != SrbHandle::SCRATCH {
                    srb.host_status = HostStatus::TargetPhaseFailure;
                    srb.flags.set_abort_sent(true);
                }
                // ATN is up, the target has to move to message-out next
                self.queue_message(h, &[m]);
                self.write(TrmReg::ScsiXCnt, 1);
                Some(ScsiCommand::FifoIn)
            }
        }
    }

    fn data_phase0(&mut self, h: SrbHandle, stat: ScsiStatus, out: bool) -> Next {
        if self.srbs[h].flags.xferpad() {
            self.srbs[h].flags.set_xferpad(false);
        } else {
            self.data_residual(h, stat, out);
        }
        if out {
            self.write(TrmReg::DmaControl, STOPDMAXFER);
        }
        Next::Phase(Phase::from_bits(stat.phase()))
    }

    /// Works out how far the last data phase got and moves the SG list on
    fn data_residual(&mut self, h: SrbHandle, stat: ScsiStatus, out: bool) {
        if stat.parity_error() {
            self.srbs[h].stat.set_parity_error(true);
        }

        let mut leftcnt = 0;
        if out && !stat.xfer_done() {
            // Bytes the target never took are still in the SCSI FIFO
            let fifo = FifoCnt(self.read(TrmReg::ScsiFifoCnt) as u8);
            leftcnt = fifo_residue(fifo.count(), self.nexus_wide());
        }
        leftcnt += self.read(TrmReg::ScsiXCnt) & MAX_XFER_LEN;
        if out && leftcnt == 1 {
            leftcnt = 0;
            self.write(TrmReg::ScsiControl, DO_CLRFIFO);
        }

        if leftcnt == 0 || stat.xfercnt_zero() {
            let dma = DmaStatus(self.read(TrmReg::DmaStatus) as u8);
            if !dma.xfer_complete() {
                debug!("SRB {}: DMA still busy at end of data phase", h.index());
            }
            let srb = &mut self.srbs[h];
            srb.transferred += srb.buflen;
            let buflen = srb.buflen;
            srb.sg.consume(buflen);
            srb.buflen = 0;
        } else {
            let srb = &mut self.srbs[h];
            if srb.buflen == leftcnt {
                return;
            }
            let xferlen = srb.buflen - leftcnt.min(srb.buflen);
            srb.buflen = leftcnt.min(srb.buflen);
            srb.transferred += xferlen;
            srb.sg.consume(xferlen);
            trace!(
                "SRB {}: {} bytes moved, {} left, SG index {}",
                h.index(),
                xferlen,
                srb.buflen,
                srb.sg.index()
            );
            self.publish_sg(h);
        }
    }

    /// Connected DCB runs tagged queuing
    fn nexus_tagged(&self) -> bool {
        self.nexus
            .and_then(|n| n.dcb)
            .and_then(|id| self.dcbs.get(&id))
            .is_some_and(|d| d.mode.tag_queuing())
    }

    /// Makes the SRB's current SG table visible to the DMA engine
    pub(crate) fn publish_sg(&mut self, h: SrbHandle) {
        let srb = &self.srbs[h];
        self.bus.publish_sg_table(srb.sg_table_addr, srb.sg.entries());
    }

    fn data_phase1(&mut self, h: SrbHandle, out: bool) -> ScsiCommand {
        let srb = &self.srbs[h];
        if srb.buflen > 0 && !srb.sg.exhausted() {
            let table = srb.sg_table_addr + (srb.sg.index() * SgEntry::SIZE) as Address;
            let table_len = (srb.sg.remaining().len() * SgEntry::SIZE) as u32;
            let buflen = srb.buflen;
            self.srbs[h].state = SrbState::DataXfer;

            self.write(TrmReg::DmaXHighAddr, 0);
            self.write(TrmReg::DmaXLowAddr, table);
            self.write(TrmReg::DmaXCnt, table_len);
            self.write(TrmReg::ScsiXCnt, buflen);
            self.write(TrmReg::DmaCommand, SGXFER | if out { 0 } else { XFERDATAIN });
            self.write(TrmReg::DmaControl, STARTDMAXFER);
            return if out {
                ScsiCommand::DmaOut
            } else {
                ScsiCommand::DmaIn
            };
        }

        // Nothing left to move but the target wants more
        let srb = &mut self.srbs[h];
        if !srb.sg_orig.is_empty() {
            srb.host_status = HostStatus::OverUnderRun;
            srb.stat.set_overrun(true);
        }
        srb.flags.set_xferpad(true);
        let wide = self.nexus_wide();
        debug!(
            "SRB {}: padding {} phase",
            h.index(),
            if out { "data-out" } else { "data-in" }
        );
        self.write(TrmReg::ScsiXCnt, if wide { 2 } else { 1 });
        if out {
            let pad: &[u8] = if wide { &[0, 0] } else { &[0] };
            self.write_fifo(pad);
            ScsiCommand::FifoOut
        } else {
            self.read(TrmReg::ScsiFifo);
            if wide {
                self.read(TrmReg::ScsiFifo);
            }
            ScsiCommand::FifoIn
        }
    }

    fn status_phase1(&mut self, h: SrbHandle) -> ScsiCommand {
        let scsi_fifo = |a: &mut Self| {
            if !FifoCnt(a.read(TrmReg::ScsiFifoCnt) as u8).empty() {
                a.write(TrmReg::ScsiControl, DO_CLRFIFO);
            }
        };
        let dma_fifo = |a: &mut Self| {
            if a.read(TrmReg::DmaFifoStatus) & DMA_FIFO_EMPTY == 0 {
                a.write(TrmReg::DmaControl, CLRXFIFO);
            }
        };
        if self.read(TrmReg::DmaCommand) & XFERDATAIN != 0 {
            scsi_fifo(self);
            dma_fifo(self);
        } else {
            dma_fifo(self);
            scsi_fifo(self);
        }
        self.srbs[h].state = SrbState::Status;
        ScsiCommand::Comp
    }

    fn msgout_phase1(&mut self, h: SrbHandle) -> ScsiCommand {
        self.write(TrmReg::ScsiControl, DO_CLRFIFO);
        let srb = &mut self.srbs[h];
        let out = if !srb.msgout.is_empty() {
            let m = std::mem::take(&mut srb.msgout);
            if m[0] == msg::ABORT {
                let id = self.nexus.and_then(|n| n.dcb);
                if let Some(dcb) = id.and_then(|id| self.dcbs.get_mut(&id)) {
                    if dcb.abort_dev {
                        dcb.abort_dev = false;
                        self.srbs[h].flags.set_abort_sent(true);
                    }
                }
            }
            m.to_vec()
        } else if srb.state == SrbState::MsgOut || srb.is_inquiry_like() {
            self.nego_message(h)
        } else {
            vec![msg::NOOP]
        };
        self.write_fifo(&out);
        ScsiCommand::FifoOut
    }

    /// Next negotiation message for the connected DCB
    fn nego_message(&mut self, h: SrbHandle) -> Vec<u8> {
        let Some(dcb) = self.nexus.and_then(|n| n.dcb).and_then(|id| self.dcbs.get_mut(&id))
        else {
            return vec![msg::NOOP];
        };
        let srb = &mut self.srbs[h];
        let mut out = vec![];
        if !srb.flags.identified() {
            out.push(dcb.idmsg & !msg::IDENTIFY_DISCFLAG);
            srb.flags.set_identified(true);
        }

        let mode = dcb.mode;
        if !srb.flags.do_wide_nego() && mode.wide_nego_enable() && !mode.wide_nego_done() {
            dcb.mode.set_sync_nego_done(false);
            dcb.mode.set_atn_stop(false);
            out.extend(nego::wdtr(msg::WDTR_BUS_16_BIT));
            srb.flags.set_do_wide_nego(true);
        } else if !srb.flags.do_sync_nego() && mode.sync_nego_enable() && !mode.sync_nego_done()
        {
            out.extend(nego::sdtr(dcb.period, nego::SYNC_NEGO_OFFSET));
            srb.flags.set_do_sync_nego(true);
        } else if out.is_empty() {
            out.push(msg::NOOP);
        }
        out
    }

    fn msgin_phase0(&mut self, h: SrbHandle) -> Next {
        let byte = self.read(TrmReg::ScsiFifo) as u8;
        let srb = &mut self.srbs[h];
        if !srb.flags.extend_msgin() {
            match byte {
                msg::DISCONNECT => srb.state = SrbState::Disconnect,
                msg::CMDCOMPLETE | msg::SAVEDATAPOINTER | msg::RESTOREPOINTERS | msg::NOOP => (),
                msg::EXTENDED
                | msg::SIMPLE_Q_TAG
                | msg::HEAD_OF_Q_TAG
                | msg::ORDERED_Q_TAG
                | msg::IGN_WIDE_RESIDUE => {
                    srb.msgin.clear();
                    srb.msgin.push(byte);
                    srb.flags.set_extend_msgin(true);
                }
                msg::MESSAGE_REJECT => self.message_rejected(h),
                _ => warn!("Ignoring message {:02X} from target", byte),
            }
        } else if srb.msgin.try_push(byte).is_err() {
            warn!("Overlong message {:02X?}, rejecting", srb.msgin);
            srb.flags.set_extend_msgin(false);
            self.queue_message(h, &[msg::MESSAGE_REJECT]);
        } else {
            self.message_byte(h);
        }
        Next::Accept
    }

    /// Acts on a multi-byte message once its last byte is in
    fn message_byte(&mut self, h: SrbHandle) {
        let srb = &mut self.srbs[h];
        let m = &srb.msgin;
        let complete = if m[0] == msg::EXTENDED {
            m.len() >= 2 && m.len() == usize::from(m[1]) + 2
        } else {
            m.len() == 2
        };
        if !complete {
            return;
        }
        srb.flags.set_extend_msgin(false);

        let id = self.nexus.and_then(|n| n.dcb);
        match srb.msgin[0] {
            msg::EXTENDED => match (srb.msgin.get(2).copied(), id) {
                (Some(msg::EXT_WDTR), Some(id)) => self.wdtr_received(id, h),
                (Some(msg::EXT_SDTR), Some(id)) => self.sdtr_received(id, h),
                _ => {
                    debug!("Rejecting extended message {:02X?}", srb.msgin);
                    self.queue_message(h, &[msg::MESSAGE_REJECT]);
                }
            },
            msg::IGN_WIDE_RESIDUE => {
                let n = u32::from(srb.msgin[1]).min(srb.transferred);
                srb.transferred -= n;
                srb.buflen += n;
            }
            _ => {
                let tag = srb.msgin[1];
                self.tag_received(tag);
            }
        }
    }

    /// Queue tag message following a reselection
    fn tag_received(&mut self, tag: u8) {
        let Some(Nexus { dcb: Some(id), srb }) = self.nexus else {
            return;
        };
        if srb != SrbHandle::SCRATCH {
            debug!("Tag message {} on connected SRB {}", tag, srb.index());
            return;
        }
        let found = self.dcbs.get(&id).and_then(|dcb| {
            dcb.active.iter().copied().find(|&h| {
                self.srbs[h].tag == Some(tag) && self.srbs[h].state == SrbState::Disconnect
            })
        });
        match found {
            Some(h) => {
                trace!("Reselected by {} tag {}", id, tag);
                let srb = &mut self.srbs[h];
                srb.clear_connection();
                srb.flags.set_identified(true);
                srb.state = SrbState::DataXfer;
                self.nexus = Some(Nexus {
                    dcb: Some(id),
                    srb: h,
                });
                if let Some(dcb) = self.dcbs.get_mut(&id) {
                    dcb.actsrb = Some(h);
                }
            }
            None => {
                warn!("Reselected by {} with unknown tag {}", id, tag);
                self.unexpected_reselection(Some(id), msg::ABORT_TAG);
            }
        }
    }

    fn message_rejected(&mut self, h: SrbHandle) {
        let Some(id) = self.nexus.and_then(|n| n.dcb) else {
            return;
        };
        let flags = self.srbs[h].flags;
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };
        if flags.do_wide_nego() {
            debug!("{} rejected WDTR, staying narrow", id);
            dcb.wide_rejected();
            self.srbs[h].flags.set_do_wide_nego(false);
            if dcb.mode.sync_nego_enable() && !dcb.mode.sync_nego_done() {
                self.srbs[h].state = SrbState::MsgOut;
                self.write(TrmReg::ScsiControl, DO_SETATN);
            } else {
                self.write(TrmReg::ScsiControl, DO_CLRATN);
            }
        } else if flags.do_sync_nego() {
            debug!("{} rejected SDTR, going async", id);
            dcb.sync_disabled();
            self.srbs[h].flags.set_do_sync_nego(false);
            self.write(TrmReg::ScsiControl, DO_CLRATN);
        } else {
            debug!("{} rejected a message", id);
            return;
        }
        self.program_sync(id);
        self.set_xfer_rate(id);
    }

    fn wdtr_received(&mut self, id: DcbId, h: SrbHandle) {
        let asked = self.srbs[h].flags.do_wide_nego();
        self.srbs[h].flags.set_do_wide_nego(false);
        let reply = nego::parse_wdtr(&self.srbs[h].msgin);
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };

        let answer = match reply {
            WdtrReply::Malformed => {
                dcb.wide_rejected();
                Some(vec![msg::MESSAGE_REJECT])
            }
            WdtrReply::TooWide if asked => {
                dcb.wide_rejected();
                Some(vec![msg::MESSAGE_REJECT])
            }
            r if asked => {
                dcb.wide_settled(r == WdtrReply::Wide);
                None
            }
            _ => {
                debug!("{} started WDTR, answering 8-bit", id);
                dcb.wide_settled(false);
                Some(nego::wdtr(msg::WDTR_BUS_8_BIT).to_vec())
            }
        };
        let sync_pending = dcb.mode.sync_nego_enable() && !dcb.mode.sync_nego_done();
        let wide = dcb.wide();
        trace!("{} WDTR {:?}, wide {}", id, reply, wide);

        self.program_sync(id);
        self.set_xfer_rate(id);
        match answer {
            Some(m) => self.queue_message(h, &m),
            None if sync_pending => {
                self.srbs[h].state = SrbState::MsgOut;
                self.write(TrmReg::ScsiControl, DO_SETATN);
            }
            None => self.write(TrmReg::ScsiControl, DO_CLRATN),
        }
    }

    fn sdtr_received(&mut self, id: DcbId, h: SrbHandle) {
        let asked = self.srbs[h].flags.do_sync_nego();
        self.srbs[h].flags.set_do_sync_nego(false);
        let reply = nego::parse_sdtr(&self.srbs[h].msgin);
        let requested = self.srbs[h].msgin.get(3).copied().unwrap_or(0);
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };

        let answer = match reply {
            SdtrReply::Malformed => {
                dcb.sync_disabled();
                Some(vec![msg::MESSAGE_REJECT])
            }
            SdtrReply::Async => {
                dcb.sync_disabled();
                (!asked).then(|| nego::sdtr(requested, 0).to_vec())
            }
            SdtrReply::Sync { period, .. } if !asked && !dcb.mode.sync_nego_enable() => {
                debug!("{} started SDTR, answering async", id);
                Some(nego::sdtr(period, 0).to_vec())
            }
            SdtrReply::Sync { period, offset } => {
                let period = if asked {
                    period
                } else {
                    period.max(CLOCK_PERIOD[0])
                };
                dcb.sync_settled(period, offset);
                (!asked).then(|| nego::sdtr(dcb.period, dcb.offset).to_vec())
            }
        };

        self.program_sync(id);
        self.set_xfer_rate(id);
        match answer {
            Some(m) => self.queue_message(h, &m),
            None => self.write(TrmReg::ScsiControl, DO_CLRATN),
        }
    }
}
