//! Disconnects, reselections, command completion and error recovery

use log::*;

use super::dcb::DcbId;
use super::phase::Phase;
use super::regs::*;
use super::sg::{SgEntry, SgList};
use super::srb::{SavedCommand, SrbHandle, SrbSlot, SrbState};
use super::xfer::{Completion, HostStatus, XferError};
use super::{Adapter, AdapterFlags, Nexus};
use crate::bus::{DmaMemory, RegisterIo, TrmReg};
use crate::scsi::{
    CMD_INQUIRY, CMD_REQUEST_SENSE, InquiryData, SENSE_LEN, STATUS_BUSY, STATUS_CHECK_CONDITION,
    STATUS_CONDITION_MET, STATUS_GOOD, STATUS_QUEUE_FULL, STATUS_RESERVATION_CONFLICT, devtype,
    msg,
};
use crate::trm::config::ntc;

impl<B: RegisterIo + DmaMemory> Adapter<B> {
    /// Bus went free, or our selection timed out
    pub(super) fn disconnect(&mut self, intstat: IntStatus) {
        self.write(TrmReg::ScsiControl, DO_CLRFIFO | DO_HWRESELECT);
        let Some(Nexus { dcb, srb: h }) = self.nexus.take() else {
            debug!("Bus free with nothing connected");
            self.wait_srb();
            return;
        };
        self.srbs[h].phase = Phase::BusFree;
        let Some(id) = dcb else {
            self.wait_srb();
            return;
        };

        let flags = self.srbs[h].flags;
        if flags.abort_sent() && self.srbs[h].host_status == HostStatus::TargetPhaseFailure {
            warn!("SRB {} on {} aborted after a phase failure", h.index(), id);
            self.finish(id, h, XferError::Aborted);
        } else if flags.abort_sent() {
            self.abort_done(id);
        } else if h == SrbHandle::SCRATCH || flags.unexpect_resel() {
            debug!("Unmatched reselection by {} cleared", id);
            if let Some(dcb) = self.dcbs.get_mut(&id) {
                dcb.actsrb = None;
            }
        } else if intstat.sel_timeout() {
            debug!("Selection timeout on {}", id);
            self.srbs[h].host_status = HostStatus::SelTimeout;
            self.finish(id, h, XferError::SelTimeout);
        } else {
            match self.srbs[h].state {
                SrbState::Disconnect => {
                    trace!("{} disconnected SRB {}", id, h.index());
                    if let Some(dcb) = self.dcbs.get_mut(&id) {
                        dcb.actsrb = None;
                    }
                }
                SrbState::Completed => self.srb_done(id, h),
                state => {
                    warn!("Unexpected bus free on {} in state {:?}", id, state);
                    self.srbs[h].host_status = HostStatus::UnexpectedBusFree;
                    self.finish(id, h, XferError::DriverStuffup);
                }
            }
        }
        self.wait_srb();
    }

    /// A target reselected us
    pub(super) fn reselect(&mut self) {
        if let Some(n) = self.nexus.take() {
            match n.dcb {
                Some(id) if n.srb != SrbHandle::SCRATCH => {
                    debug!("Lost arbitration, SRB {} back to {}", n.srb.index(), id);
                    self.rewait(id, n.srb);
                }
                _ => warn!("Reselected while connected"),
            }
        }

        let target = (self.read(TrmReg::ScsiTargetId) & 0x0F) as u8;
        let lun = (self.read(TrmReg::ScsiIdMsg) & 0x07) as u8;
        let id = DcbId { target, lun };

        let h = match self.dcbs.get(&id) {
            None => {
                warn!("Reselected by unknown device {}", id);
                self.unexpected_reselection(None, msg::ABORT)
            }
            Some(dcb) if dcb.mode.tag_queuing() => {
                // The tag message tells which command this is
                let h = self.srbs.take_scratch();
                self.nexus = Some(Nexus { dcb: Some(id), srb: h });
                h
            }
            Some(dcb) => {
                let found = dcb
                    .active
                    .iter()
                    .copied()
                    .find(|&h| self.srbs[h].state == SrbState::Disconnect);
                match found {
                    Some(h) => {
                        let srb = &mut self.srbs[h];
                        srb.clear_connection();
                        srb.flags.set_identified(true);
                        srb.state = SrbState::DataXfer;
                        self.nexus = Some(Nexus { dcb: Some(id), srb: h });
                        if let Some(dcb) = self.dcbs.get_mut(&id) {
                            dcb.actsrb = Some(h);
                        }
                        h
                    }
                    None => {
                        warn!("Reselected by {} with no disconnected command", id);
                        self.unexpected_reselection(Some(id), msg::ABORT)
                    }
                }
            }
        };
        trace!("Reselected by {}, SRB {}", id, h.index());
        self.srbs[h].phase = Phase::BusFree;

        let (synctl, offset) = self
            .dcbs
            .get(&id)
            .map_or((0, 0), |d| (d.synctl.0, d.offset));
        self.write(TrmReg::ScsiTargetId, target.into());
        self.write(TrmReg::ScsiHostId, self.config.scsi_id.into());
        self.write(TrmReg::ScsiSync, synctl.into());
        self.write(TrmReg::ScsiOffset, offset.into());
        self.arm(ScsiCommand::MsgAccept);
    }

    /// Connects the scratch SRB so the target can be told to go away
    pub(super) fn unexpected_reselection(&mut self, dcb: Option<DcbId>, m: u8) -> SrbHandle {
        let h = self.srbs.take_scratch();
        self.srbs[h].flags.set_unexpect_resel(true);
        self.nexus = Some(Nexus { dcb, srb: h });
        self.queue_message(h, &[m]);
        h
    }

    /// Target finished with status and COMMAND COMPLETE
    fn srb_done(&mut self, id: DcbId, h: SrbHandle) {
        let error = if self.srbs[h].flags.auto_reqsense() {
            self.sense_done(id, h)
        } else {
            self.check_status(id, h)
        };
        if let Some(error) = error {
            self.finish(id, h, error);
        }
    }

    /// Classifies the status byte. None if the SRB went back to the queue.
    fn check_status(&mut self, id: DcbId, h: SrbHandle) -> Option<XferError> {
        let srb = &self.srbs[h];
        match srb.target_status {
            STATUS_GOOD | STATUS_CONDITION_MET => {
                if srb.stat.overrun() {
                    Some(XferError::DriverStuffup)
                } else if srb.stat.parity_error() {
                    debug!("Parity error on {}", id);
                    self.retry(id, h)
                } else {
                    Some(XferError::NoError)
                }
            }
            STATUS_CHECK_CONDITION => self.request_sense(id, h),
            STATUS_QUEUE_FULL => {
                if let Some(dcb) = self.dcbs.get_mut(&id) {
                    dcb.maxcmd = dcb.active.len().saturating_sub(1).max(1);
                    info!("Queue full on {}, limiting to {} commands", id, dcb.maxcmd);
                }
                let srb = &mut self.srbs[h];
                srb.rewind();
                self.publish_sg(h);
                self.rewait(id, h);
                None
            }
            STATUS_BUSY | STATUS_RESERVATION_CONFLICT => Some(XferError::Busy),
            status => {
                debug!("{} returned status {:02X}", id, status);
                self.retry(id, h)
            }
        }
    }

    /// Runs the command again from the start if it has retries left
    fn retry(&mut self, id: DcbId, h: SrbHandle) -> Option<XferError> {
        let srb = &mut self.srbs[h];
        if srb.retry == 0 {
            return Some(XferError::DriverStuffup);
        }
        srb.retry -= 1;
        debug!("Retrying SRB {} on {}", h.index(), id);
        srb.rewind();
        self.publish_sg(h);
        self.rewait(id, h);
        None
    }

    /// Turns the SRB into a REQUEST SENSE for the same LUN
    fn request_sense(&mut self, id: DcbId, h: SrbHandle) -> Option<XferError> {
        let srb = &mut self.srbs[h];
        let Some(sense_addr) = srb.xfer.as_ref().and_then(|x| x.sense_addr) else {
            debug!("Check condition on {} without a sense buffer", id);
            return Some(XferError::DriverStuffup);
        };

        srb.saved = Some(SavedCommand {
            cdb: std::mem::take(&mut srb.cdb),
            sg: std::mem::take(&mut srb.sg),
            buflen: srb.buflen,
            transferred: srb.transferred,
        });
        srb.cdb = [CMD_REQUEST_SENSE, id.lun << 5, 0, 0, SENSE_LEN as u8, 0]
            .into_iter()
            .collect();
        srb.sg = SgList::single(SgEntry::new(sense_addr, SENSE_LEN as u32));
        srb.buflen = SENSE_LEN as u32;
        srb.transferred = 0;
        srb.flags.set_auto_reqsense(true);
        srb.target_status = STATUS_GOOD;
        srb.host_status = HostStatus::Good;
        srb.stat = Default::default();
        debug!("Check condition on {}, requesting sense", id);

        self.publish_sg(h);
        self.rewait(id, h);
        None
    }

    /// REQUEST SENSE finished, put the original command back
    fn sense_done(&mut self, id: DcbId, h: SrbHandle) -> Option<XferError> {
        let srb = &mut self.srbs[h];
        srb.flags.set_auto_reqsense(false);
        let got = (SENSE_LEN as u32).saturating_sub(srb.buflen) as usize;
        let (sense_status, sense_host) = (srb.target_status, srb.host_status);
        if let Some(saved) = srb.saved.take() {
            srb.cdb = saved.cdb;
            srb.sg = saved.sg;
            srb.buflen = saved.buflen;
            srb.transferred = saved.transferred;
        }
        srb.target_status = STATUS_CHECK_CONDITION;
        srb.host_status = HostStatus::Good;

        let sense_addr = srb.xfer.as_ref().and_then(|x| x.sense_addr);
        match sense_addr {
            Some(addr) if sense_status == STATUS_GOOD && sense_host == HostStatus::Good => {
                let mut sense = vec![0; got];
                self.bus.read_dma(addr, &mut sense);
                self.srbs[h].sense = Some(sense);
                Some(XferError::Sense)
            }
            _ => {
                warn!(
                    "Request sense on {} failed: status {:02X}, {:?}",
                    id, sense_status, sense_host
                );
                Some(XferError::DriverStuffup)
            }
        }
    }

    /// Completes an SRB and updates device discovery
    pub(super) fn finish(&mut self, id: DcbId, h: SrbHandle, error: XferError) {
        self.detach(id, h);

        let srb = &self.srbs[h];
        let inquiry = if error == XferError::NoError && srb.cdb.first() == Some(&CMD_INQUIRY) {
            srb.xfer
                .as_ref()
                .and_then(|x| x.sg.first().copied())
                .map(|e| {
                    let mut buf = [0u8; InquiryData::LEN];
                    let n = (e.length as usize).min(InquiryData::LEN);
                    self.bus.read_dma(e.address, &mut buf[..n]);
                    InquiryData::parse(&buf)
                })
        } else {
            None
        };
        let host_status = self.srbs[h].host_status;

        self.retire(h, error);
        self.scan_result(id, error, host_status, inquiry);
    }

    /// Reports an SRB to the midlayer and returns it to the pool
    fn retire(&mut self, h: SrbHandle, error: XferError) {
        let srb = &mut self.srbs[h];
        let Some(xfer) = srb.xfer.take() else {
            error!("SRB {} completed without a command", h.index());
            self.srbs.release(h);
            return;
        };
        let c = Completion {
            id: xfer.id,
            target: xfer.target,
            lun: xfer.lun,
            error,
            host_status: srb.host_status,
            status: srb.target_status,
            sense: srb.sense.take(),
            resid: srb.buflen,
        };
        self.deliver(c);
        self.srbs.release(h);
    }

    /// Completes an SRB that has already left its DCB's queues
    fn fail_srb(&mut self, h: SrbHandle, error: XferError) {
        self.srbs[h].tag = None;
        self.retire(h, error);
    }

    /// Learns what sits at a target/LUN from the first command's outcome
    fn scan_result(
        &mut self,
        id: DcbId,
        error: XferError,
        host_status: HostStatus,
        inquiry: Option<InquiryData>,
    ) {
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };
        if !dcb.scanning {
            return;
        }
        if error == XferError::SelTimeout || host_status == HostStatus::UnexpectedBusFree {
            debug!("Nothing at {}", id);
            self.remove_dcb(id);
            return;
        }
        let Some(inq) = inquiry else {
            return;
        };
        if inq.device_type == devtype::NODEVICE {
            debug!("No device behind {}", id);
            self.remove_dcb(id);
            return;
        }

        dcb.dev_type = Some(inq.device_type);
        dcb.scanning = false;
        if matches!(inq.device_type, devtype::DIRECT | devtype::OPTICAL) {
            let wanted = ntc::DO_TAG_QUEUING | ntc::DO_DISCONNECT;
            if inq.supports_tagging() && dcb.tacfg & wanted == wanted {
                dcb.maxcmd = self.config.maxtag();
                dcb.mode.set_tag_queuing(true);
                info!("{}: tagged queuing, {} commands", id, dcb.maxcmd);
            } else {
                dcb.mode.set_atn_stop(true);
            }
        }
    }

    /// Forgets a LUN that turned out not to exist
    fn remove_dcb(&mut self, id: DcbId) {
        let Some(dcb) = self.dcbs.remove(&id) else {
            return;
        };
        if let Some(pos) = self.dcb_order.iter().position(|&d| d == id) {
            self.dcb_order.remove(pos);
            if self.rr > pos {
                self.rr -= 1;
            }
            if self.rr >= self.dcb_order.len() {
                self.rr = 0;
            }
        }
        for h in dcb.waiting.into_iter().chain(dcb.active) {
            self.srbs[h].host_status = HostStatus::SelTimeout;
            self.fail_srb(h, XferError::SelTimeout);
        }
    }

    pub(super) fn reset_scsi_bus(&mut self) {
        self.flags.set_reset_dev(true);
        self.write(TrmReg::ScsiControl, DO_RSTSCSI);
    }

    /// Full adapter reset: pulls RST and fails everything on the bus.
    ///
    /// Waiting commands stay queued until the reset interrupt arrives.
    pub(super) fn reset_bus(&mut self) {
        info!("Resetting SCSI bus");
        self.write(TrmReg::ScsiIntEn, 0);
        self.write(TrmReg::DmaIntEn, 0);
        self.reset_scsi_bus();
        self.enable_interrupts();
        self.write(TrmReg::DmaControl, CLRXFIFO);
        self.write(TrmReg::ScsiControl, DO_CLRFIFO);

        self.reset_device();
        self.doing_srb_done(XferError::Timeout);
        self.nexus = None;
    }

    /// Every device has to negotiate again
    fn reset_device(&mut self) {
        for dcb in self.dcbs.values_mut() {
            dcb.load_defaults(
                &self.config.targets[usize::from(dcb.id.target)],
                self.wide_card,
                self.cur_offset,
            );
            dcb.abort_dev = false;
        }
    }

    /// Fails every issued command
    fn doing_srb_done(&mut self, error: XferError) {
        for id in self.dcb_order.clone() {
            let Some(dcb) = self.dcbs.get_mut(&id) else {
                continue;
            };
            let active = std::mem::take(&mut dcb.active);
            dcb.tagmask = 0;
            dcb.actsrb = None;
            for h in active {
                self.fail_srb(h, error);
            }
        }
    }

    /// Watchdog expired for an SRB
    pub(super) fn timeout(&mut self, h: SrbHandle) {
        let id = match self.srbs[h].slot {
            SrbSlot::Waiting(id) | SrbSlot::Active(id) => id,
            SrbSlot::Free => return,
        };
        error!("Command on {} timed out, resetting SCSI bus", id);
        self.reset_scsi_bus();
        self.reset_device();
        self.doing_srb_done(XferError::Timeout);
        self.nexus = None;

        // Still queued, never made it onto the bus
        if self.srbs[h].slot != SrbSlot::Free {
            self.detach(id, h);
            self.fail_srb(h, XferError::Timeout);
        }
    }

    /// The SCSI reset line was seen
    pub(super) fn reset_detect(&mut self) {
        self.write(TrmReg::DmaControl, STOPDMAXFER);
        self.write(TrmReg::ScsiControl, DO_CLRFIFO);
        if self.flags.reset_dev() {
            self.flags.set_reset_done(true);
            debug!("SCSI bus reset complete");
        } else {
            warn!("SCSI bus reset by another device");
            self.flags.set_reset_detect(true);
            self.reset_device();
            self.recover_srb();
        }
        self.nexus = None;
        self.flags = AdapterFlags::default();
        self.wait_srb();
    }

    /// Puts every issued command back at the head of its waiting queue
    fn recover_srb(&mut self) {
        for id in self.dcb_order.clone() {
            let Some(dcb) = self.dcbs.get_mut(&id) else {
                continue;
            };
            let active = std::mem::take(&mut dcb.active);
            dcb.tagmask = 0;
            dcb.actsrb = None;
            for &h in active.iter().rev() {
                dcb.waiting.push_front(h);
            }
            for h in active {
                let srb = &mut self.srbs[h];
                srb.abandon_sense();
                srb.rewind();
                srb.clear_connection();
                srb.tag = None;
                srb.state = SrbState::Ready;
                srb.slot = SrbSlot::Waiting(id);
                self.publish_sg(h);
            }
        }
    }

    /// Aborts everything queued for a LUN.
    ///
    /// Commands not yet issued complete right away. Issued ones complete
    /// once ABORT has been delivered and the target let go of the bus.
    /// Returns false if the LUN is unknown.
    pub fn abort_device(&mut self, target: u8, lun: u8) -> bool {
        let id = DcbId { target, lun };
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return false;
        };
        let waiting = std::mem::take(&mut dcb.waiting);
        dcb.abort_dev = !dcb.active.is_empty();
        info!(
            "Aborting {}: {} queued, {} issued",
            id,
            waiting.len(),
            dcb.active.len()
        );
        for h in waiting {
            self.srbs[h].host_status = HostStatus::Abort;
            self.fail_srb(h, XferError::Aborted);
        }
        true
    }

    /// ABORT went out and the target disconnected
    fn abort_done(&mut self, id: DcbId) {
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };
        dcb.abort_dev = false;
        dcb.tagmask = 0;
        dcb.actsrb = None;
        let active = std::mem::take(&mut dcb.active);
        debug!("{} aborted, {} commands dropped", id, active.len());
        for h in active {
            self.srbs[h].host_status = HostStatus::Abort;
            self.fail_srb(h, XferError::Aborted);
        }
    }

    /// Copies the negotiated transfer parameters of a DCB to the other
    /// LUNs of its target
    pub(super) fn set_xfer_rate(&mut self, id: DcbId) {
        let Some(src) = self.dcbs.remove(&id) else {
            return;
        };
        if id.lun == 0 {
            self.cur_offset = src.offset;
        }
        for dcb in self.dcbs.values_mut().filter(|d| d.id.target == id.target) {
            dcb.adopt_transfer(&src);
        }
        self.dcbs.insert(id, src);
    }
}
