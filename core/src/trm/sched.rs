//! Command submission, selection and the round-robin scheduler

use arrayvec::ArrayVec;
use log::*;

use super::dcb::{Dcb, DcbId};
use super::phase::Phase;
use super::regs::*;
use super::sg::{MAX_XFER_LEN, SgList};
use super::srb::{MAX_CDB_LEN, SrbHandle, SrbSlot, SrbState};
use super::xfer::{Completion, HostStatus, Xfer, XferError};
use super::{Adapter, Nexus, TrmError};
use crate::bus::{DmaMemory, RegisterIo, TrmReg};
use crate::scsi::{CMD_INQUIRY, devtype, msg, scsi_cmd_len};

impl<B: RegisterIo + DmaMemory> Adapter<B> {
    /// Queues a command from the midlayer.
    ///
    /// Commands that cannot be run complete immediately through the
    /// completion channel. Returns the SRB the command was given.
    pub fn submit(&mut self, xfer: Xfer) -> Option<SrbHandle> {
        if xfer.reset {
            info!("Bus reset requested");
            self.reset_bus();
            self.deliver(Completion::failed(&xfer, XferError::Reset, HostStatus::Good));
            return None;
        }

        let (cdb, sg) = match self.prepare(&xfer) {
            Ok(v) => v,
            Err(e) => {
                warn!("Command {} rejected: {}", xfer.id, e);
                let host_status = match e {
                    TrmError::SgTooLong(_)
                    | TrmError::SgLengthMismatch { .. }
                    | TrmError::XferTooLarge(_) => HostStatus::BadCcbOrSg,
                    _ => HostStatus::InvalidCcbOp,
                };
                self.deliver(Completion::failed(&xfer, XferError::DriverStuffup, host_status));
                return None;
            }
        };

        let id = DcbId {
            target: xfer.target,
            lun: xfer.lun,
        };
        if !self.dcbs.contains_key(&id) {
            let dcb = Dcb::new(
                id,
                &self.config.targets[usize::from(id.target)],
                self.wide_card,
                self.cur_offset,
            );
            debug!("New device {}, mode {:?}", id, dcb.mode);
            self.dcbs.insert(id, dcb);
            self.dcb_order.push(id);
        }

        if let Err(e) = self.check_duplicate(id, xfer.id) {
            warn!("Command {} rejected: {}", xfer.id, e);
            self.deliver(Completion::failed(
                &xfer,
                XferError::DriverStuffup,
                HostStatus::DuplicateCcb,
            ));
            return None;
        }

        let Some(h) = self.srbs.alloc() else {
            warn!("Out of SRBs, command {} bounced", xfer.id);
            self.deliver(Completion::failed(
                &xfer,
                XferError::ResourceShortage,
                HostStatus::Good,
            ));
            return None;
        };

        let tape = self.dcbs[&id].dev_type == Some(devtype::SEQUENTIAL);
        let deadline = xfer.timeout.map(|t| self.clock + t);
        let srb = &mut self.srbs[h];
        srb.cdb = cdb;
        srb.sg_orig = sg.clone();
        srb.sg = sg;
        srb.buflen = xfer.datalen;
        // Tapes must not see a command twice
        srb.retry = if tape { 0 } else { 1 };
        srb.deadline = deadline;
        srb.xfer = Some(xfer);
        self.publish_sg(h);

        self.send_srb(id, h);
        Some(h)
    }

    fn prepare(&self, xfer: &Xfer) -> Result<(ArrayVec<u8, MAX_CDB_LEN>, SgList), TrmError> {
        if xfer.target > self.maxid || xfer.lun > 7 || xfer.target == self.config.scsi_id {
            return Err(TrmError::InvalidNexus(xfer.target, xfer.lun));
        }
        let short = xfer
            .cdb
            .first()
            .and_then(|&op| scsi_cmd_len(op))
            .is_some_and(|n| xfer.cdb.len() < n);
        if xfer.cdb.is_empty() || xfer.cdb.len() > MAX_CDB_LEN || short {
            return Err(TrmError::InvalidCdb(xfer.cdb.clone()));
        }
        if xfer.datalen > MAX_XFER_LEN {
            return Err(TrmError::XferTooLarge(xfer.datalen));
        }
        let sg = SgList::new(&xfer.sg)?;
        if sg.total() != u64::from(xfer.datalen) {
            return Err(TrmError::SgLengthMismatch {
                sg: sg.total(),
                datalen: xfer.datalen,
            });
        }
        Ok((xfer.cdb.iter().copied().collect(), sg))
    }

    /// The midlayer handle must not already be outstanding on the LUN
    fn check_duplicate(&self, id: DcbId, xfer_id: u64) -> Result<(), TrmError> {
        let Some(dcb) = self.dcbs.get(&id) else {
            return Ok(());
        };
        let dup = dcb
            .waiting
            .iter()
            .chain(dcb.active.iter())
            .any(|&h| self.srbs[h].xfer.as_ref().is_some_and(|x| x.id == xfer_id));
        if dup {
            Err(TrmError::DuplicateCommand(xfer_id, id))
        } else {
            Ok(())
        }
    }

    /// Puts an SRB on its DCB's waiting queue and starts the head of that
    /// queue if the bus and the DCB allow it
    pub(super) fn send_srb(&mut self, id: DcbId, h: SrbHandle) {
        let busy = self.nexus.is_some() || self.reset_in_progress();
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };
        dcb.waiting.push_back(h);
        let srb = &mut self.srbs[h];
        srb.slot = SrbSlot::Waiting(id);
        srb.state = SrbState::Wait;

        if busy || dcb.at_limit() {
            trace!(
                "SRB {} waits on {} ({} active)",
                h.index(),
                id,
                dcb.active.len()
            );
            return;
        }
        if let Some(head) = dcb.waiting.pop_front() {
            if let Some(idx) = self.dcb_order.iter().position(|&d| d == id) {
                self.rr = idx + 1;
            }
            self.start_and_track(id, head);
        }
    }

    /// Starts the next waiting SRB of the first eligible DCB after the last
    /// one served
    pub(super) fn wait_srb(&mut self) {
        if self.nexus.is_some() || self.reset_in_progress() || self.dcb_order.is_empty() {
            return;
        }
        let n = self.dcb_order.len();
        for i in 0..n {
            let idx = (self.rr + i) % n;
            let id = self.dcb_order[idx];
            let Some(dcb) = self.dcbs.get_mut(&id) else {
                continue;
            };
            if dcb.at_limit() {
                continue;
            }
            let Some(h) = dcb.waiting.pop_front() else {
                continue;
            };
            self.rr = idx + 1;
            self.start_and_track(id, h);
            break;
        }
    }

    fn start_and_track(&mut self, id: DcbId, h: SrbHandle) {
        let started = self.start_scsi(id, h);
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return;
        };
        let srb = &mut self.srbs[h];
        if started {
            dcb.active.push_back(h);
            srb.slot = SrbSlot::Active(id);
        } else {
            dcb.waiting.push_front(h);
            srb.slot = SrbSlot::Waiting(id);
            srb.state = SrbState::Ready;
        }
    }

    /// Selection should stop after IDENTIFY so negotiation can go out.
    ///
    /// INQUIRY to a LUN other than 0 is sent without it.
    fn wants_atn_stop(&self, id: DcbId, h: SrbHandle) -> bool {
        let srb = &self.srbs[h];
        let Some(dcb) = self.dcbs.get(&id) else {
            return false;
        };
        srb.is_inquiry_like()
            && dcb.nego_pending()
            && (id.lun == 0 || srb.cdb.first() != Some(&CMD_INQUIRY))
    }

    /// Arms selection for an SRB. Returns false if the start has to wait.
    fn start_scsi(&mut self, id: DcbId, h: SrbHandle) -> bool {
        let atn_stop = self.wants_atn_stop(id, h);
        let Some(dcb) = self.dcbs.get_mut(&id) else {
            return false;
        };
        let tag = match dcb.alloc_tag() {
            Ok(tag) => tag,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        let (idmsg, synctl, offset) = (dcb.idmsg, dcb.synctl.0, dcb.offset);
        let tag_queuing = dcb.mode.tag_queuing();

        let srb = &mut self.srbs[h];
        srb.clear_connection();
        srb.tag = Some(tag);
        let inquiry_like = srb.is_inquiry_like();

        self.write(TrmReg::ScsiHostId, self.config.scsi_id.into());
        self.write(TrmReg::ScsiTargetId, id.target.into());
        self.write(TrmReg::ScsiSync, synctl.into());
        self.write(TrmReg::ScsiOffset, offset.into());
        self.write(TrmReg::ScsiControl, DO_CLRFIFO);

        let (cmd, state) = if atn_stop {
            // IDENTIFY and negotiation follow in message-out
            (ScsiCommand::SelAtnStop, SrbState::MsgOut)
        } else if inquiry_like {
            self.write_fifo(&[idmsg & !msg::IDENTIFY_DISCFLAG]);
            (ScsiCommand::SelAtn, SrbState::Start)
        } else if tag_queuing {
            self.write_fifo(&[idmsg, msg::SIMPLE_Q_TAG, tag]);
            (ScsiCommand::SelAtn3, SrbState::Start)
        } else {
            self.write_fifo(&[idmsg]);
            (ScsiCommand::SelAtn, SrbState::Start)
        };
        if cmd != ScsiCommand::SelAtnStop {
            let cdb = self.srbs[h].cdb.clone();
            self.write_fifo(&cdb);
            self.srbs[h].flags.set_identified(true);
        }

        // Something (a reselection) got in first
        if ScsiStatus(self.read(TrmReg::ScsiStatus) as u16).scsi_interrupt() {
            debug!("Interrupt pending, deferring SRB {} on {}", h.index(), id);
            if let Some(dcb) = self.dcbs.get_mut(&id) {
                dcb.release_tag(tag);
            }
            let srb = &mut self.srbs[h];
            srb.tag = None;
            srb.state = SrbState::Ready;
            return false;
        }

        trace!(
            "Selecting {} SRB {} tag {} with {:?}",
            id,
            h.index(),
            tag,
            cmd
        );
        let srb = &mut self.srbs[h];
        srb.phase = Phase::BusFree;
        srb.state = state;
        self.nexus = Some(Nexus {
            dcb: Some(id),
            srb: h,
        });
        if let Some(dcb) = self.dcbs.get_mut(&id) {
            dcb.actsrb = Some(h);
        }
        self.write(TrmReg::ScsiControl, DO_DATALATCH | DO_HWRESELECT);
        self.write(TrmReg::ScsiCommand, cmd as u32);
        true
    }

    /// Returns an issued SRB to the head of its waiting queue
    pub(super) fn rewait(&mut self, id: DcbId, h: SrbHandle) {
        let srb = &mut self.srbs[h];
        let tag = srb.tag.take();
        srb.slot = SrbSlot::Waiting(id);
        srb.state = SrbState::Ready;
        if let Some(dcb) = self.dcbs.get_mut(&id) {
            dcb.remove_active(h);
            if let Some(tag) = tag {
                dcb.release_tag(tag);
            }
            dcb.waiting.push_front(h);
        }
    }

    /// Takes an SRB off every queue of its DCB
    pub(super) fn detach(&mut self, id: DcbId, h: SrbHandle) {
        let tag = self.srbs[h].tag.take();
        if let Some(dcb) = self.dcbs.get_mut(&id) {
            if let Some(tag) = tag {
                dcb.release_tag(tag);
            }
            dcb.remove_active(h);
            dcb.remove_waiting(h);
        }
    }
}
