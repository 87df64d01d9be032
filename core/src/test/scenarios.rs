//! Complete command sequences, from submit to completion

use super::*;
use crate::bus::TrmReg;
use crate::scsi::{STATUS_GOOD, STATUS_QUEUE_FULL, msg};
use crate::tickable::Tickable;
use crate::trm::phase::Phase;
use crate::trm::config::ntc;
use crate::trm::regs::{DO_CLRFIFO, DO_RSTSCSI, STOPDMAXFER, ScsiCommand};
use crate::trm::sg::SgEntry;
use crate::trm::srb::SrbState;
use crate::trm::xfer::{HostStatus, Xfer, XferError};

#[test]
fn untagged_read() {
    let (mut a, done) = adapter(config(0x77), false);
    let h = a.submit(read(1, 0, 512)).unwrap();

    assert_eq!(a.bus().commands(), vec![ScsiCommand::SelAtn]);
    let mut fifo = vec![0xC0];
    fifo.extend(READ_10);
    assert_eq!(a.bus().fifo_writes(), fifo);
    assert_eq!(a.srb(h).tag(), Some(0));
    assert_eq!(a.srb(h).state(), SrbState::Start);

    bus_service(&mut a, Phase::DataIn);
    assert_eq!(a.bus().last_command(), Some(ScsiCommand::DmaIn));
    complete(&mut a, STATUS_GOOD);

    let c = done.try_recv().unwrap();
    assert_eq!(c.id, 1);
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.host_status, HostStatus::Good);
    assert_eq!(c.resid, 0);
    let dcb = a.dcb(0, 0).unwrap();
    assert_eq!(dcb.maxcmd(), 1);
    assert_eq!(dcb.tagmask(), 0);
    assert!(a.nexus().is_none());
    assert_eq!(a.free_srbs(), 32);
}

#[test]
fn wide_rejected_then_sync() {
    let (mut a, done) = adapter(config(0x77), true);
    assert!(a.wide_card());
    a.submit(inquiry(1, 0)).unwrap();

    // Selection stops after IDENTIFY, nothing preloaded
    assert_eq!(a.bus().commands(), vec![ScsiCommand::SelAtnStop]);
    assert!(a.bus().fifo_writes().is_empty());

    bus_service(&mut a, Phase::MsgOut);
    assert_eq!(a.bus().fifo_writes(), vec![0x80, 0x01, 0x02, 0x03, 0x01]);

    message_in(&mut a, &[msg::MESSAGE_REJECT]);
    let dcb = a.dcb(0, 0).unwrap();
    assert!(!dcb.mode().wide_nego_enable());
    assert!(!dcb.wide());

    a.bus_mut().reset_trace();
    bus_service(&mut a, Phase::MsgOut);
    assert_eq!(a.bus().fifo_writes(), vec![0x01, 0x03, 0x01, 13, 15]);

    message_in(&mut a, &[0x01, 0x03, 0x01, 25, 8]);
    let dcb = a.dcb(0, 0).unwrap();
    assert_eq!(dcb.synctl().0, 0x0A);
    assert_eq!(dcb.offset(), 8);
    assert!(dcb.mode().sync_nego_done());
    assert!(a.bus().writes(TrmReg::ScsiSync).contains(&0x0A));

    a.bus_mut().reset_trace();
    bus_service(&mut a, Phase::Command);
    assert_eq!(a.bus().fifo_writes(), INQUIRY.to_vec());
    bus_service(&mut a, Phase::DataIn);
    complete(&mut a, STATUS_GOOD);

    let c = done.try_recv().unwrap();
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.resid, 0);
}

#[test]
fn disconnect_mid_transfer() {
    let (mut a, done) = quiet_adapter();
    let pages = (0..16)
        .map(|i| SgEntry::new(DATA_BUF + i * 0x1000, 0x1000))
        .collect::<Vec<_>>();
    let h = a
        .submit(Xfer::new(1, 0, 0, &READ_10).with_data(&pages))
        .unwrap();

    bus_service(&mut a, Phase::DataIn);
    assert_eq!(a.bus().writes(TrmReg::DmaXLowAddr), vec![SG_BASE]);
    assert_eq!(a.bus().writes(TrmReg::ScsiXCnt), vec![65536]);

    // 5 pages in, target saves pointers and disconnects
    a.bus_mut().set(TrmReg::ScsiXCnt, 45056);
    message_in(&mut a, &[msg::SAVEDATAPOINTER, msg::DISCONNECT]);
    disconnect(&mut a);
    assert_eq!(a.srb(h).transferred(), 20480);
    assert_eq!(a.srb(h).sg().index(), 5);
    assert_eq!(a.srb(h).state(), SrbState::Disconnect);
    assert_eq!(
        a.bus().sg_table(SG_BASE).unwrap()[5],
        SgEntry::new(DATA_BUF + 0x5000, 0x1000)
    );

    a.bus_mut().reset_trace();
    reselect(&mut a, 0, 0);
    assert_eq!(a.nexus().unwrap().srb, h);
    assert_eq!(a.bus().last_command(), Some(ScsiCommand::MsgAccept));
    bus_service(&mut a, Phase::DataIn);
    assert_eq!(a.bus().writes(TrmReg::DmaXLowAddr), vec![SG_BASE + 40]);
    assert_eq!(a.bus().writes(TrmReg::DmaXCnt), vec![88]);
    assert_eq!(a.bus().writes(TrmReg::ScsiXCnt), vec![45056]);

    a.bus_mut().set(TrmReg::ScsiXCnt, 0);
    status(&mut a, STATUS_GOOD);
    assert!(a.srb(h).sg().exhausted());
    assert_eq!(a.srb(h).transferred(), 65536);
    message_in(&mut a, &[msg::CMDCOMPLETE]);
    disconnect(&mut a);

    let c = done.try_recv().unwrap();
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.resid, 0);
}

#[test]
fn queue_full_shrinks_queue() {
    let (mut a, done) = quiet_adapter();
    let c = scan(&mut a, &done, 0, &DISK_INQUIRY);
    assert_eq!(c.error, XferError::NoError);
    assert!(a.dcb(0, 0).unwrap().mode().tag_queuing());
    assert_eq!(a.dcb(0, 0).unwrap().maxcmd(), 32);

    let mut handles = vec![];
    for i in 0..4 {
        a.bus_mut().reset_trace();
        handles.push(a.submit(read(i, 0, 512)).unwrap());
        assert_eq!(a.bus().last_command(), Some(ScsiCommand::SelAtn3));
        assert_eq!(&a.bus().fifo_writes()[..3], &[0xC0, 0x20, i as u8]);
        disconnect_connected(&mut a);
    }
    assert_eq!(a.dcb(0, 0).unwrap().tagmask(), 0b1111);
    assert_tags(&a, 0);

    reselect(&mut a, 0, 0);
    message_in(&mut a, &[msg::SIMPLE_Q_TAG, 2]);
    assert_eq!(a.nexus().unwrap().srb, handles[2]);

    complete(&mut a, STATUS_QUEUE_FULL);
    let dcb = a.dcb(0, 0).unwrap();
    assert_eq!(dcb.maxcmd(), 3);
    assert_eq!(dcb.waiting().iter().copied().collect::<Vec<_>>(), vec![handles[2]]);
    assert_eq!(dcb.active().len(), 3);
    assert_eq!(dcb.tagmask(), 0b1011);
    assert_eq!(a.srb(handles[2]).tag(), None);
    assert_tags(&a, 0);
    assert!(done.try_recv().is_err());
}

#[test]
fn watchdog_resets_bus() {
    let (mut a, done) = quiet_adapter();
    a.submit(read(1, 0, 512).with_timeout(100)).unwrap();
    disconnect_connected(&mut a);
    a.submit(read(2, 1, 512).with_timeout(100)).unwrap();
    disconnect_connected(&mut a);

    a.tick(99).unwrap();
    assert!(done.try_recv().is_err());
    a.tick(1).unwrap();

    assert!(a.bus().wrote_bits(TrmReg::ScsiControl, DO_RSTSCSI));
    let failed = done.try_iter().collect::<Vec<_>>();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|c| c.error == XferError::Timeout));
    assert_eq!(a.dcb(0, 0).unwrap().tagmask(), 0);
    assert_eq!(a.dcb(1, 0).unwrap().tagmask(), 0);
    assert!(a.flags().reset_dev());
    assert!(a.reset_in_progress());

    bus_reset(&mut a);
    assert!(!a.reset_in_progress());
    assert_eq!(a.free_srbs(), 32);
}

const WRITE_10: [u8; 10] = [0x2A, 0, 0, 0, 0, 0, 0, 0, 16, 0];

/// Write of two 4K pages
fn write(id: u64, target: u8) -> Xfer {
    Xfer::new(id, target, 0, &WRITE_10).with_data(&[
        SgEntry::new(DATA_BUF, 0x1000),
        SgEntry::new(DATA_BUF + 0x1000, 0x1000),
    ])
}

#[test]
fn write_disconnects_with_fifo_residue() {
    let (mut a, done) = quiet_adapter();
    let h = a.submit(write(1, 0)).unwrap();

    bus_service(&mut a, Phase::DataOut);
    assert_eq!(a.bus().last_command(), Some(ScsiCommand::DmaOut));
    assert_eq!(a.bus().writes(TrmReg::ScsiXCnt), vec![8192]);

    // 4000 bytes never requested, 6 more stuck in the SCSI FIFO
    a.bus_mut().set(TrmReg::ScsiXCnt, 4000);
    a.bus_mut().set(TrmReg::ScsiFifoCnt, 6);
    a.bus_mut().reset_trace();
    message_in(&mut a, &[msg::SAVEDATAPOINTER, msg::DISCONNECT]);
    disconnect(&mut a);

    assert!(a.bus().wrote_bits(TrmReg::DmaControl, STOPDMAXFER));
    assert_eq!(a.srb(h).transferred(), 4186);
    assert_eq!(a.srb(h).buflen(), 4006);
    assert_eq!(a.srb(h).sg().index(), 1);
    assert_eq!(
        a.bus().sg_table(SG_BASE).unwrap()[1],
        SgEntry::new(DATA_BUF + 0x1000 + 90, 4006)
    );

    a.bus_mut().set(TrmReg::ScsiFifoCnt, 0x40);
    reselect(&mut a, 0, 0);
    a.bus_mut().reset_trace();
    bus_service(&mut a, Phase::DataOut);
    assert_eq!(a.bus().writes(TrmReg::DmaXLowAddr), vec![SG_BASE + 8]);
    assert_eq!(a.bus().writes(TrmReg::DmaXCnt), vec![8]);
    assert_eq!(a.bus().writes(TrmReg::ScsiXCnt), vec![4006]);

    a.bus_mut().set(TrmReg::ScsiXCnt, 0);
    complete(&mut a, STATUS_GOOD);
    let c = done.try_recv().unwrap();
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.resid, 0);
}

#[test]
fn wide_write_counts_fifo_words() {
    let (mut a, done) = adapter(config(NO_NEGO | ntc::DO_WIDE_NEGO), true);
    a.bus_mut().load_mem(INQUIRY_BUF, &DISK_INQUIRY);
    a.submit(inquiry(1, 0)).unwrap();
    bus_service(&mut a, Phase::MsgOut);
    message_in(&mut a, &[0x01, 0x02, 0x03, 0x01]);
    assert!(a.dcb(0, 0).unwrap().wide());
    bus_service(&mut a, Phase::Command);
    bus_service(&mut a, Phase::DataIn);
    a.bus_mut().set(TrmReg::ScsiXCnt, 0);
    complete(&mut a, STATUS_GOOD);
    assert_eq!(done.try_recv().unwrap().error, XferError::NoError);

    let h = a.submit(write(2, 0)).unwrap();
    bus_service(&mut a, Phase::DataOut);

    // Target stops early: 80 bytes never requested, 10 words in the FIFO
    a.bus_mut().set(TrmReg::ScsiXCnt, 80);
    a.bus_mut().set(TrmReg::ScsiFifoCnt, 10);
    a.bus_mut().reset_trace();
    complete(&mut a, STATUS_GOOD);

    assert!(a.bus().wrote_bits(TrmReg::DmaControl, STOPDMAXFER));
    let table = a.bus().sg_table(a.srb(h).sg_table_addr).unwrap();
    assert_eq!(table[1], SgEntry::new(DATA_BUF + 0x1000 + 3996, 100));
    let c = done.try_recv().unwrap();
    assert_eq!(c.id, 2);
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.resid, 100);
}

#[test]
fn write_single_byte_left_is_dropped() {
    let (mut a, done) = quiet_adapter();
    let h = a
        .submit(Xfer::new(1, 0, 0, &WRITE_10).with_data(&[SgEntry::new(DATA_BUF, 512)]))
        .unwrap();
    bus_service(&mut a, Phase::DataOut);

    // Odd byte left over in the counter, FIFO empty
    a.bus_mut().set(TrmReg::ScsiXCnt, 1);
    a.bus_mut().set(TrmReg::ScsiFifoCnt, 0x40);
    a.bus_mut().reset_trace();
    bus_service(&mut a, Phase::Status);

    assert!(a.bus().wrote_bits(TrmReg::ScsiControl, DO_CLRFIFO));
    assert!(a.bus().wrote_bits(TrmReg::DmaControl, STOPDMAXFER));
    assert_eq!(a.srb(h).transferred(), 512);
    assert_eq!(a.srb(h).buflen(), 0);
    assert!(a.srb(h).sg().exhausted());

    a.bus_mut().push_fifo(&[STATUS_GOOD]);
    bus_service(&mut a, Phase::MsgIn);
    message_in(&mut a, &[msg::CMDCOMPLETE]);
    disconnect(&mut a);
    let c = done.try_recv().unwrap();
    assert_eq!(c.error, XferError::NoError);
    assert_eq!(c.resid, 0);
}
