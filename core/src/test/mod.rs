//! Engine tests, driven through the scripted register file.
//!
//! The helpers below play the target's side of the bus: they set the
//! status registers the way the controller would and raise the interrupt.

mod scenarios;

use itertools::Itertools;

use crate::bus::testbus::TestRegs;
use crate::bus::{Address, TrmReg};
use crate::scsi::{STATUS_GOOD, msg};
use crate::trm::Adapter;
use crate::trm::config::{AdapterConfig, TargetConfig, nac, ntc};
use crate::trm::phase::Phase;
use crate::trm::regs::WIDESCSI;
use crate::trm::sg::SgEntry;
use crate::trm::xfer::{Completion, Xfer};
use crate::types::CompletionReceiver;

pub type TestAdapter = Adapter<TestRegs>;

pub const SG_BASE: Address = 0x8000;
pub const DATA_BUF: Address = 0x10_0000;
pub const SENSE_BUF: Address = 0x2_0000;
pub const INQUIRY_BUF: Address = 0x3_0000;

pub const READ_10: [u8; 10] = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
pub const INQUIRY: [u8; 6] = [0x12, 0, 0, 0, 36, 0];

/// SCSI-2 disk with command queuing
pub const DISK_INQUIRY: [u8; 8] = [0x00, 0x00, 0x02, 0x02, 0x1F, 0, 0, 0x02];

pub const INT_BUS_SERVICE: u8 = 0x02;
pub const INT_SCSI_RESET: u8 = 0x04;
pub const INT_RESELECTED: u8 = 0x08;
pub const INT_DISCONNECT: u8 = 0x10;
pub const INT_SEL_TIMEOUT: u8 = 0x20;

pub const STAT_PARITY: u16 = 0x08;

/// Target options without any negotiation
pub const NO_NEGO: u8 = ntc::DO_PARITY_CHK | ntc::DO_DISCONNECT | ntc::DO_TAG_QUEUING;

pub fn config(config0: u8) -> AdapterConfig {
    AdapterConfig {
        channel_cfg: nac::DO_PARITY_CHK,
        sg_table_base: SG_BASE,
        targets: [TargetConfig { config0, period: 0 }; 16],
        ..Default::default()
    }
}

pub fn adapter(config: AdapterConfig, wide: bool) -> (TestAdapter, CompletionReceiver) {
    let mut bus = TestRegs::new();
    if wide {
        bus.set(TrmReg::GenStatus, WIDESCSI);
    }
    bus.set(TrmReg::DmaStatus, 0x02);
    let (mut a, done) = Adapter::new(bus, config).unwrap();
    a.bus_mut().reset_trace();
    (a, done)
}

/// Narrow adapter whose targets never negotiate
pub fn quiet_adapter() -> (TestAdapter, CompletionReceiver) {
    adapter(config(NO_NEGO), false)
}

pub fn fire(a: &mut TestAdapter, stat: u16, intstat: u8) {
    a.bus_mut()
        .set(TrmReg::ScsiStatus, u32::from(0x80 | stat));
    a.bus_mut().set(TrmReg::ScsiIntStatus, intstat.into());
    assert!(a.interrupt());
}

pub fn bus_service(a: &mut TestAdapter, phase: Phase) {
    bus_service_with(a, phase, 0);
}

pub fn bus_service_with(a: &mut TestAdapter, phase: Phase, extra: u16) {
    fire(a, phase as u16 | extra, INT_BUS_SERVICE);
}

pub fn disconnect(a: &mut TestAdapter) {
    fire(a, Phase::BusFree as u16, INT_DISCONNECT);
}

pub fn sel_timeout(a: &mut TestAdapter) {
    fire(a, Phase::BusFree as u16, INT_SEL_TIMEOUT);
}

pub fn bus_reset(a: &mut TestAdapter) {
    fire(a, Phase::BusFree as u16, INT_SCSI_RESET);
}

pub fn reselect(a: &mut TestAdapter, target: u8, lun: u8) {
    a.bus_mut().set(TrmReg::ScsiTargetId, target.into());
    a.bus_mut().set(TrmReg::ScsiIdMsg, u32::from(0x80 | lun));
    fire(a, Phase::MsgIn as u16, INT_RESELECTED);
}

/// Target switches to message-in and sends `bytes`, one REQ at a time
pub fn message_in(a: &mut TestAdapter, bytes: &[u8]) {
    for &b in bytes {
        bus_service(a, Phase::MsgIn);
        a.bus_mut().push_fifo(&[b]);
        bus_service(a, Phase::MsgIn);
    }
}

/// Status phase, `extra` is added to the interrupt closing the previous phase
pub fn status_with(a: &mut TestAdapter, status: u8, extra: u16) {
    bus_service_with(a, Phase::Status, extra);
    a.bus_mut().push_fifo(&[status]);
    bus_service(a, Phase::MsgIn);
}

pub fn status(a: &mut TestAdapter, status: u8) {
    status_with(a, status, 0);
}

/// Status, COMMAND COMPLETE and bus free
pub fn complete(a: &mut TestAdapter, st: u8) {
    status(a, st);
    message_in(a, &[msg::CMDCOMPLETE]);
    disconnect(a);
}

/// Connected command receives DISCONNECT and the bus goes free
pub fn disconnect_connected(a: &mut TestAdapter) {
    message_in(a, &[msg::DISCONNECT]);
    disconnect(a);
}

pub fn read(id: u64, target: u8, len: u32) -> Xfer {
    Xfer::new(id, target, 0, &READ_10)
        .with_data(&[SgEntry::new(DATA_BUF + (id as Address) * 0x1_0000, len)])
}

pub fn inquiry(id: u64, target: u8) -> Xfer {
    Xfer::new(id, target, 0, &INQUIRY).with_data(&[SgEntry::new(INQUIRY_BUF, 36)])
}

/// Runs an INQUIRY that reports `data` through a full bus sequence
pub fn scan(
    a: &mut TestAdapter,
    done: &CompletionReceiver,
    target: u8,
    data: &[u8],
) -> Completion {
    a.bus_mut().load_mem(INQUIRY_BUF, data);
    a.bus_mut().set(TrmReg::ScsiXCnt, 0);
    a.submit(inquiry(1000 + u64::from(target), target)).unwrap();
    bus_service(a, Phase::DataIn);
    complete(a, STATUS_GOOD);
    done.try_recv().unwrap()
}

/// Every active SRB holds its own tag and the mask agrees with the queue
pub fn assert_tags(a: &TestAdapter, target: u8) {
    let dcb = a.dcb(target, 0).unwrap();
    let tags = dcb
        .active()
        .iter()
        .map(|&h| a.srb(h).tag().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(tags.iter().unique().count(), tags.len());
    assert_eq!(dcb.tagmask().count_ones() as usize, dcb.active().len());
    for t in tags {
        assert_ne!(dcb.tagmask() & (1 << t), 0);
    }
}
