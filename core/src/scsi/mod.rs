//! SCSI-2 protocol constants shared by the engine

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_CONDITION_MET: u8 = 0x04;
pub const STATUS_BUSY: u8 = 0x08;
pub const STATUS_INTERMEDIATE: u8 = 0x10;
pub const STATUS_RESERVATION_CONFLICT: u8 = 0x18;
pub const STATUS_QUEUE_FULL: u8 = 0x28;

pub const CMD_TEST_UNIT_READY: u8 = 0x00;
pub const CMD_REQUEST_SENSE: u8 = 0x03;
pub const CMD_INQUIRY: u8 = 0x12;

/// Length of the sense buffer requested by auto request-sense
pub const SENSE_LEN: usize = 32;

/// Message codes
pub mod msg {
    pub const CMDCOMPLETE: u8 = 0x00;
    pub const EXTENDED: u8 = 0x01;
    pub const SAVEDATAPOINTER: u8 = 0x02;
    pub const RESTOREPOINTERS: u8 = 0x03;
    pub const DISCONNECT: u8 = 0x04;
    pub const ABORT: u8 = 0x06;
    pub const MESSAGE_REJECT: u8 = 0x07;
    pub const NOOP: u8 = 0x08;
    pub const PARITY_ERROR: u8 = 0x09;
    pub const BUS_DEV_RESET: u8 = 0x0C;
    pub const ABORT_TAG: u8 = 0x0D;
    pub const SIMPLE_Q_TAG: u8 = 0x20;
    pub const HEAD_OF_Q_TAG: u8 = 0x21;
    pub const ORDERED_Q_TAG: u8 = 0x22;
    pub const IGN_WIDE_RESIDUE: u8 = 0x23;

    pub const IDENTIFY: u8 = 0x80;
    pub const IDENTIFY_DISCFLAG: u8 = 0x40;

    /// Extended message codes
    pub const EXT_SDTR: u8 = 0x01;
    pub const EXT_SDTR_LEN: u8 = 3;
    pub const EXT_WDTR: u8 = 0x03;
    pub const EXT_WDTR_LEN: u8 = 2;

    pub const WDTR_BUS_8_BIT: u8 = 0;
    pub const WDTR_BUS_16_BIT: u8 = 1;
    pub const WDTR_BUS_32_BIT: u8 = 2;

    /// Builds an IDENTIFY message
    pub const fn identify(lun: u8, disconnect: bool) -> u8 {
        let disc = if disconnect { IDENTIFY_DISCFLAG } else { 0 };
        IDENTIFY | disc | (lun & 7)
    }
}

/// Peripheral device types, from byte 0 of INQUIRY data
pub mod devtype {
    pub const DIRECT: u8 = 0x00;
    pub const SEQUENTIAL: u8 = 0x01;
    pub const OPTICAL: u8 = 0x07;
    pub const NODEVICE: u8 = 0x1F;
}

/// Standard INQUIRY data, the fields the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryData {
    pub device_type: u8,
    pub version: u8,
    pub response_format: u8,
    pub cmdque: bool,
}

impl InquiryData {
    /// Bytes needed to decode
    pub const LEN: usize = 8;

    pub fn parse(data: &[u8; Self::LEN]) -> Self {
        Self {
            device_type: data[0] & 0x1F,
            version: data[2] & 0x07,
            response_format: data[3] & 0x0F,
            cmdque: data[7] & 0x02 != 0,
        }
    }

    /// SCSI-2 or later device that accepts tagged commands
    pub fn supports_tagging(&self) -> bool {
        matches!(self.device_type, devtype::DIRECT | devtype::OPTICAL)
            && (self.version >= 2 || self.response_format == 2)
            && self.cmdque
    }
}

/// Length of a CDB by its group code
pub const fn scsi_cmd_len(cmdnum: u8) -> Option<usize> {
    match cmdnum >> 5 {
        // Group 0
        0 => Some(6),
        // Groups 1 and 2
        1 | 2 => Some(10),
        // Group 5
        5 => Some(12),
        // Reserved and vendor specific groups
        _ => None,
    }
}
