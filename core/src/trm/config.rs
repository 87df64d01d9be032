//! Adapter parameters, as stored in the card's NVRAM

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::Address;

/// Per-target `config0` bits
pub mod ntc {
    pub const DO_PARITY_CHK: u8 = 0x01;
    pub const DO_SYNC_NEGO: u8 = 0x02;
    pub const DO_DISCONNECT: u8 = 0x04;
    pub const DO_SEND_START: u8 = 0x08;
    pub const DO_TAG_QUEUING: u8 = 0x10;
    pub const DO_WIDE_NEGO: u8 = 0x20;
}

/// Channel configuration bits
pub mod nac {
    pub const GT2DRIVES: u8 = 0x01;
    pub const GREATER_1G: u8 = 0x02;
    /// Reset the bus when the adapter is brought up
    pub const POWERON_SCSI_RESET: u8 = 0x04;
    pub const DO_PARITY_CHK: u8 = 0x08;
    pub const SCANLUN: u8 = 0x20;
}

/// Tagged commands per device the tag mask can track
pub const MAX_TAGS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Negotiation and queuing options, see [`ntc`]
    pub config0: u8,
    /// Index into the clock period table
    pub period: u8,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            // Everything but spin-up, plus the undocumented bit 6
            config0: 0x77,
            period: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Our own ID on the bus
    pub scsi_id: u8,
    /// Tag depth exponent; devices get `2 << max_tag` tags
    pub max_tag: u8,
    /// See [`nac`]
    pub channel_cfg: u8,
    pub targets: [TargetConfig; 16],
    /// Bus address of the SRB scatter-gather tables
    pub sg_table_base: Address,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            scsi_id: 7,
            max_tag: 4,
            channel_cfg: nac::GT2DRIVES | nac::GREATER_1G | nac::POWERON_SCSI_RESET | nac::DO_PARITY_CHK,
            targets: [TargetConfig::default(); 16],
            sg_table_base: 0,
        }
    }
}

impl AdapterConfig {
    /// Loads a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(f))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scsi_id > 15 {
            bail!("Adapter SCSI ID out of range: {}", self.scsi_id);
        }
        if self.targets.iter().any(|t| t.period > 7) {
            bail!("Period index out of range");
        }
        Ok(())
    }

    /// Maximum tagged commands per device
    pub fn maxtag(&self) -> usize {
        (2usize << self.max_tag.min(5)).min(MAX_TAGS)
    }

    pub fn parity(&self) -> bool {
        self.channel_cfg & nac::DO_PARITY_CHK != 0
    }

    pub fn reset_on_attach(&self) -> bool {
        self.channel_cfg & nac::POWERON_SCSI_RESET != 0
    }
}
