//! Scripted bus scenarios for the TRM-S1040 engine.
//!
//! A scenario is a JSON file holding an adapter configuration, an initial
//! DMA memory image and a list of steps that play the target's side of the
//! bus against the scripted register file. Completions are collected and
//! checked against the expectations listed in the scenario.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::*;
use serde::{Deserialize, Serialize};

use trm_core::bus::testbus::TestRegs;
use trm_core::bus::{Address, TrmReg};
use trm_core::debuggable::{Debuggable, DebuggableProperties, DebuggablePropertyValue};
use trm_core::tickable::{Tickable, Ticks};
use trm_core::trm::config::AdapterConfig;
use trm_core::trm::phase::Phase;
use trm_core::trm::regs::WIDESCSI;
use trm_core::trm::xfer::{Completion, Xfer, XferError};
use trm_core::trm::Adapter;
use trm_core::types::CompletionReceiver;

const INT_BUS_SERVICE: u32 = 0x02;
const INT_SCSI_RESET: u32 = 0x04;
const INT_RESELECTED: u32 = 0x08;
const INT_DISCONNECT: u32 = 0x10;
const INT_SEL_TIMEOUT: u32 = 0x20;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MemoryImage {
    pub address: Address,
    pub data: Vec<u8>,
}

/// One action of the simulated target or the midlayer
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Step {
    /// Midlayer submits a command
    Submit(Xfer),
    /// Sets what a register reads back
    Set { reg: TrmReg, value: u32 },
    /// Queues bytes to be read from the SCSI FIFO
    Fifo(Vec<u8>),
    /// Bus service interrupt in `phase`, `status` holds extra status bits
    BusService {
        phase: Phase,
        #[serde(default)]
        status: u16,
    },
    /// Message-in bytes, one request each
    MessageIn(Vec<u8>),
    Disconnect,
    SelectionTimeout,
    BusReset,
    Reselect { target: u8, lun: u8 },
    Tick(Ticks),
    Abort { target: u8, lun: u8 },
}

/// Expected completion of a command
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Expectation {
    pub id: u64,
    pub error: XferError,
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub resid: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Scenario {
    pub config: AdapterConfig,
    /// Card reports a wide bus
    pub wide: bool,
    pub memory: Vec<MemoryImage>,
    pub steps: Vec<Step>,
    pub expect: Vec<Expectation>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
        Ok(serde_json::from_reader(BufReader::new(f))?)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ScenarioResult {
    Pass,
    Failed(Vec<String>),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub completions: Vec<Completion>,
    pub result: ScenarioResult,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Report {
    pub scenarios: Vec<ScenarioReport>,
}

/// Plays scenario steps against an adapter on the scripted register file
pub struct Runner {
    adapter: Adapter<TestRegs>,
    done: CompletionReceiver,
    completions: Vec<Completion>,
}

impl Runner {
    pub fn new(scenario: &Scenario) -> Result<Self> {
        let mut bus = TestRegs::new();
        if scenario.wide {
            bus.set(TrmReg::GenStatus, WIDESCSI);
        }
        // DMA engine idle
        bus.set(TrmReg::DmaStatus, 0x02);
        for m in &scenario.memory {
            bus.load_mem(m.address, &m.data);
        }
        let (adapter, done) = Adapter::new(bus, scenario.config.clone())?;
        Ok(Self {
            adapter,
            done,
            completions: vec![],
        })
    }

    pub fn adapter(&self) -> &Adapter<TestRegs> {
        &self.adapter
    }

    fn fire(&mut self, status: u16, intstat: u32) -> Result<()> {
        let bus = self.adapter.bus_mut();
        bus.set(TrmReg::ScsiStatus, 0x80 | u32::from(status));
        bus.set(TrmReg::ScsiIntStatus, intstat);
        if !self.adapter.interrupt() {
            bail!("Interrupt not taken");
        }
        Ok(())
    }

    fn bus_service(&mut self, phase: Phase, status: u16) -> Result<()> {
        self.fire(phase as u16 | status, INT_BUS_SERVICE)
    }

    pub fn step(&mut self, step: &Step) -> Result<()> {
        trace!("Step {:?}", step);
        match step {
            Step::Submit(xfer) => {
                self.adapter.submit(xfer.clone());
            }
            Step::Set { reg, value } => self.adapter.bus_mut().set(*reg, *value),
            Step::Fifo(data) => self.adapter.bus_mut().push_fifo(data),
            Step::BusService { phase, status } => self.bus_service(*phase, *status)?,
            Step::MessageIn(bytes) => {
                for &b in bytes {
                    self.bus_service(Phase::MsgIn, 0)?;
                    self.adapter.bus_mut().push_fifo(&[b]);
                    self.bus_service(Phase::MsgIn, 0)?;
                }
            }
            Step::Disconnect => self.fire(Phase::BusFree as u16, INT_DISCONNECT)?,
            Step::SelectionTimeout => self.fire(Phase::BusFree as u16, INT_SEL_TIMEOUT)?,
            Step::BusReset => self.fire(Phase::BusFree as u16, INT_SCSI_RESET)?,
            Step::Reselect { target, lun } => {
                let bus = self.adapter.bus_mut();
                bus.set(TrmReg::ScsiTargetId, u32::from(*target));
                bus.set(TrmReg::ScsiIdMsg, 0x80 | u32::from(*lun));
                self.fire(Phase::MsgIn as u16, INT_RESELECTED)?;
            }
            Step::Tick(ticks) => {
                self.adapter.tick(*ticks)?;
            }
            Step::Abort { target, lun } => {
                if !self.adapter.abort_device(*target, *lun) {
                    warn!("Abort of unknown device {}:{}", target, lun);
                }
            }
        }
        self.completions.extend(self.done.try_iter());
        Ok(())
    }

    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    /// Compares the completions seen against the expectations
    pub fn check(&self, expect: &[Expectation]) -> ScenarioResult {
        let mut failures = vec![];
        for e in expect {
            let Some(c) = self.completions.iter().find(|c| c.id == e.id) else {
                failures.push(format!("Command {} never completed", e.id));
                continue;
            };
            if c.error != e.error {
                failures.push(format!(
                    "Command {}: expected {:?}, got {:?}",
                    e.id, e.error, c.error
                ));
            }
            if e.status.is_some_and(|s| s != c.status) {
                failures.push(format!(
                    "Command {}: expected status {:02X?}, got {:02X}",
                    e.id, e.status, c.status
                ));
            }
            if e.resid.is_some_and(|r| r != c.resid) {
                failures.push(format!(
                    "Command {}: expected residual {:?}, got {}",
                    e.id, e.resid, c.resid
                ));
            }
        }
        if failures.is_empty() {
            ScenarioResult::Pass
        } else {
            ScenarioResult::Failed(failures)
        }
    }
}

/// Runs a whole scenario
pub fn run(name: &str, scenario: &Scenario) -> Result<ScenarioReport> {
    let mut runner = Runner::new(scenario)?;
    for (i, step) in scenario.steps.iter().enumerate() {
        runner
            .step(step)
            .with_context(|| format!("{}: step {} ({:?})", name, i, step))?;
    }
    Ok(ScenarioReport {
        name: name.to_string(),
        result: runner.check(&scenario.expect),
        completions: runner.completions,
    })
}

/// Renders debug properties as an indented listing
pub fn format_properties(props: &DebuggableProperties, indent: usize) -> String {
    let mut out = String::new();
    for p in props {
        match p.value() {
            DebuggablePropertyValue::Header => {
                out += &format!("{:indent$}== {} ==\n", "", p.name());
            }
            DebuggablePropertyValue::Nested(children) => {
                out += &format!("{:indent$}{}:\n", "", p.name());
                out += &format_properties(children, indent + 2);
            }
            v => out += &format!("{:indent$}{}: {}\n", "", p.name(), v),
        }
    }
    out
}

/// Debug listing of the adapter state after a scenario
pub fn adapter_state(runner: &Runner) -> String {
    format_properties(&runner.adapter().get_debug_properties(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ: &str = r#"{
        "config": { "channel_cfg": 8, "sg_table_base": 32768 },
        "steps": [
            { "Submit": { "id": 1, "target": 0, "lun": 0,
                "cdb": [40, 0, 0, 0, 0, 0, 0, 0, 1, 0],
                "sg": [{ "address": 1048576, "length": 512 }], "datalen": 512 } },
            { "BusService": { "phase": "DataIn" } },
            { "BusService": { "phase": "Status" } },
            { "Fifo": [0] },
            { "BusService": { "phase": "MsgIn" } },
            { "MessageIn": [0] },
            "Disconnect"
        ],
        "expect": [{ "id": 1, "error": "NoError", "status": 0, "resid": 0 }]
    }"#;

    #[test]
    fn read_scenario() {
        let scenario: Scenario = serde_json::from_str(READ).unwrap();
        let report = run("read", &scenario).unwrap();
        assert_eq!(report.result, ScenarioResult::Pass);
        assert_eq!(report.completions.len(), 1);
    }

    #[test]
    fn missing_completion() {
        let mut scenario: Scenario = serde_json::from_str(READ).unwrap();
        scenario.steps.pop();
        let report = run("read", &scenario).unwrap();
        assert!(matches!(report.result, ScenarioResult::Failed(f) if f.len() == 1));
    }

    #[test]
    fn busy_expected() {
        let mut scenario: Scenario = serde_json::from_str(READ).unwrap();
        scenario.expect[0].error = XferError::Busy;
        let report = run("read", &scenario).unwrap();
        assert!(matches!(report.result, ScenarioResult::Failed(_)));
    }

    #[test]
    fn bundled_scenarios() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let scenario = Scenario::load(&path).unwrap();
            let report = run(&path.display().to_string(), &scenario).unwrap();
            assert_eq!(report.result, ScenarioResult::Pass, "{}", path.display());
        }
    }

    #[test]
    fn state_listing() {
        let scenario: Scenario = serde_json::from_str(READ).unwrap();
        let mut runner = Runner::new(&scenario).unwrap();
        runner.step(&scenario.steps[0]).unwrap();
        let state = adapter_state(&runner);
        assert!(state.contains("== Adapter =="));
        assert!(state.contains("DCB 0:0:"));
    }
}
