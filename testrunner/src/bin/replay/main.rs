use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::*;

use trm_testrunner::{adapter_state, Runner, Scenario, ScenarioResult};

#[derive(Parser)]
struct Args {
    scenario: PathBuf,

    /// Print the adapter state after every step
    #[arg(long)]
    trace_state: bool,

    /// Write the completions as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();

    let scenario = Scenario::load(&args.scenario)?;
    let mut runner = Runner::new(&scenario)?;
    info!(
        "Running {} ({} steps)",
        args.scenario.display(),
        scenario.steps.len()
    );

    for (i, step) in scenario.steps.iter().enumerate() {
        runner
            .step(step)
            .with_context(|| format!("Step {} ({:?})", i, step))?;
        if args.trace_state {
            println!("--- after step {}: {:?}", i, step);
            print!("{}", adapter_state(&runner));
        }
    }

    for c in runner.completions() {
        let error: &'static str = c.error.into();
        let host: &'static str = c.host_status.into();
        println!(
            "{:>4} {}:{} {:<16} host {:<18} status {:02X} resid {}",
            c.id, c.target, c.lun, error, host, c.status, c.resid
        );
        if let Some(sense) = &c.sense {
            println!("     sense {:02X?}", sense);
        }
    }
    print!("{}", adapter_state(&runner));

    if let Some(json) = &args.json {
        std::fs::write(json, serde_json::to_string_pretty(runner.completions())?)?;
    }

    match runner.check(&scenario.expect) {
        ScenarioResult::Pass => Ok(()),
        ScenarioResult::Failed(failures) => {
            for f in &failures {
                error!("{}", f);
            }
            std::process::exit(1);
        }
    }
}
