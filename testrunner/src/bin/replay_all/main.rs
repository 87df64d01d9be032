use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use log::*;

use trm_testrunner::{run, Report, Scenario, ScenarioReport, ScenarioResult};

#[derive(Parser)]
struct Args {
    scenario_dir: PathBuf,
    output_dir: PathBuf,

    #[arg(short('j'), default_value_t = num_cpus::get())]
    parallel: usize,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();
    let args = Args::parse();

    // Collect scenarios
    let scenarios = fs::read_dir(&args.scenario_dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<Vec<_>, std::io::Error>>()?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .sorted()
        .collect::<Vec<_>>();

    let report = Arc::new(Mutex::new(Report::default()));
    info!(
        "Collected {} scenarios, running {} in parallel",
        scenarios.len(),
        args.parallel
    );
    let pool = rusty_pool::ThreadPool::new(args.parallel, args.parallel, Duration::from_secs(60));
    let start_time = Instant::now();

    for path in scenarios {
        let t_report = Arc::clone(&report);
        pool.execute(move || {
            let name = path
                .file_stem()
                .map_or_else(String::new, |s| s.to_string_lossy().to_string());
            let result = Scenario::load(&path).and_then(|s| run(&name, &s));
            let scenario_report = match result {
                Ok(r) => r,
                Err(e) => ScenarioReport {
                    name: name.clone(),
                    completions: vec![],
                    result: ScenarioResult::Failed(vec![format!("{:#}", e)]),
                },
            };
            match &scenario_report.result {
                ScenarioResult::Pass => info!("{}: pass", name),
                ScenarioResult::Failed(f) => error!("{}: {}", name, f.join("; ")),
            }
            if let Ok(mut r) = t_report.lock() {
                r.scenarios.push(scenario_report);
            }
        });
    }
    pool.shutdown_join();

    let report = report
        .lock()
        .map_err(|_| anyhow::anyhow!("Report lock poisoned"))?;
    let failed = report
        .scenarios
        .iter()
        .filter(|s| s.result != ScenarioResult::Pass)
        .count();
    fs::create_dir_all(&args.output_dir)?;
    fs::write(
        args.output_dir.join("report.json"),
        serde_json::to_string(&*report)?,
    )?;
    info!(
        "{} scenarios, {} failed, completed in {:?}",
        report.scenarios.len(),
        failed,
        Instant::now() - start_time
    );

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
