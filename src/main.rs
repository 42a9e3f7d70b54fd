//! mesowall entry point
//!
//! Usage: `mesowall [config.json]`, or `mesowall --print-default` to emit
//! the built-in channel flow setup. Without a config the default runs.

use std::process::ExitCode;

use mesowall::{Result, SimulationConfig};

fn run() -> Result<()> {
    let arg = std::env::args().nth(1);
    let config = match arg.as_deref() {
        Some("--print-default") => {
            println!("{}", SimulationConfig::default().to_json()?);
            return Ok(());
        }
        Some(path) => SimulationConfig::load(path)?,
        None => {
            log::info!("No configuration given, running the default channel flow");
            SimulationConfig::default()
        }
    };

    let mut sim = config.build()?;
    let chunk = config.steps.clamp(1, 100);
    let mut done = 0;
    while done < config.steps {
        let n = chunk.min(config.steps - done);
        let report = sim.run(n)?.check()?;
        done += n;
        log::info!(
            "step {} t = {:.4}: {} bounced, {} rescued",
            report.step,
            report.time,
            report.bounced,
            report.rescued
        );
    }

    for name in sim.vector_names() {
        if let Some(set) = sim.vector(name) {
            log::info!(
                "'{}': {} particles, mean velocity {:.4}",
                name,
                set.len(),
                set.mean_velocity()
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    log::info!("mesowall starting...");
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
