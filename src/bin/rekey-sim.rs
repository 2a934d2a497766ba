use clap::Parser;
use log::{error, info};
use rgrekey::cli::{load_config_and_kek, run_scenarios, write_status, CommonArgs};
use rgrekey::sim::Scenario;
use rgrekey::{rekey_error, Result};

#[derive(Parser)]
#[command(
    name = "rekey-sim",
    version,
    author,
    about = "Run online rekey scenarios against simulated raid groups.",
    long_about = r#"Run online rekey scenarios against simulated raid groups and print a JSON report.

Examples:
  # Every scenario on the built-in raid groups
  rekey-sim

  # Rekey the raid groups of a config file on four workers
  rekey-sim -f raid-groups.yaml --scenario rekey --workers 4

  # A single fault scenario
  rekey-sim --scenario controller-crash"#
)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Scenario to run. All scenarios run when absent.
    #[arg(short = 's', long = "scenario", value_enum)]
    scenario: Option<Scenario>,

    /// Number of scheduler worker threads per controller.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,
}

fn main() {
    env_logger::builder().format_timestamp(None).init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();
    let (mut config, kek) = load_config_and_kek(&args.common)?;
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    let status_path = config.status_path.clone();

    let reports = run_scenarios(config, kek, args.scenario)?;
    let json = serde_json::to_string_pretty(&reports).map_err(|e| {
        rekey_error!(InvalidParameter {
            description: format!("Failed to encode report: {e}"),
        })
    })?;
    println!("{json}");
    if let Some(path) = status_path {
        write_status(&path, &reports)?;
    }

    let failed = reports.iter().filter(|r| !r.passed).count();
    info!("{} scenario(s) run, {failed} failed", reports.len());
    Ok(failed == 0)
}
