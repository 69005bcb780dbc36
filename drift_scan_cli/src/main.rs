//! # drift_scan_cli
//!
//! Part of the drift_scan crate family.
//!
//! Command line driver for drift-velocity scans. Logging goes to `./drift_scan.log`, the
//! terminal only shows progress and the final summary.
//!
//! ## Use
//!
//! ```bash
//! drift_scan_cli -p config.yml new
//! drift_scan_cli -p config.yml scan --seed 4
//! drift_scan_cli -p config.yml analyze -r 3
//! ```
//!
//! `new` writes a template configuration, `scan` runs a full scan (against the simulated bench
//! in this build) and `analyze` picks up any dataset of a run that is not yet analyzed.
use clap::{value_parser, Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

use libdrift_scan::config::Config;
use libdrift_scan::process::{analyze_run, run_simulated_scan};
use libdrift_scan::worker_status::ScanStatus;

fn init_logging() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./drift_scan.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn load_config(config_path: &Path) -> Option<Config> {
    spdlog::info!("Loading config from {}...", config_path.display());
    match Config::read_config_file(config_path) {
        Ok(config) => {
            spdlog::info!("Config successfully loaded.");
            Some(config)
        }
        Err(e) => {
            spdlog::error!("{e}");
            eprintln!("{e}");
            None
        }
    }
}

fn scan(mut config: Config, seed: u64, segments: Option<u32>) -> ExitCode {
    if let Some(n_segments) = segments {
        config.digitizer.n_segments = n_segments;
    }
    spdlog::info!("Runs Path: {}", config.runs_path.display());
    spdlog::info!(
        "Drift gap: {} mm Mesh: {} V Sequences per setpoint: {} Segments per sequence: {}",
        config.drift_gap,
        config.mesh_voltage,
        config.n_sequences,
        config.digitizer.n_segments
    );

    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}% {msg}") {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel::<ScanStatus>();
    let handle = std::thread::spawn(move || run_simulated_scan(config, tx, seed));

    // The sender is dropped when the scan returns, which ends this loop
    for status in rx.iter() {
        pb.set_position((status.progress * 100.0) as u64);
        pb.set_message(format!(
            "setpoint {} ({:.1} V): {:?}",
            status.setpoint, status.drift_voltage, status.phase
        ));
    }
    pb.finish();

    match handle.join() {
        Ok(Ok(summary)) => {
            spdlog::info!("Scan finished, data is in {}", summary.run_path.display());
            println!(
                "Run {}: {} setpoints, {} analyzed, {} failed",
                summary.run_number,
                summary.setpoints.len(),
                summary.reports.len(),
                summary.failed_jobs.len()
            );
            for report in summary.reports.iter() {
                for fit in report.fits.iter() {
                    println!(
                        "  {} {}: center {:.3} width {:.3}",
                        report.file_name(),
                        fit.column,
                        fit.center,
                        fit.width
                    );
                }
            }
            for failed in summary.failed_jobs.iter() {
                println!("  {} failed: {}", failed.file, failed.reason);
            }
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            spdlog::error!("Scan failed with error: {e}");
            eprintln!("Scan failed with error: {e}");
            ExitCode::FAILURE
        }
        Err(_) => {
            spdlog::error!("Failed to join scan task!");
            eprintln!("Failed to join scan task!");
            ExitCode::FAILURE
        }
    }
}

fn analyze(config: Config, run_number: u32) -> ExitCode {
    match analyze_run(&config, run_number) {
        Ok(summary) => {
            println!(
                "Run {run_number}: {} analyzed, {} failed",
                summary.reports.len(),
                summary.failed.len()
            );
            for failed in summary.failed.iter() {
                println!("  {} failed: {}", failed.file, failed.reason);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            spdlog::error!("Analysis failed with error: {e}");
            eprintln!("Analysis failed with error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    // Create a cli
    let matches = Command::new("drift_scan_cli")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .global(true)
                .help("Path to the configuration file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("scan")
                .about("Run a drift voltage scan")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .default_value("0")
                        .help("Seed of the simulated bench"),
                )
                .arg(
                    Arg::new("segments")
                        .long("segments")
                        .value_parser(value_parser!(u32))
                        .help("Override the number of segments per sequence"),
                ),
        )
        .subcommand(
            Command::new("analyze")
                .about("Analyze the datasets of a run that are not yet analyzed")
                .arg(
                    Arg::new("run")
                        .short('r')
                        .long("run")
                        .required(true)
                        .value_parser(value_parser!(u32))
                        .help("Run number"),
                ),
        )
        .get_matches();

    if let Err(e) = init_logging() {
        eprintln!("Could not create logging: {e}");
        return ExitCode::FAILURE;
    }

    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        eprintln!("A configuration path is required");
        return ExitCode::FAILURE;
    };

    match matches.subcommand() {
        Some(("new", _)) => {
            spdlog::info!("Making a template config at {}...", config_path.display());
            match Config::default().write_config_file(&config_path) {
                Ok(()) => {
                    println!("Wrote template config to {}", config_path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    spdlog::error!("{e}");
                    eprintln!("{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Some(("scan", args)) => {
            let Some(config) = load_config(&config_path) else {
                return ExitCode::FAILURE;
            };
            let seed = args.get_one::<u64>("seed").copied().unwrap_or_default();
            let segments = args.get_one::<u32>("segments").copied();
            scan(config, seed, segments)
        }
        Some(("analyze", args)) => {
            let Some(config) = load_config(&config_path) else {
                return ExitCode::FAILURE;
            };
            let Some(run_number) = args.get_one::<u32>("run").copied() else {
                return ExitCode::FAILURE;
            };
            analyze(config, run_number)
        }
        _ => {
            eprintln!("Unknown command, see --help");
            ExitCode::FAILURE
        }
    }
}
