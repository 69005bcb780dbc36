use std::sync::mpsc::Sender;

use super::analysis::{AnalysisJob, AnalysisReport, DatasetAnalyzer};
use super::config::{Config, StoreFormat};
use super::dataset::DatasetStore;
#[cfg(not(feature = "hdf5"))]
use super::error::ConfigError;
use super::error::{AnalysisError, ProcessorError};
#[cfg(feature = "hdf5")]
use super::hdf_store::Hdf5Store;
use super::manifest::RunManifest;
use super::run_directory::RunDirectory;
use super::scan::{FailedJob, ScanController, ScanSummary};
use super::simulation::{SimulatedDigitizer, SimulatedPowerSupply};
use super::tree_file::TreeFileStore;
use super::worker_status::ScanStatus;

/// Result of an offline analysis pass over a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzeSummary {
    pub reports: Vec<AnalysisReport>,
    pub failed: Vec<FailedJob>,
}

#[cfg(not(feature = "hdf5"))]
fn hdf5_unavailable() -> ConfigError {
    ConfigError::Invalid(String::from(
        "the hdf5 store was requested but this build does not include the hdf5 feature",
    ))
}

fn simulated_scan_with<S: DatasetStore + Clone + 'static>(
    config: Config,
    tx: Sender<ScanStatus>,
    seed: u64,
    store: S,
) -> Result<ScanSummary, ProcessorError> {
    let mesh = SimulatedPowerSupply::new("mesh");
    let drift = SimulatedPowerSupply::new("drift");
    let digitizer = SimulatedDigitizer::new(seed, drift.probe(), config.drift_gap);
    let job = AnalysisJob::new(store.clone(), &config.analysis);
    let controller =
        ScanController::new(config, digitizer, mesh, drift, store, job)?.with_status(tx);
    Ok(controller.run()?)
}

/// Run a full scan against the simulated bench.
///
/// This is the dry run used by the CLI; a real bench plugs its own Digitizer and
/// PowerSupplyChannel implementations into a ScanController the same way.
pub fn run_simulated_scan(
    config: Config,
    tx: Sender<ScanStatus>,
    seed: u64,
) -> Result<ScanSummary, ProcessorError> {
    match config.store {
        StoreFormat::Tree => simulated_scan_with(config, tx, seed, TreeFileStore),
        #[cfg(feature = "hdf5")]
        StoreFormat::Hdf5 => simulated_scan_with(config, tx, seed, Hdf5Store),
        #[cfg(not(feature = "hdf5"))]
        StoreFormat::Hdf5 => Err(hdf5_unavailable().into()),
    }
}

fn analyze_run_with<S: DatasetStore + Clone + 'static>(
    config: &Config,
    run_number: u32,
    store: S,
) -> Result<AnalyzeSummary, ProcessorError> {
    let run = RunDirectory::open(&config.runs_path, run_number)?;
    let mut manifest = RunManifest::load(&run.manifest_path())?;
    let job = AnalysisJob::new(store.clone(), &config.analysis);
    let pending: Vec<String> = manifest
        .pending()
        .iter()
        .map(|entry| entry.file.clone())
        .collect();
    spdlog::info!(
        "Run {} has {} datasets awaiting analysis",
        run.number(),
        pending.len()
    );

    let mut summary = AnalyzeSummary::default();
    for file in pending {
        let outcome = store
            .inspect(&run.dataset_path(&file))
            .map_err(AnalysisError::from)
            .and_then(|dataset| job.analyze(&dataset));
        match outcome {
            Ok(report) => {
                manifest.mark_analyzed(&report)?;
                summary.reports.push(report);
            }
            Err(e) => {
                let reason = e.to_string();
                spdlog::error!("Analysis of {file} failed: {reason}");
                manifest.mark_failed(&file, &reason)?;
                summary.failed.push(FailedJob { file, reason });
            }
        }
        manifest.save()?;
    }
    Ok(summary)
}

/// Analyze every dataset of a run that the manifest lists as not yet analyzed
pub fn analyze_run(config: &Config, run_number: u32) -> Result<AnalyzeSummary, ProcessorError> {
    match config.store {
        StoreFormat::Tree => analyze_run_with(config, run_number, TreeFileStore),
        #[cfg(feature = "hdf5")]
        StoreFormat::Hdf5 => analyze_run_with(config, run_number, Hdf5Store),
        #[cfg(not(feature = "hdf5"))]
        StoreFormat::Hdf5 => Err(hdf5_unavailable().into()),
    }
}
