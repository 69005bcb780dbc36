use std::sync::mpsc;

use libdrift_scan::config::{Config, VoltageSweep};
use libdrift_scan::dataset::DatasetStore;
use libdrift_scan::features::PEAK_POSITION_NAME;
use libdrift_scan::manifest::{DatasetStatus, RunManifest};
use libdrift_scan::process::{analyze_run, run_simulated_scan, AnalyzeSummary};
use libdrift_scan::run_directory::RunDirectory;
use libdrift_scan::tree_file::TreeFileStore;
use libdrift_scan::worker_status::{ScanPhase, ScanStatus};

fn small_config(root: &std::path::Path) -> Config {
    let mut config = Config {
        runs_path: root.to_path_buf(),
        drift_voltages: VoltageSweep::List(vec![200.0, 400.0, 800.0]),
        n_sequences: 2,
        ..Default::default()
    };
    config.digitizer.n_segments = 25;
    config.analysis.fit_columns = vec![String::from("RT50"), String::from(PEAK_POSITION_NAME)];
    config
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn simulated_scan_analyzes_every_setpoint() {
    let root = tempfile::tempdir().unwrap();
    let config = small_config(root.path());
    let (tx, rx) = mpsc::channel::<ScanStatus>();

    let summary = run_simulated_scan(config.clone(), tx, 7).unwrap();

    assert_eq!(summary.run_number, 1);
    assert_eq!(summary.setpoints.len(), 3);
    assert_eq!(summary.jobs_dispatched, 3);
    assert_eq!(summary.reports.len(), 3);
    assert!(summary.failed_jobs.is_empty());
    for setpoint in summary.setpoints.iter() {
        assert_eq!(setpoint.n_events, 50);
        assert_eq!(setpoint.n_skipped, 0);
    }

    let statuses: Vec<ScanStatus> = rx.try_iter().collect();
    assert!(!statuses.is_empty());
    let last = statuses.last().unwrap();
    assert_eq!(last.phase, ScanPhase::Done);
    assert_eq!(last.progress, 1.0);
    assert!(statuses
        .windows(2)
        .all(|pair| pair[0].progress <= pair[1].progress));

    // Every dataset is on disk, augmented, and listed as analyzed
    let run = RunDirectory::open(root.path(), summary.run_number).unwrap();
    let manifest = RunManifest::load(&run.manifest_path()).unwrap();
    assert_eq!(manifest.datasets.len(), 3);
    assert!(manifest.pending().is_empty());
    let mut positions = Vec::new();
    for entry in manifest.datasets.iter() {
        assert_eq!(entry.status, DatasetStatus::Analyzed);
        assert_eq!(entry.n_events, 50);
        assert_eq!(entry.fits.len(), 2);
        let table = TreeFileStore.open(&run.dataset_path(&entry.file)).unwrap();
        assert_eq!(table.n_rows(), 50);
        let column = table.scalar(PEAK_POSITION_NAME).unwrap();
        positions.push(mean(&column.to_vec()));
    }

    // Higher drift fields mean earlier signals
    assert!(positions[0] > positions[1]);
    assert!(positions[1] > positions[2]);

    // The scan left nothing for an offline pass
    assert_eq!(
        analyze_run(&config, summary.run_number).unwrap(),
        AnalyzeSummary::default()
    );
}

#[test]
fn consecutive_scans_get_new_runs() {
    let root = tempfile::tempdir().unwrap();
    let mut config = small_config(root.path());
    config.drift_voltages = VoltageSweep::List(vec![500.0]);
    config.n_sequences = 1;

    let (tx, _rx) = mpsc::channel();
    let first = run_simulated_scan(config.clone(), tx, 1).unwrap();
    let (tx, _rx) = mpsc::channel();
    let second = run_simulated_scan(config, tx, 2).unwrap();

    assert_eq!(first.run_number, 1);
    assert_eq!(second.run_number, 2);
    assert_ne!(first.run_path, second.run_path);
    assert!(second.run_path.join("manifest.yml").exists());
}
