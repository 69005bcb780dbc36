//! # drift_scan
//!
//! drift_scan runs drift-velocity scans on a gas detector test bench. For every drift voltage
//! in a scan plan it ramps the mesh and drift high voltage channels, waits for them to settle,
//! captures a fixed number of trigger sequences from a segmented-memory digitizer, and writes
//! the traces to one dataset per setpoint. While the next setpoint is being captured, the
//! previous dataset is analyzed in the background: each waveform is reduced to its peak and
//! rise-time crossings, and the timing distributions are fitted with a Gaussian.
//!
//! ## Building & Install
//!
//! To build and install the CLI use `cargo install --path ./drift_scan_cli` from the top level
//! repository. The default dataset format needs no system libraries. To enable the HDF5 dataset
//! store build with `--features libdrift_scan/hdf5`; HDF5 must then be installed, as for any
//! crate linking against `hdf5`.
//!
//! ## Configuration
//!
//! A configuration is a YAML file. `drift_scan_cli new -p config.yml` writes a template holding
//! the reference bench setup:
//!
//! ```yml
//! runs_path: runs
//! store: Tree
//! drift_gap: 10.0
//! mesh_voltage: 340.0
//! drift_voltages:
//!   start: 95.0
//!   stop: 815.0
//!   step: 15.0
//! concentration: null
//! ramp_up: 20.0
//! ramp_down: 20.0
//! settle_timeout_s: 60.0
//! n_sequences: 8
//! digitizer:
//!   trigger_mode: Stopped
//!   sample_mode: Sequence
//!   n_segments: 2500
//!   timeout_s: 600.0
//!   channels: [2, 3]
//! analysis:
//!   channel: CH3
//!   rise_time_fractions: [0.05, 0.1, ...]
//!   smoothing_window: 50
//!   n_bins: 50
//!   outlier_threshold: 10.0
//!   fit_columns: [RT10, RT50, RT90, peak_position]
//! ```
//!
//! `drift_voltages` is either a `{start, stop, step}` range (stop excluded) or an explicit list.
//!
//! ## Output
//!
//! Each scan allocates the next free `run_NNNN` directory under `runs_path`. Inside it:
//!
//! ```text
//! run_0001
//! |---- manifest.yml
//! |---- gap_10.0_mesh_340.0_drift_95.0.tree
//! |---- gap_10.0_mesh_340.0_drift_110.0.tree
//! |---- ...
//! ```
//!
//! Every dataset holds one row per captured segment with the columns `time`, `CH<n>` for each
//! captured channel, and the setpoint metadata `drift_voltage`, `mesh_voltage`, `drift_gap`
//! (and `concentration` if configured). Analysis appends `peak_position`, `peak_height`,
//! `peak_base` and one `RT<pct>` column per rise-time fraction. The manifest records for each
//! dataset its setpoint, event count, whether it is raw, analyzed or failed, and the fit results.
//! Datasets the manifest does not list as analyzed can be picked up later with
//! `drift_scan_cli analyze`.
pub mod analysis;
pub mod capture;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod fitter;
#[cfg(feature = "hdf5")]
pub mod hdf_store;
pub mod instrument;
pub mod manifest;
pub mod pipeline;
pub mod process;
pub mod run_directory;
pub mod scan;
pub mod scan_plan;
pub mod simulation;
pub mod tree_file;
pub mod worker_status;
