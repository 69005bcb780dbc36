//! The scan controller.
//!
//! A scan walks the plan setpoint by setpoint: ramp both high voltage channels, wait for them to
//! settle, capture a fixed number of trigger sequences into the setpoint's dataset, close the
//! dataset and hand it to the analysis pipeline. The analysis of one setpoint overlaps with the
//! capture of the next; the pipeline never holds more than one job.
//!
//! However the scan ends, both channels are commanded off exactly once and the last analysis
//! job is joined.
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use super::analysis::{AnalysisReport, DatasetAnalyzer};
use super::config::Config;
use super::dataset::{DatasetStore, SetpointDataset};
use super::error::{DatasetError, ManifestError, PowerSupplyError, ScanError};
use super::instrument::{Digitizer, PowerSupplyChannel};
use super::manifest::RunManifest;
use super::pipeline::{AnalysisPipeline, FinishedJob};
use super::run_directory::RunDirectory;
use super::scan_plan::{ScanPlan, Setpoint};
use super::worker_status::{ScanPhase, ScanStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Init,
    Ramping,
    Settling,
    Capturing,
    Finalizing,
    Dispatching,
    Done,
    Aborting,
    Shutdown,
}

impl Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Ramping => "RAMPING",
            Self::Settling => "SETTLING",
            Self::Capturing => "CAPTURING",
            Self::Finalizing => "FINALIZING",
            Self::Dispatching => "DISPATCHING",
            Self::Done => "DONE",
            Self::Aborting => "ABORTING",
            Self::Shutdown => "SHUTDOWN",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one scan step. Only Fatal ends the scan
#[derive(Debug)]
pub enum Step<T> {
    Done(T),
    Skipped(String),
    Fatal(ScanError),
}

/// Owns the mesh and drift channels for the length of a scan.
///
/// shutdown turns both channels off, drift first, and only ever does so once. Dropping a
/// session that was not shut down shuts it down.
#[derive(Debug)]
pub struct HvSession<P: PowerSupplyChannel> {
    mesh: P,
    drift: P,
    is_off: bool,
}

impl<P: PowerSupplyChannel> HvSession<P> {
    pub fn new(mesh: P, drift: P) -> Self {
        Self {
            mesh,
            drift,
            is_off: false,
        }
    }

    pub fn set_ramp_rate(&mut self, up: f64, down: f64) -> Result<(), PowerSupplyError> {
        self.mesh.set_ramp_rate(up, down)?;
        self.drift.set_ramp_rate(up, down)?;
        Ok(())
    }

    /// Set both targets and make sure both channels are on
    pub fn ramp_to(
        &mut self,
        mesh_voltage: f64,
        drift_voltage: f64,
    ) -> Result<(), PowerSupplyError> {
        self.mesh.set_target(mesh_voltage)?;
        self.drift.set_target(drift_voltage)?;
        self.mesh.turn_on()?;
        self.drift.turn_on()?;
        Ok(())
    }

    /// Wait for the drift channel, then the mesh channel, each bounded by timeout
    pub fn settle(&mut self, timeout: Duration) -> Result<(), PowerSupplyError> {
        self.drift.wait_for_target(timeout)?;
        self.mesh.wait_for_target(timeout)?;
        Ok(())
    }

    pub fn is_off(&self) -> bool {
        self.is_off
    }

    /// Turn both channels off. Both are attempted even if the first fails; the first error is
    /// returned. Later calls do nothing.
    pub fn shutdown(&mut self) -> Result<(), PowerSupplyError> {
        if self.is_off {
            return Ok(());
        }
        self.is_off = true;
        let drift = self.drift.turn_off();
        let mesh = self.mesh.turn_off();
        match (&drift, &mesh) {
            (Ok(()), Ok(())) => spdlog::info!(
                "High voltage off ({} and {})",
                self.drift.name(),
                self.mesh.name()
            ),
            _ => spdlog::error!("High voltage shutdown incomplete: {drift:?}, {mesh:?}"),
        }
        drift.and(mesh)
    }
}

impl<P: PowerSupplyChannel> Drop for HvSession<P> {
    fn drop(&mut self) {
        if !self.is_off {
            spdlog::warn!("High voltage session dropped while on; shutting down");
            if let Err(e) = self.shutdown() {
                spdlog::error!("Failed to shut down high voltage on drop: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetpointSummary {
    pub drift_voltage: f64,
    pub file: String,
    pub n_events: usize,
    pub n_skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub file: String,
    pub reason: String,
}

/// What a completed scan produced
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub run_number: u32,
    pub run_path: PathBuf,
    pub setpoints: Vec<SetpointSummary>,
    pub reports: Vec<AnalysisReport>,
    pub failed_jobs: Vec<FailedJob>,
    pub jobs_dispatched: usize,
}

/// Everything recorded so far; survives an abort so the last job can still be accounted for
#[derive(Debug, Default)]
struct RunRecord {
    run: Option<RunDirectory>,
    manifest: Option<RunManifest>,
    setpoints: Vec<SetpointSummary>,
    reports: Vec<AnalysisReport>,
    failed_jobs: Vec<FailedJob>,
}

impl RunRecord {
    fn record_job(&mut self, finished: FinishedJob) -> Result<(), ManifestError> {
        let FinishedJob { label, outcome } = finished;
        match outcome {
            Ok(report) => {
                if let Some(manifest) = self.manifest.as_mut() {
                    manifest.mark_analyzed(&report)?;
                    manifest.save()?;
                }
                self.reports.push(report);
            }
            Err(e) => {
                let reason = e.to_string();
                spdlog::error!("Analysis of {label} failed: {reason}");
                if let Some(manifest) = self.manifest.as_mut() {
                    manifest.mark_failed(&label, &reason)?;
                    manifest.save()?;
                }
                self.failed_jobs.push(FailedJob {
                    file: label,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn into_summary(self, jobs_dispatched: usize) -> ScanSummary {
        let (run_number, run_path) = match self.run {
            Some(run) => (run.number(), run.path().to_path_buf()),
            None => (0, PathBuf::new()),
        };
        ScanSummary {
            run_number,
            run_path,
            setpoints: self.setpoints,
            reports: self.reports,
            failed_jobs: self.failed_jobs,
            jobs_dispatched,
        }
    }
}

pub struct ScanController<D, P, S, A>
where
    D: Digitizer,
    P: PowerSupplyChannel,
    S: DatasetStore,
    A: DatasetAnalyzer,
{
    config: Config,
    plan: ScanPlan,
    digitizer: D,
    hv: HvSession<P>,
    store: S,
    analyzer: Arc<A>,
    status: Option<Sender<ScanStatus>>,
    state: ScanState,
}

impl<D, P, S, A> ScanController<D, P, S, A>
where
    D: Digitizer,
    P: PowerSupplyChannel,
    S: DatasetStore,
    A: DatasetAnalyzer,
{
    pub fn new(
        config: Config,
        digitizer: D,
        mesh: P,
        drift: P,
        store: S,
        analyzer: A,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let plan = ScanPlan::from_config(&config);
        Ok(Self {
            config,
            plan,
            digitizer,
            hv: HvSession::new(mesh, drift),
            store,
            analyzer: Arc::new(analyzer),
            status: None,
            state: ScanState::Init,
        })
    }

    /// Report progress on tx while scanning
    pub fn with_status(mut self, tx: Sender<ScanStatus>) -> Self {
        self.status = Some(tx);
        self
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    fn enter(&mut self, state: ScanState) {
        spdlog::info!("Scan state {} -> {}", self.state, state);
        self.state = state;
    }

    fn send_status(&mut self, setpoint: &Setpoint, completed: usize, phase: ScanPhase) {
        let Some(tx) = &self.status else {
            return;
        };
        let status = ScanStatus::new(
            completed as f32 / self.plan.len() as f32,
            setpoint.index,
            setpoint.drift_voltage,
            phase,
        );
        if tx.send(status).is_err() {
            spdlog::warn!("Status receiver hung up; no further status will be sent");
            self.status = None;
        }
    }

    /// Run the scan to completion, consuming the controller
    pub fn run(mut self) -> Result<ScanSummary, ScanError> {
        let mut pipeline = AnalysisPipeline::new();
        let mut record = RunRecord::default();

        if let Err(e) = self.execute(&mut pipeline, &mut record) {
            spdlog::error!("Scan aborted: {e}");
            self.enter(ScanState::Aborting);
            if let Err(off) = self.hv.shutdown() {
                spdlog::error!("Could not turn off high voltage while aborting: {off}");
            }
            if let Some(finished) = pipeline.drain() {
                if let Err(me) = record.record_job(finished) {
                    spdlog::error!("Could not record the last analysis job: {me}");
                }
            }
            self.enter(ScanState::Shutdown);
            return Err(e);
        }

        self.enter(ScanState::Shutdown);
        self.hv.shutdown()?;
        if let Some(last) = self.plan.setpoints().last().cloned() {
            self.send_status(&last, self.plan.len(), ScanPhase::Done);
        }
        Ok(record.into_summary(pipeline.dispatched()))
    }

    fn execute(
        &mut self,
        pipeline: &mut AnalysisPipeline,
        record: &mut RunRecord,
    ) -> Result<(), ScanError> {
        let run = RunDirectory::allocate(&self.config.runs_path)?;
        spdlog::info!(
            "Starting run {} with {} setpoints in {}",
            run.number(),
            self.plan.len(),
            run.path().display()
        );
        let manifest = RunManifest::create(&run);
        manifest.save()?;
        record.manifest = Some(manifest);
        record.run = Some(run.clone());

        self.digitizer.configure(&self.config.digitizer)?;
        self.hv
            .set_ramp_rate(self.config.ramp_up, self.config.ramp_down)?;

        let setpoints = self.plan.setpoints().to_vec();
        for setpoint in setpoints.iter() {
            self.enter(ScanState::Ramping);
            self.send_status(setpoint, setpoint.index, ScanPhase::Ramping);
            spdlog::info!(
                "Setpoint {}: drift {:.1} V, mesh {:.1} V",
                setpoint.index,
                setpoint.drift_voltage,
                setpoint.mesh_voltage
            );
            self.hv
                .ramp_to(setpoint.mesh_voltage, setpoint.drift_voltage)?;

            self.enter(ScanState::Settling);
            self.send_status(setpoint, setpoint.index, ScanPhase::Settling);
            self.hv.settle(self.config.settle_timeout())?;

            self.enter(ScanState::Capturing);
            self.send_status(setpoint, setpoint.index, ScanPhase::Capturing);
            let file = setpoint.dataset_file_name(self.store.extension());
            let mut dataset = SetpointDataset::<S>::new(run.dataset_path(&file));
            let mut n_skipped = 0;
            for sequence in 0..self.config.n_sequences {
                match self.capture_sequence(&mut dataset, setpoint) {
                    Step::Done(n_events) => {
                        spdlog::info!("Sequence {sequence}: captured {n_events} events")
                    }
                    Step::Skipped(reason) => {
                        spdlog::warn!("Sequence {sequence} skipped: {reason}");
                        n_skipped += 1;
                    }
                    Step::Fatal(e) => return Err(e),
                }
            }

            self.enter(ScanState::Finalizing);
            let closed = dataset.close(&self.store, setpoint)?;
            if let Some(manifest) = record.manifest.as_mut() {
                manifest.record_dataset(setpoint, &closed)?;
                manifest.save()?;
            }
            record.setpoints.push(SetpointSummary {
                drift_voltage: setpoint.drift_voltage,
                file: closed.file_name(),
                n_events: closed.n_rows,
                n_skipped,
            });

            self.enter(ScanState::Dispatching);
            if let Some(finished) = pipeline.drain() {
                record.record_job(finished)?;
            }
            self.send_status(setpoint, setpoint.index + 1, ScanPhase::Analyzing);
            let analyzer = Arc::clone(&self.analyzer);
            let label = closed.file_name();
            pipeline.submit(&label, move || analyzer.analyze(&closed))?;
        }

        self.enter(ScanState::Done);
        if let Some(finished) = pipeline.drain() {
            record.record_job(finished)?;
        }
        Ok(())
    }

    /// One trigger sequence: capture, read, append to the dataset
    fn capture_sequence(
        &mut self,
        dataset: &mut SetpointDataset<S>,
        setpoint: &Setpoint,
    ) -> Step<usize> {
        match self.digitizer.capture() {
            Ok(true) => (),
            Ok(false) => return Step::Skipped(String::from("capture timed out")),
            Err(e) => return Step::Fatal(e.into()),
        }
        let batch = match self.digitizer.read(&self.config.digitizer.channels) {
            Ok(batch) => batch,
            Err(e) => return Step::Fatal(e.into()),
        };
        let block = match batch.into_event_block(setpoint) {
            Ok(block) => block,
            Err(e) => return Step::Fatal(e.into()),
        };
        match dataset.append(&self.store, &block) {
            Ok(n_events) => Step::Done(n_events),
            Err(DatasetError::SchemaMismatch(diff)) => {
                Step::Skipped(format!("capture does not match the dataset: {diff}"))
            }
            Err(e) => Step::Fatal(e.into()),
        }
    }
}
