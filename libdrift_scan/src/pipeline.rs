//! Single slot background pipeline for analysis jobs.
//!
//! At most one job is ever in flight: submitting joins the previous job before the new one is
//! spawned, so jobs also finish in submission order.
use std::any::Any;
use std::thread::{self, JoinHandle};

use super::analysis::AnalysisReport;
use super::error::{AnalysisError, PipelineError};

pub type JobOutcome = Result<AnalysisReport, AnalysisError>;

/// A job that has been joined, along with its result
#[derive(Debug)]
pub struct FinishedJob {
    pub label: String,
    pub outcome: JobOutcome,
}

#[derive(Debug)]
struct InFlight {
    label: String,
    handle: JoinHandle<JobOutcome>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("unknown panic")
    }
}

#[derive(Debug, Default)]
pub struct AnalysisPipeline {
    in_flight: Option<InFlight>,
    dispatched: usize,
    completed: usize,
}

impl AnalysisPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start job on a worker thread. Blocks until any job already in flight has finished and
    /// returns that job.
    pub fn submit<F>(&mut self, label: &str, job: F) -> Result<Option<FinishedJob>, PipelineError>
    where
        F: FnOnce() -> JobOutcome + Send + 'static,
    {
        let previous = self.drain();
        let handle = thread::Builder::new()
            .name(format!("analysis {label}"))
            .spawn(job)?;
        spdlog::info!("Dispatched analysis of {label}");
        self.in_flight = Some(InFlight {
            label: label.to_string(),
            handle,
        });
        self.dispatched += 1;
        Ok(previous)
    }

    /// Block until the pipeline is idle. Returns the job that was in flight, if any
    pub fn drain(&mut self) -> Option<FinishedJob> {
        let InFlight { label, handle } = self.in_flight.take()?;
        let outcome = match handle.join() {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = panic_message(&*payload);
                spdlog::error!("Analysis of {label} panicked: {msg}");
                Err(AnalysisError::JobPanicked(format!("{label}: {msg}")))
            }
        };
        self.completed += 1;
        spdlog::info!("Joined analysis of {label}");
        Some(FinishedJob { label, outcome })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

impl Drop for AnalysisPipeline {
    fn drop(&mut self) {
        if let Some(finished) = self.drain() {
            spdlog::warn!(
                "Analysis of {} was only joined when the pipeline was dropped",
                finished.label
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn report(label: &str) -> AnalysisReport {
        AnalysisReport {
            path: PathBuf::from(label),
            n_rows: 0,
            n_without_peak: 0,
            feature_columns: vec![],
            fits: vec![],
        }
    }

    #[test]
    fn test_jobs_never_overlap() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut pipeline = AnalysisPipeline::new();
        let mut finished = Vec::new();
        for idx in 0..3 {
            let label = format!("job{idx}");
            let job_log = log.clone();
            let job_label = label.clone();
            let previous = pipeline
                .submit(&label, move || {
                    job_log.lock().unwrap().push(format!("start {job_label}"));
                    thread::sleep(Duration::from_millis(20));
                    job_log.lock().unwrap().push(format!("end {job_label}"));
                    Ok(report(&job_label))
                })
                .unwrap();
            assert!(pipeline.is_busy());
            finished.extend(previous);
        }
        finished.extend(pipeline.drain());
        assert!(!pipeline.is_busy());
        assert!(pipeline.drain().is_none());

        let labels: Vec<&str> = finished.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["job0", "job1", "job2"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start job0", "end job0", "start job1", "end job1", "start job2", "end job2"]
        );
        assert_eq!(pipeline.dispatched(), 3);
        assert_eq!(pipeline.completed(), 3);
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let mut pipeline = AnalysisPipeline::new();
        pipeline
            .submit("bad", || -> JobOutcome { panic!("bad waveform") })
            .unwrap();
        let finished = pipeline.drain().unwrap();
        match finished.outcome {
            Err(AnalysisError::JobPanicked(msg)) => assert!(msg.contains("bad waveform")),
            other => panic!("expected a panic report, got {other:?}"),
        }
        // The pipeline is still usable afterwards
        pipeline.submit("good", || Ok(report("good"))).unwrap();
        assert!(pipeline.drain().unwrap().outcome.is_ok());
    }

    #[test]
    fn test_drop_joins_in_flight_job() {
        let done = Arc::new(AtomicBool::new(false));
        {
            let mut pipeline = AnalysisPipeline::new();
            let job_done = done.clone();
            pipeline
                .submit("slow", move || {
                    thread::sleep(Duration::from_millis(50));
                    job_done.store(true, Ordering::SeqCst);
                    Ok(report("slow"))
                })
                .unwrap();
        }
        assert!(done.load(Ordering::SeqCst));
    }
}
