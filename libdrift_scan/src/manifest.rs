use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::analysis::{AnalysisReport, ColumnFit};
use super::dataset::ClosedDataset;
use super::error::ManifestError;
use super::run_directory::RunDirectory;
use super::scan_plan::Setpoint;

/// This is the version of the manifest layout
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Raw,
    Analyzed,
    Failed,
}

/// Bookkeeping for one dataset of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub drift_voltage: f64,
    pub mesh_voltage: f64,
    pub drift_gap: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentration: Option<f64>,
    pub n_events: usize,
    pub status: DatasetStatus,
    #[serde(default)]
    pub feature_columns: Vec<String>,
    #[serde(default)]
    pub fits: Vec<ColumnFit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created: String,
}

/// The run manifest, run_NNNN/manifest.yml. Tracks which datasets still need analysis.
///
/// Only the scan controller or an offline analysis pass writes it; analysis jobs report back
/// instead of touching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_number: u32,
    pub format_version: u32,
    pub datasets: Vec<ManifestEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl RunManifest {
    /// A new, empty manifest for run. Nothing is written until save
    pub fn create(run: &RunDirectory) -> Self {
        Self {
            run_number: run.number(),
            format_version: FORMAT_VERSION,
            datasets: Vec::new(),
            path: run.manifest_path(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let mut manifest = serde_yaml::from_str::<Self>(&yaml_str)?;
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the manifest, replacing the previous version atomically
    pub fn save(&self) -> Result<(), ManifestError> {
        let yaml_str = serde_yaml::to_string(self)?;
        let tmp_path = self.path.with_extension("yml.tmp");
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(yaml_str.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn entry(&self, file: &str) -> Option<&ManifestEntry> {
        self.datasets.iter().find(|entry| entry.file == file)
    }

    fn entry_mut(&mut self, file: &str) -> Result<&mut ManifestEntry, ManifestError> {
        self.datasets
            .iter_mut()
            .find(|entry| entry.file == file)
            .ok_or_else(|| ManifestError::UnknownDataset(file.to_string()))
    }

    /// Record a freshly closed dataset as raw. Recording the same file again replaces its entry
    pub fn record_dataset(
        &mut self,
        setpoint: &Setpoint,
        dataset: &ClosedDataset,
    ) -> Result<(), ManifestError> {
        let entry = ManifestEntry {
            file: dataset.file_name(),
            drift_voltage: setpoint.drift_voltage,
            mesh_voltage: setpoint.mesh_voltage,
            drift_gap: setpoint.drift_gap,
            concentration: setpoint.concentration,
            n_events: dataset.n_rows,
            status: DatasetStatus::Raw,
            feature_columns: Vec::new(),
            fits: Vec::new(),
            error: None,
            created: OffsetDateTime::now_utc().format(&Rfc3339)?,
        };
        match self.datasets.iter_mut().find(|e| e.file == entry.file) {
            Some(existing) => *existing = entry,
            None => self.datasets.push(entry),
        }
        Ok(())
    }

    pub fn mark_analyzed(&mut self, report: &AnalysisReport) -> Result<(), ManifestError> {
        let entry = self.entry_mut(&report.file_name())?;
        entry.status = DatasetStatus::Analyzed;
        entry.feature_columns = report.feature_columns.clone();
        entry.fits = report.fits.clone();
        entry.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, file: &str, reason: &str) -> Result<(), ManifestError> {
        let entry = self.entry_mut(file)?;
        entry.status = DatasetStatus::Failed;
        entry.error = Some(reason.to_string());
        Ok(())
    }

    /// Datasets that have not been analyzed successfully yet, in scan order
    pub fn pending(&self) -> Vec<&ManifestEntry> {
        self.datasets
            .iter()
            .filter(|entry| entry.status != DatasetStatus::Analyzed)
            .collect()
    }
}
