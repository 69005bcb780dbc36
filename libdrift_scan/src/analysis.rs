use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::capture::TIME_NAME;
use super::config::AnalysisSettings;
use super::dataset::{ClosedDataset, Column, ColumnTable, DatasetStore};
use super::error::AnalysisError;
use super::features::{FeatureExtractor, PEAK_HEIGHT_NAME};
use super::fitter::{TimingFit, TimingFitter};

/// Fit result for one feature column of an analyzed dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFit {
    pub column: String,
    pub center: f64,
    pub width: f64,
    pub converged: bool,
}

/// What an analysis job did to a dataset. Handed back to whoever owns the run manifest
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub path: PathBuf,
    pub n_rows: usize,
    pub n_without_peak: usize,
    /// The rise-time columns appended, in fraction order
    pub feature_columns: Vec<String>,
    pub fits: Vec<ColumnFit>,
}

impl AnalysisReport {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Anything that can turn a closed dataset into an analyzed one. Runs on the pipeline worker
pub trait DatasetAnalyzer: Send + Sync + 'static {
    fn analyze(&self, dataset: &ClosedDataset) -> Result<AnalysisReport, AnalysisError>;
}

/// Check that augmented kept every column of original bit for bit and that all of its columns
/// have the original row count
pub fn verify_augmentation(
    path: &Path,
    original: &ColumnTable,
    augmented: &ColumnTable,
) -> Result<(), AnalysisError> {
    for (name, column) in original.columns() {
        match augmented.column(name) {
            Some(after) if after.bitwise_eq(column) => (),
            Some(_) => {
                return Err(AnalysisError::Consistency(
                    path.to_path_buf(),
                    format!("values of column {name} changed"),
                ))
            }
            None => {
                return Err(AnalysisError::Consistency(
                    path.to_path_buf(),
                    format!("column {name} was dropped"),
                ))
            }
        }
    }
    for (name, column) in augmented.columns() {
        if column.n_rows() != original.n_rows() {
            return Err(AnalysisError::Consistency(
                path.to_path_buf(),
                format!(
                    "column {name} has {} rows, expected {}",
                    column.n_rows(),
                    original.n_rows()
                ),
            ));
        }
    }
    Ok(())
}

/// Appends per-event pulse features to a dataset and fits the timing distributions
#[derive(Debug, Clone)]
pub struct AnalysisJob<S: DatasetStore> {
    store: S,
    channel: String,
    fit_columns: Vec<String>,
    extractor: FeatureExtractor,
    fitter: TimingFitter,
}

impl<S: DatasetStore> AnalysisJob<S> {
    pub fn new(store: S, settings: &AnalysisSettings) -> Self {
        Self {
            store,
            channel: settings.channel.clone(),
            fit_columns: settings.fit_columns.clone(),
            extractor: FeatureExtractor::new(
                &settings.rise_time_fractions,
                settings.smoothing_window,
            ),
            fitter: TimingFitter::new(settings.n_bins, settings.outlier_threshold),
        }
    }

    /// Compute the feature columns for every event and return the augmented table together with
    /// the number of events where no peak was found
    pub fn augment(&self, table: &ColumnTable) -> Result<(ColumnTable, usize), AnalysisError> {
        let time = table.trace(TIME_NAME)?;
        let signal = table.trace(&self.channel)?;
        let n_rows = table.n_rows();
        let names = self.extractor.column_names();
        let n_fractions = self.extractor.fractions().len();

        let mut position = Array1::<f64>::zeros(n_rows);
        let mut height = Array1::<f64>::zeros(n_rows);
        let mut base = Array1::<f64>::zeros(n_rows);
        let mut rise_times = vec![Array1::<f64>::from_elem(n_rows, f64::NAN); n_fractions];
        let mut n_without_peak = 0;

        for (row, (times, waveform)) in time.outer_iter().zip(signal.outer_iter()).enumerate() {
            let features = self.extractor.extract(&waveform.to_vec());
            if !features.found {
                n_without_peak += 1;
                continue;
            }
            position[row] = times[features.peak_index];
            height[row] = features.peak_height;
            base[row] = features.peak_base;
            for (column, crossing) in rise_times.iter_mut().zip(features.crossings.iter()) {
                if let Some(idx) = crossing {
                    column[row] = times[*idx];
                }
            }
        }

        let mut augmented = table.clone();
        let scalars = [position, height, base].into_iter().chain(rise_times);
        for (name, values) in names.iter().zip(scalars) {
            augmented.push_column(name, Column::Scalar(values))?;
        }
        Ok((augmented, n_without_peak))
    }

    /// Fit each configured timing column. Failures become the (0, 0) sentinel
    pub fn fit_columns(&self, table: &ColumnTable) -> Vec<ColumnFit> {
        let mut fits = Vec::with_capacity(self.fit_columns.len());
        for column in self.fit_columns.iter() {
            let result = match table.scalar(column) {
                Ok(values) => self.fitter.fit(&values.to_vec()).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let (fit, converged) = match result {
                Ok(fit) => (fit, true),
                Err(e) => {
                    spdlog::warn!("Fit of column {column} failed, reporting zeros: {e}");
                    (TimingFit::default(), false)
                }
            };
            fits.push(ColumnFit {
                column: column.clone(),
                center: fit.center,
                width: fit.width,
                converged,
            });
        }
        fits
    }

    /// Report for a dataset whose feature columns were written by an earlier run of this job.
    /// Rows without a peak are the ones holding a zero height.
    fn existing_report(
        &self,
        path: &Path,
        table: &ColumnTable,
        feature_columns: Vec<String>,
    ) -> AnalysisReport {
        let n_without_peak = table
            .scalar(PEAK_HEIGHT_NAME)
            .map_or(0, |heights| heights.iter().filter(|h| **h == 0.0).count());
        let fits = if table.n_rows() == 0 {
            Vec::new()
        } else {
            self.fit_columns(table)
        };
        AnalysisReport {
            path: path.to_path_buf(),
            n_rows: table.n_rows(),
            n_without_peak,
            feature_columns,
            fits,
        }
    }
}

impl<S: DatasetStore + 'static> DatasetAnalyzer for AnalysisJob<S> {
    fn analyze(&self, dataset: &ClosedDataset) -> Result<AnalysisReport, AnalysisError> {
        let path = dataset.path.as_path();
        let table = self.store.open(path)?;
        let feature_columns = self.extractor.rise_time_names();
        let names = self.extractor.column_names();
        let present: Vec<&String> = names
            .iter()
            .filter(|name| table.column(name).is_some())
            .collect();
        if present.len() == names.len() {
            // Rewritten before the manifest learned about it; report what is already there
            spdlog::warn!(
                "Dataset {} already carries its feature columns; reporting them as is",
                path.display()
            );
            return Ok(self.existing_report(path, &table, feature_columns));
        }
        if let Some(existing) = present.first() {
            return Err(AnalysisError::AlreadyAnalyzed(
                path.to_path_buf(),
                existing.to_string(),
            ));
        }

        if table.n_rows() == 0 {
            spdlog::warn!("Dataset {} has no events; nothing to analyze", path.display());
            return Ok(AnalysisReport {
                path: path.to_path_buf(),
                n_rows: 0,
                n_without_peak: 0,
                feature_columns,
                fits: Vec::new(),
            });
        }

        let (augmented, n_without_peak) = self.augment(&table)?;
        verify_augmentation(path, &table, &augmented)?;
        self.store.rewrite(path, &augmented)?;
        if n_without_peak > 0 {
            spdlog::warn!(
                "No peak found in {} of {} events of {}; those rows hold zeros",
                n_without_peak,
                table.n_rows(),
                path.display()
            );
        }

        let fits = self.fit_columns(&augmented);
        for fit in fits.iter().filter(|fit| fit.converged) {
            spdlog::info!(
                "{}: {} center {:.3} width {:.3}",
                dataset.file_name(),
                fit.column,
                fit.center,
                fit.width
            );
        }

        Ok(AnalysisReport {
            path: path.to_path_buf(),
            n_rows: table.n_rows(),
            n_without_peak,
            feature_columns,
            fits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetWriter;
    use crate::tree_file::TreeFileStore;
    use ndarray::Array2;

    const N_SAMPLES: usize = 400;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            channel: String::from("CH3"),
            rise_time_fractions: vec![0.1, 0.5, 0.9],
            smoothing_window: 5,
            n_bins: 10,
            outlier_threshold: 10.0,
            fit_columns: vec![String::from("RT50"), String::from("peak_position")],
        }
    }

    /// Events with a pulse centered at a sample that moves with the row, plus one flat event
    fn raw_table(n_events: usize) -> ColumnTable {
        let time = Array2::from_shape_fn((n_events, N_SAMPLES), |(_, col)| col as f64 * 2.0);
        let ch3 = Array2::from_shape_fn((n_events, N_SAMPLES), |(row, col)| {
            if row == n_events - 1 {
                return 0.0;
            }
            let center = 200.0 + (row % 7) as f64;
            (-(col as f64 - center).powi(2) / 200.0).exp()
        });
        let mut table = ColumnTable::new();
        table.push_column("time", Column::Trace(time)).unwrap();
        table.push_column("CH3", Column::Trace(ch3)).unwrap();
        table
            .push_column("drift_voltage", Column::Scalar(Array1::from_elem(n_events, 95.0)))
            .unwrap();
        table
    }

    fn write_dataset(dir: &Path, table: &ColumnTable) -> ClosedDataset {
        let path = dir.join("gap_10.0_mesh_340.0_drift_95.0.tree");
        let mut writer = TreeFileStore.create(&path, table.schema()).unwrap();
        writer.append(table).unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn test_analysis_appends_features() {
        let dir = tempfile::tempdir().unwrap();
        let raw = raw_table(30);
        let dataset = write_dataset(dir.path(), &raw);
        let job = AnalysisJob::new(TreeFileStore, &settings());

        let report = job.analyze(&dataset).unwrap();
        assert_eq!(report.n_rows, 30);
        assert_eq!(report.n_without_peak, 1);
        assert_eq!(report.feature_columns, vec!["RT10", "RT50", "RT90"]);
        let fitted: Vec<&str> = report.fits.iter().map(|fit| fit.column.as_str()).collect();
        assert_eq!(fitted, vec!["RT50", "peak_position"]);

        let analyzed = TreeFileStore.open(&dataset.path).unwrap();
        assert_eq!(analyzed.n_columns(), raw.n_columns() + 6);
        verify_augmentation(&dataset.path, &raw, &analyzed).unwrap();
        let position = analyzed.scalar("peak_position").unwrap();
        assert!((position[0] - 400.0).abs() <= 2.0);
        assert_eq!(position[29], 0.0);
        assert!(analyzed.scalar("RT50").unwrap()[29].is_nan());
        let rt10 = analyzed.scalar("RT10").unwrap();
        let rt90 = analyzed.scalar("RT90").unwrap();
        assert!(rt10[3] <= rt90[3]);
    }

    #[test]
    fn test_second_pass_reports_existing_features() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = write_dataset(dir.path(), &raw_table(12));
        let job = AnalysisJob::new(TreeFileStore, &settings());
        let first = job.analyze(&dataset).unwrap();
        let before = std::fs::read(&dataset.path).unwrap();

        let second = job.analyze(&dataset).unwrap();
        assert_eq!(second, first);
        assert_eq!(second.n_without_peak, 1);
        assert_eq!(std::fs::read(&dataset.path).unwrap(), before);
    }

    #[test]
    fn test_partial_feature_columns_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = raw_table(5);
        table
            .push_column("peak_height", Column::Scalar(Array1::ones(5)))
            .unwrap();
        let dataset = write_dataset(dir.path(), &table);
        assert!(matches!(
            AnalysisJob::new(TreeFileStore, &settings()).analyze(&dataset),
            Err(AnalysisError::AlreadyAnalyzed(_, name)) if name == "peak_height"
        ));
    }

    #[test]
    fn test_empty_dataset_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = write_dataset(dir.path(), &ColumnTable::empty(&raw_table(1).schema()));
        let before = std::fs::read(&dataset.path).unwrap();
        let report = AnalysisJob::new(TreeFileStore, &settings())
            .analyze(&dataset)
            .unwrap();
        assert_eq!(report.n_rows, 0);
        assert!(report.fits.is_empty());
        assert_eq!(std::fs::read(&dataset.path).unwrap(), before);
    }

    #[test]
    fn test_missing_channel_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = write_dataset(dir.path(), &raw_table(3));
        let mut other = settings();
        other.channel = String::from("CH4");
        assert!(matches!(
            AnalysisJob::new(TreeFileStore, &other).analyze(&dataset),
            Err(AnalysisError::DatasetError(_))
        ));
    }

    #[test]
    fn test_verify_detects_changes() {
        let path = Path::new("data.tree");
        let raw = raw_table(3);

        let mut dropped = ColumnTable::new();
        dropped
            .push_column("time", raw.column("time").unwrap().clone())
            .unwrap();
        assert!(matches!(
            verify_augmentation(path, &raw, &dropped),
            Err(AnalysisError::Consistency(_, _))
        ));

        let mut drifted = ColumnTable::new();
        for (name, column) in raw.columns() {
            let column = match column {
                Column::Scalar(values) => Column::Scalar(values + 1.0e-9),
                other => other.clone(),
            };
            drifted.push_column(name, column).unwrap();
        }
        assert!(matches!(
            verify_augmentation(path, &raw, &drifted),
            Err(AnalysisError::Consistency(_, _))
        ));

        let mut short = raw.clone();
        short
            .push_column("peak_height", Column::Scalar(Array1::zeros(3)))
            .unwrap();
        verify_augmentation(path, &raw, &short).unwrap();
        assert!(verify_augmentation(path, &raw_table(4), &short).is_err());
    }
}
