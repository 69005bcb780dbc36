use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::capture::channel_column_name;
use super::error::ConfigError;
use super::instrument::DigitizerSettings;
use super::scan_plan::ScanPlan;

/// The drift voltages to visit, either as an arange-style range (stop exclusive) or an explicit
/// list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoltageSweep {
    Range { start: f64, stop: f64, step: f64 },
    List(Vec<f64>),
}

impl VoltageSweep {
    /// Expand the sweep into the ordered list of voltages
    pub fn voltages(&self) -> Vec<f64> {
        match self {
            Self::Range { start, stop, step } => {
                if *step <= 0.0 || stop <= start {
                    return vec![];
                }
                let n_steps = ((stop - start) / step).ceil() as usize;
                (0..n_steps).map(|idx| start + idx as f64 * step).collect()
            }
            Self::List(list) => list.clone(),
        }
    }
}

/// Which on-disk format the per-setpoint datasets use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFormat {
    #[default]
    Tree,
    Hdf5,
}

/// Settings for the per-dataset analysis job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub channel: String,
    pub rise_time_fractions: Vec<f64>,
    pub smoothing_window: usize,
    pub n_bins: usize,
    pub outlier_threshold: f64,
    pub fit_columns: Vec<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            channel: String::from("CH3"),
            rise_time_fractions: (1..20).map(|k| k as f64 * 0.05).collect(),
            smoothing_window: 50,
            n_bins: 50,
            outlier_threshold: 10.0,
            fit_columns: vec![
                String::from("RT10"),
                String::from("RT50"),
                String::from("RT90"),
                String::from("peak_position"),
            ],
        }
    }
}

/// Structure representing the scan configuration. Contains pathing, bench and analysis information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub runs_path: PathBuf,
    pub store: StoreFormat,
    pub drift_gap: f64,
    pub mesh_voltage: f64,
    pub drift_voltages: VoltageSweep,
    pub concentration: Option<f64>,
    pub ramp_up: f64,
    pub ramp_down: f64,
    pub settle_timeout_s: f64,
    pub n_sequences: u32,
    pub digitizer: DigitizerSettings,
    pub analysis: AnalysisSettings,
}

impl Default for Config {
    /// Generate the reference bench configuration
    fn default() -> Self {
        Self {
            runs_path: PathBuf::from("runs"),
            store: StoreFormat::Tree,
            drift_gap: 10.0,
            mesh_voltage: 340.0,
            drift_voltages: VoltageSweep::Range {
                start: 95.0,
                stop: 815.0,
                step: 15.0,
            },
            concentration: None,
            ramp_up: 20.0,
            ramp_down: 20.0,
            settle_timeout_s: 60.0,
            n_sequences: 8,
            digitizer: DigitizerSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file, replacing anything already there
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        let mut file = std::fs::File::create(config_path)?;
        file.write_all(yaml_str.as_bytes())?;
        Ok(())
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.settle_timeout_s)
    }

    /// Check everything the scan and analysis rely on before touching hardware
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let VoltageSweep::Range { step, .. } = self.drift_voltages {
            if step <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "drift voltage step must be positive, got {step}"
                )));
            }
        }
        if self.drift_voltages.voltages().is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "drift voltage sweep is empty",
            )));
        }
        // Each setpoint owns its dataset file, so two setpoints may never share a name
        let mut stems = HashSet::new();
        for setpoint in ScanPlan::from_config(self).setpoints() {
            let stem = setpoint.dataset_stem();
            if !stems.insert(stem.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "drift voltage {} reuses the dataset name {stem} of an earlier setpoint",
                    setpoint.drift_voltage
                )));
            }
        }
        if self.settle_timeout_s <= 0.0 || !self.settle_timeout_s.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "settle timeout must be positive, got {}",
                self.settle_timeout_s
            )));
        }
        if self.digitizer.timeout_s <= 0.0 || !self.digitizer.timeout_s.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "digitizer timeout must be positive, got {}",
                self.digitizer.timeout_s
            )));
        }
        if self.n_sequences == 0 || self.digitizer.n_segments == 0 {
            return Err(ConfigError::Invalid(String::from(
                "sequence and segment counts must be at least 1",
            )));
        }
        if self.digitizer.channels.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "no digitizer channels configured",
            )));
        }
        let analysis = &self.analysis;
        if !self
            .digitizer
            .channels
            .iter()
            .any(|id| channel_column_name(*id) == analysis.channel)
        {
            return Err(ConfigError::Invalid(format!(
                "analysis channel {} is not one of the captured channels {:?}",
                analysis.channel, self.digitizer.channels
            )));
        }
        if let Some(bad) = analysis
            .rise_time_fractions
            .iter()
            .find(|f| !(**f > 0.0 && **f < 1.0))
        {
            return Err(ConfigError::Invalid(format!(
                "rise time fraction {bad} is outside (0, 1)"
            )));
        }
        if analysis.smoothing_window == 0 || analysis.n_bins == 0 {
            return Err(ConfigError::Invalid(String::from(
                "smoothing window and bin count must be at least 1",
            )));
        }
        if analysis.outlier_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "outlier threshold must be positive, got {}",
                analysis.outlier_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sweep_matches_bench() {
        let voltages = Config::default().drift_voltages.voltages();
        assert_eq!(voltages.len(), 48);
        assert_eq!(voltages[0], 95.0);
        assert_eq!(voltages[47], 800.0);
    }

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip_with_list_sweep() {
        let mut config = Config::default();
        config.drift_voltages = VoltageSweep::List(vec![100.0, 250.0, 175.0]);
        config.concentration = Some(0.25);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.drift_voltages.voltages(), vec![100.0, 250.0, 175.0]);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::read_config_file(Path::new("/definitely/not/here.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn test_rejects_setpoints_sharing_a_dataset() {
        let mut config = Config::default();
        config.drift_voltages = VoltageSweep::List(vec![400.0, 500.0, 400.0]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        // Distinct voltages that print the same at one decimal collide too
        config.drift_voltages = VoltageSweep::List(vec![400.0, 400.02]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.drift_voltages = VoltageSweep::List(vec![400.0, 400.1]);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_uncaptured_analysis_channel() {
        let mut config = Config::default();
        config.analysis.channel = String::from("CH1");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_fraction_and_step() {
        let mut config = Config::default();
        config.analysis.rise_time_fractions.push(1.0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.drift_voltages = VoltageSweep::Range {
            start: 100.0,
            stop: 200.0,
            step: 0.0,
        };
        assert!(config.validate().is_err());
    }
}
