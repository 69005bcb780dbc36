use super::config::Config;
use super::dataset::{ColumnKind, ColumnSpec, Schema};

pub const DRIFT_VOLTAGE_NAME: &str = "drift_voltage";
pub const MESH_VOLTAGE_NAME: &str = "mesh_voltage";
pub const DRIFT_GAP_NAME: &str = "drift_gap";
pub const CONCENTRATION_NAME: &str = "concentration";

/// One point of the scan: the drift voltage to apply plus the run metadata broadcast onto every
/// event
#[derive(Debug, Clone, PartialEq)]
pub struct Setpoint {
    pub index: usize,
    pub drift_voltage: f64,
    pub mesh_voltage: f64,
    pub drift_gap: f64,
    pub concentration: Option<f64>,
}

impl Setpoint {
    /// The dataset file stem, e.g. gap_10.0_mesh_340.0_drift_95.0
    pub fn dataset_stem(&self) -> String {
        let mut stem = format!(
            "gap_{:.1}_mesh_{:.1}_drift_{:.1}",
            self.drift_gap, self.mesh_voltage, self.drift_voltage
        );
        if let Some(conc) = self.concentration {
            stem.push_str(&format!("_conc_{conc:.2}"));
        }
        stem
    }

    pub fn dataset_file_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.dataset_stem())
    }

    /// The metadata columns and their values, in schema order
    pub fn metadata(&self) -> Vec<(&'static str, f64)> {
        let mut values = vec![
            (DRIFT_VOLTAGE_NAME, self.drift_voltage),
            (MESH_VOLTAGE_NAME, self.mesh_voltage),
            (DRIFT_GAP_NAME, self.drift_gap),
        ];
        if let Some(conc) = self.concentration {
            values.push((CONCENTRATION_NAME, conc));
        }
        values
    }

    /// Schema of a dataset that never received a capture
    pub fn metadata_schema(&self) -> Schema {
        Schema::new(
            self.metadata()
                .into_iter()
                .map(|(name, _)| ColumnSpec::new(name, ColumnKind::Scalar))
                .collect(),
        )
    }
}

/// The ordered list of setpoints. Visited in order, each exactly once
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPlan {
    setpoints: Vec<Setpoint>,
}

impl ScanPlan {
    pub fn new(
        drift_voltages: &[f64],
        mesh_voltage: f64,
        drift_gap: f64,
        concentration: Option<f64>,
    ) -> Self {
        Self {
            setpoints: drift_voltages
                .iter()
                .enumerate()
                .map(|(index, drift_voltage)| Setpoint {
                    index,
                    drift_voltage: *drift_voltage,
                    mesh_voltage,
                    drift_gap,
                    concentration,
                })
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.drift_voltages.voltages(),
            config.mesh_voltage,
            config.drift_gap,
            config.concentration,
        )
    }

    pub fn len(&self) -> usize {
        self.setpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setpoints.is_empty()
    }

    pub fn setpoints(&self) -> &[Setpoint] {
        &self.setpoints
    }
}
