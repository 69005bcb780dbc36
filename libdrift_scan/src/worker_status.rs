/// What the scan is doing at the moment a status is sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanPhase {
    #[default]
    Ramping,
    Settling,
    Capturing,
    Analyzing,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStatus {
    /// Fraction of the scan plan completed, 0 to 1
    pub progress: f32,
    pub setpoint: usize,
    pub drift_voltage: f64,
    pub phase: ScanPhase,
}

impl ScanStatus {
    pub fn new(progress: f32, setpoint: usize, drift_voltage: f64, phase: ScanPhase) -> Self {
        Self {
            progress,
            setpoint,
            drift_voltage,
            phase,
        }
    }
}
