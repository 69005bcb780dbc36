//! Stand-in instruments for dry runs and tests.
//!
//! The simulated digitizer produces a trigger pulse on CH2 and a drift signal on CH3 whose
//! delay scales inversely with the drift field, so a simulated scan yields timing
//! distributions that actually move with the setpoint.
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::capture::{CaptureBatch, ChannelTrace};
use super::error::{DigitizerError, PowerSupplyError};
use super::instrument::{Digitizer, DigitizerSettings, PowerSupplyChannel};

const TRIGGER_CHANNEL: u8 = 2;
const SIGNAL_CHANNEL: u8 = 3;
const MAX_CHANNEL: u8 = 4;
const TRIGGER_TIME_NS: f64 = 100.0;
const TRIGGER_WIDTH_NS: f64 = 5.0;
const SIGNAL_WIDTH_NS: f64 = 10.0;
/// Drift delay in ns for a field of 1 V/mm
const DRIFT_SCALE: f64 = 2000.0;
const JITTER_NS: f64 = 2.0;
const NOISE: f64 = 0.02;

/// The live output voltage of a simulated channel, shared with whoever needs to see it
#[derive(Debug, Clone, Default)]
pub struct VoltageProbe(Arc<AtomicU64>);

impl VoltageProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, voltage: f64) {
        self.0.store(voltage.to_bits(), Ordering::SeqCst)
    }
}

fn gaussian_pulse(t: f64, center: f64, width: f64) -> f64 {
    (-(t - center).powi(2) / (2.0 * width * width)).exp()
}

#[derive(Debug)]
pub struct SimulatedDigitizer {
    rng: StdRng,
    settings: Option<DigitizerSettings>,
    n_samples: usize,
    dt_ns: f64,
    drift_gap: f64,
    failure_rate: f64,
    drift_probe: VoltageProbe,
    armed: bool,
}

impl SimulatedDigitizer {
    /// drift_probe should be the probe of the drift channel; drift_gap is in mm
    pub fn new(seed: u64, drift_probe: VoltageProbe, drift_gap: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            settings: None,
            n_samples: 1000,
            dt_ns: 0.5,
            drift_gap,
            failure_rate: 0.0,
            drift_probe,
            armed: false,
        }
    }

    pub fn with_samples(mut self, n_samples: usize, dt_ns: f64) -> Self {
        self.n_samples = n_samples;
        self.dt_ns = dt_ns;
        self
    }

    /// Probability that any one capture times out
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Arrival time of the drift signal for the current field
    fn arrival_ns(&self) -> f64 {
        let field = (self.drift_probe.get() / self.drift_gap).max(1.0);
        TRIGGER_TIME_NS + DRIFT_SCALE / field
    }
}

impl Digitizer for SimulatedDigitizer {
    fn configure(&mut self, settings: &DigitizerSettings) -> Result<(), DigitizerError> {
        if let Some(bad) = settings
            .channels
            .iter()
            .find(|ch| **ch == 0 || **ch > MAX_CHANNEL)
        {
            return Err(DigitizerError::BadChannel(*bad));
        }
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn capture(&mut self) -> Result<bool, DigitizerError> {
        if self.settings.is_none() {
            return Err(DigitizerError::NotConfigured);
        }
        self.armed = !self.rng.gen_bool(self.failure_rate);
        Ok(self.armed)
    }

    fn read(&mut self, channels: &[u8]) -> Result<CaptureBatch, DigitizerError> {
        let n_segments = self
            .settings
            .as_ref()
            .ok_or(DigitizerError::NotConfigured)?
            .n_segments as usize;
        if !self.armed {
            return Err(DigitizerError::Communication(String::from(
                "read requested without a completed capture",
            )));
        }
        self.armed = false;
        let shape = (n_segments, self.n_samples);
        let dt = self.dt_ns;
        let arrival = self.arrival_ns();
        let noise = Normal::new(0.0, NOISE)
            .map_err(|e| DigitizerError::Communication(e.to_string()))?;
        let jitter = Normal::new(0.0, JITTER_NS)
            .map_err(|e| DigitizerError::Communication(e.to_string()))?;
        let amplitude = Normal::new(1.0, 0.05)
            .map_err(|e| DigitizerError::Communication(e.to_string()))?;

        let time = Array2::from_shape_fn(shape, |(_, col)| col as f64 * dt);
        let mut traces = Vec::with_capacity(channels.len());
        for channel in channels {
            let values = match *channel {
                TRIGGER_CHANNEL => Array2::from_shape_fn(shape, |(_, col)| {
                    gaussian_pulse(col as f64 * dt, TRIGGER_TIME_NS, TRIGGER_WIDTH_NS)
                        + noise.sample(&mut self.rng)
                }),
                SIGNAL_CHANNEL => {
                    let mut values = Array2::zeros(shape);
                    for mut row in values.rows_mut() {
                        let center = arrival + jitter.sample(&mut self.rng);
                        let height = amplitude.sample(&mut self.rng);
                        for (col, value) in row.iter_mut().enumerate() {
                            *value = height
                                * gaussian_pulse(col as f64 * dt, center, SIGNAL_WIDTH_NS)
                                + noise.sample(&mut self.rng);
                        }
                    }
                    values
                }
                id if id == 0 || id > MAX_CHANNEL => return Err(DigitizerError::BadChannel(id)),
                _ => Array2::from_shape_fn(shape, |_| noise.sample(&mut self.rng)),
            };
            traces.push(ChannelTrace::new(*channel, values));
        }
        CaptureBatch::new(time, traces)
    }
}

#[derive(Debug)]
pub struct SimulatedPowerSupply {
    name: String,
    target: f64,
    ramp: (f64, f64),
    is_on: bool,
    probe: VoltageProbe,
    fail_settle: bool,
}

impl SimulatedPowerSupply {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            target: 0.0,
            ramp: (0.0, 0.0),
            is_on: false,
            probe: VoltageProbe::new(),
            fail_settle: false,
        }
    }

    /// Make every wait_for_target time out
    pub fn with_settle_failure(mut self) -> Self {
        self.fail_settle = true;
        self
    }

    pub fn probe(&self) -> VoltageProbe {
        self.probe.clone()
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn ramp_rate(&self) -> (f64, f64) {
        self.ramp
    }
}

impl PowerSupplyChannel for SimulatedPowerSupply {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_ramp_rate(&mut self, up: f64, down: f64) -> Result<(), PowerSupplyError> {
        self.ramp = (up, down);
        Ok(())
    }

    fn set_target(&mut self, voltage: f64) -> Result<(), PowerSupplyError> {
        self.target = voltage;
        if self.is_on {
            self.probe.set(voltage);
        }
        Ok(())
    }

    fn turn_on(&mut self) -> Result<(), PowerSupplyError> {
        self.is_on = true;
        self.probe.set(self.target);
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), PowerSupplyError> {
        self.is_on = false;
        self.probe.set(0.0);
        Ok(())
    }

    fn wait_for_target(&mut self, timeout: Duration) -> Result<(), PowerSupplyError> {
        if self.fail_settle || !self.is_on {
            return Err(PowerSupplyError::SettleTimeout(self.name.clone(), timeout));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;

    fn settings(n_segments: u32) -> DigitizerSettings {
        DigitizerSettings {
            n_segments,
            ..Default::default()
        }
    }

    #[test]
    fn test_digitizer_requires_configuration() {
        let mut digitizer = SimulatedDigitizer::new(1, VoltageProbe::new(), 10.0);
        assert!(matches!(
            digitizer.capture(),
            Err(DigitizerError::NotConfigured)
        ));
        let mut bad = settings(1);
        bad.channels = vec![3, 9];
        assert!(matches!(
            digitizer.configure(&bad),
            Err(DigitizerError::BadChannel(9))
        ));
    }

    #[test]
    fn test_signal_moves_with_field() {
        let mut supply = SimulatedPowerSupply::new("drift");
        let mut digitizer = SimulatedDigitizer::new(3, supply.probe(), 10.0);
        digitizer.configure(&settings(4)).unwrap();
        let extractor = FeatureExtractor::new(&[0.5], 10);

        let mut positions = Vec::new();
        for voltage in [95.0, 800.0] {
            supply.set_target(voltage).unwrap();
            supply.turn_on().unwrap();
            assert!(digitizer.capture().unwrap());
            let batch = digitizer.read(&[2, 3]).unwrap();
            assert_eq!(batch.n_events(), 4);
            assert_eq!(batch.n_samples(), 1000);
            let waveform = batch.channels()[1].values.row(0).to_vec();
            let features = extractor.extract(&waveform);
            assert!(features.found);
            positions.push(batch.time()[[0, features.peak_index]]);
        }
        // 100 + 2000 / 9.5 and 100 + 2000 / 80
        assert!((positions[0] - 310.5).abs() < 10.0);
        assert!((positions[1] - 125.0).abs() < 10.0);
    }

    #[test]
    fn test_failed_captures_cannot_be_read() {
        let mut digitizer =
            SimulatedDigitizer::new(5, VoltageProbe::new(), 10.0).with_failure_rate(1.0);
        digitizer.configure(&settings(1)).unwrap();
        assert!(!digitizer.capture().unwrap());
        assert!(digitizer.read(&[2]).is_err());
    }

    #[test]
    fn test_power_supply_probe_and_timeout() {
        let mut supply = SimulatedPowerSupply::new("mesh");
        let probe = supply.probe();
        supply.set_target(340.0).unwrap();
        assert_eq!(probe.get(), 0.0);
        assert!(supply.wait_for_target(Duration::from_secs(1)).is_err());
        supply.turn_on().unwrap();
        assert_eq!(probe.get(), 340.0);
        supply.wait_for_target(Duration::from_secs(1)).unwrap();
        supply.turn_off().unwrap();
        assert_eq!(probe.get(), 0.0);

        let mut stuck = SimulatedPowerSupply::new("drift").with_settle_failure();
        stuck.turn_on().unwrap();
        assert!(matches!(
            stuck.wait_for_target(Duration::from_secs(60)),
            Err(PowerSupplyError::SettleTimeout(_, _))
        ));
    }
}
