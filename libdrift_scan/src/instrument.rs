//! Collaborator interfaces for the bench hardware.
//!
//! The scan controller only talks to the digitizer and the high voltage supply through
//! these traits. Concrete drivers (oscilloscope over VXI-11, CAEN HV mainframe, ...) live
//! outside this crate; [`crate::simulation`] provides stand-ins for dry runs and tests.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::capture::CaptureBatch;
use super::error::{DigitizerError, PowerSupplyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerMode {
    Auto,
    Normal,
    Single,
    #[default]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleMode {
    RealTime,
    #[default]
    Sequence,
}

/// Acquisition settings pushed to the digitizer once, before the first setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerSettings {
    pub trigger_mode: TriggerMode,
    pub sample_mode: SampleMode,
    pub n_segments: u32,
    pub timeout_s: f64,
    pub channels: Vec<u8>,
}

impl Default for DigitizerSettings {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::Stopped,
            sample_mode: SampleMode::Sequence,
            n_segments: 2500,
            timeout_s: 600.0,
            channels: vec![2, 3],
        }
    }
}

impl DigitizerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

/// A triggered waveform digitizer.
pub trait Digitizer {
    fn configure(&mut self, settings: &DigitizerSettings) -> Result<(), DigitizerError>;

    /// Arm and wait for a trigger sequence, bounded by the configured timeout.
    ///
    /// Returns `Ok(false)` when the sequence timed out; `Err` only for failures the
    /// digitizer cannot recover from.
    fn capture(&mut self) -> Result<bool, DigitizerError>;

    /// Read the traces of the last successful capture for the given channels.
    fn read(&mut self, channels: &[u8]) -> Result<CaptureBatch, DigitizerError>;
}

/// One channel of a high voltage power supply.
pub trait PowerSupplyChannel {
    fn name(&self) -> &str;
    fn set_ramp_rate(&mut self, up: f64, down: f64) -> Result<(), PowerSupplyError>;
    fn set_target(&mut self, voltage: f64) -> Result<(), PowerSupplyError>;
    fn turn_on(&mut self) -> Result<(), PowerSupplyError>;
    fn turn_off(&mut self) -> Result<(), PowerSupplyError>;

    /// Block until the channel reports its target reached.
    ///
    /// Must return [`PowerSupplyError::SettleTimeout`] once `timeout` elapses.
    fn wait_for_target(&mut self, timeout: Duration) -> Result<(), PowerSupplyError>;
}
