use ndarray::{Array1, Array2};

use super::dataset::{Column, ColumnKind, ColumnSpec, ColumnTable, Schema};
use super::error::{DatasetError, DigitizerError};
use super::scan_plan::Setpoint;

pub const TIME_NAME: &str = "time";

/// Column name for a digitizer channel, e.g. CH3
pub fn channel_column_name(channel: u8) -> String {
    format!("CH{channel}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelTrace {
    pub name: String,
    pub values: Array2<f64>,
}

impl ChannelTrace {
    pub fn new(channel: u8, values: Array2<f64>) -> Self {
        Self {
            name: channel_column_name(channel),
            values,
        }
    }
}

/// The traces produced by one trigger sequence.
///
/// Rows are events (one per segment in sequence mode), columns are samples. The time axis and
/// every channel share one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBatch {
    time: Array2<f64>,
    channels: Vec<ChannelTrace>,
}

impl CaptureBatch {
    pub fn new(time: Array2<f64>, channels: Vec<ChannelTrace>) -> Result<Self, DigitizerError> {
        if channels.is_empty() {
            return Err(DigitizerError::ShapeMismatch(String::from(
                "capture contains no channels",
            )));
        }
        for (idx, trace) in channels.iter().enumerate() {
            if trace.values.shape() != time.shape() {
                return Err(DigitizerError::ShapeMismatch(format!(
                    "channel {} has shape {:?} but the time axis has shape {:?}",
                    trace.name,
                    trace.values.shape(),
                    time.shape()
                )));
            }
            if trace.name == TIME_NAME || channels[..idx].iter().any(|c| c.name == trace.name) {
                return Err(DigitizerError::ShapeMismatch(format!(
                    "duplicate channel {}",
                    trace.name
                )));
            }
        }
        Ok(Self { time, channels })
    }

    pub fn n_events(&self) -> usize {
        self.time.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.time.ncols()
    }

    pub fn time(&self) -> &Array2<f64> {
        &self.time
    }

    pub fn channels(&self) -> &[ChannelTrace] {
        &self.channels
    }

    /// The dataset schema this batch implies for the given setpoint
    pub fn schema(&self, setpoint: &Setpoint) -> Schema {
        let trace_kind = ColumnKind::Trace(self.n_samples());
        let mut columns = vec![ColumnSpec::new(TIME_NAME, trace_kind)];
        for trace in self.channels.iter() {
            columns.push(ColumnSpec::new(&trace.name, trace_kind));
        }
        for (name, _) in setpoint.metadata() {
            columns.push(ColumnSpec::new(name, ColumnKind::Scalar));
        }
        Schema::new(columns)
    }

    /// Turn the batch into event records: the traces plus the setpoint metadata broadcast onto
    /// every row
    pub fn into_event_block(self, setpoint: &Setpoint) -> Result<ColumnTable, DatasetError> {
        let n_events = self.n_events();
        let mut block = ColumnTable::new();
        block.push_column(TIME_NAME, Column::Trace(self.time))?;
        for trace in self.channels {
            block.push_column(&trace.name, Column::Trace(trace.values))?;
        }
        for (name, value) in setpoint.metadata() {
            block.push_column(name, Column::Scalar(Array1::from_elem(n_events, value)))?;
        }
        Ok(block)
    }
}
