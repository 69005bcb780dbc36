use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RunDirectoryError {
    #[error("RunDirectory failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("RunDirectory could not find run {0} in {1:?}")]
    MissingRun(u32, PathBuf),
    #[error("RunDirectory has no run number left after the last run in {0:?}")]
    Exhausted(PathBuf),
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not open dataset because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Dataset file {0:?} is not a tree file; bad magic")]
    BadMagic(PathBuf),
    #[error("Dataset file {0:?} has unsupported format version {1}")]
    BadVersion(PathBuf, u16),
    #[error("Dataset file {0:?} is truncated or was never closed")]
    Truncated(PathBuf),
    #[error("Dataset column {0} has unknown kind tag {1}")]
    BadColumnKind(String, u8),
    #[error("Dataset column name is invalid: {0}")]
    BadColumnName(String),
    #[error("Dataset rows do not match the fixed schema: {0}")]
    SchemaMismatch(String),
    #[error("Dataset column {0} has {1} rows; expected {2}")]
    RowCountMismatch(String, usize, usize),
    #[error("Dataset has no column named {0}")]
    MissingColumn(String),
    #[error("Dataset column {0} is not a {1} column")]
    WrongColumnKind(String, &'static str),
    #[error("Dataset failed due to array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[cfg(feature = "hdf5")]
    #[error("Dataset failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Manifest failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Manifest failed to format a timestamp: {0}")]
    TimeError(#[from] time::error::Format),
    #[error("Manifest has no dataset named {0}")]
    UnknownDataset(String),
    #[error("Could not load manifest because file {0:?} does not exist")]
    BadFilePath(PathBuf),
}

#[derive(Debug, Error)]
pub enum DigitizerError {
    #[error("Digitizer communication failed: {0}")]
    Communication(String),
    #[error("Digitizer was asked to capture before being configured")]
    NotConfigured,
    #[error("Digitizer has no channel {0}")]
    BadChannel(u8),
    #[error("Digitizer returned traces of mismatched shape: {0}")]
    ShapeMismatch(String),
}

#[derive(Debug, Error)]
pub enum PowerSupplyError {
    #[error("Power supply channel {0} did not reach its setpoint within {1:?}")]
    SettleTimeout(String, Duration),
    #[error("Power supply channel {0} communication failed: {1}")]
    Communication(String, String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FitError {
    #[error("Fit needs at least 3 finite values; got {0}")]
    TooFewValues(usize),
    #[error("Fit initial guess is degenerate: {0}")]
    DegenerateInput(String),
    #[error("Fit did not converge after {0} iterations")]
    NotConverged(usize),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis failed due to Dataset error: {0}")]
    DatasetError(#[from] DatasetError),
    #[error("Analysis consistency check failed for {0:?}: {1}")]
    Consistency(PathBuf, String),
    #[error("Dataset {0:?} already contains feature column {1}")]
    AlreadyAnalyzed(PathBuf, String),
    #[error("Analysis job {0} panicked")]
    JobPanicked(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline could not spawn an analysis worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scan failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Scan failed due to RunDirectory error: {0}")]
    RunDirectoryError(#[from] RunDirectoryError),
    #[error("Scan failed due to Dataset error: {0}")]
    DatasetError(#[from] DatasetError),
    #[error("Scan failed due to Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
    #[error("Scan failed due to Digitizer error: {0}")]
    DigitizerError(#[from] DigitizerError),
    #[error("Scan failed due to PowerSupply error: {0}")]
    PowerSupplyError(#[from] PowerSupplyError),
    #[error("Scan failed due to Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to RunDirectory error: {0}")]
    RunDirectoryError(#[from] RunDirectoryError),
    #[error("Processor failed due to Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
    #[error("Processor failed due to Scan error: {0}")]
    ScanError(#[from] ScanError),
}
