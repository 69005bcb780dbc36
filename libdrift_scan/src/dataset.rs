//! The per-setpoint dataset model and the store interface.
//!
//! A dataset is an append-only table of events. Its [`Schema`] is fixed by the first block of
//! rows written to it; after that every appended block must match exactly. Once a writer is
//! closed the dataset is represented by a [`ClosedDataset`] token, which is what gets handed
//! to an analysis job.
use ndarray::{concatenate, Array1, Array2, Axis};
use std::path::{Path, PathBuf};

use super::error::DatasetError;
use super::scan_plan::Setpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// One value per event
    Scalar,
    /// A fixed-length trace per event
    Trace(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Ordered column layout of a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|spec| spec.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|spec| spec.name.as_str()).collect()
    }

    /// Describe how other differs from self, or None if they are identical
    pub fn difference(&self, other: &Schema) -> Option<String> {
        if self == other {
            return None;
        }
        if self.names() != other.names() {
            return Some(format!(
                "expected columns {:?}, got {:?}",
                self.names(),
                other.names()
            ));
        }
        self.columns
            .iter()
            .zip(other.columns.iter())
            .find(|(a, b)| a.kind != b.kind)
            .map(|(a, b)| {
                format!(
                    "column {} expected {:?}, got {:?}",
                    a.name, a.kind, b.kind
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Scalar(Array1<f64>),
    Trace(Array2<f64>),
}

impl Column {
    pub fn n_rows(&self) -> usize {
        match self {
            Self::Scalar(values) => values.len(),
            Self::Trace(values) => values.nrows(),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Scalar(_) => ColumnKind::Scalar,
            Self::Trace(values) => ColumnKind::Trace(values.ncols()),
        }
    }

    /// Exact equality down to the bit pattern of every value (NaN compares equal to itself)
    pub fn bitwise_eq(&self, other: &Column) -> bool {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::Trace(a), Self::Trace(b)) => {
                a.shape() == b.shape()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => false,
        }
    }
}

/// An in-memory block of rows: named columns that all share one row count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnTable {
    n_rows: usize,
    columns: Vec<(String, Column)>,
}

impl ColumnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty (zero row) table laid out according to schema
    pub fn empty(schema: &Schema) -> Self {
        let mut table = Self::new();
        for spec in schema.columns() {
            let column = match spec.kind {
                ColumnKind::Scalar => Column::Scalar(Array1::zeros(0)),
                ColumnKind::Trace(samples) => Column::Trace(Array2::zeros((0, samples))),
            };
            table.columns.push((spec.name.clone(), column));
        }
        table
    }

    /// Add a column. The first column fixes the row count; names must be unique
    pub fn push_column(&mut self, name: &str, column: Column) -> Result<(), DatasetError> {
        if self.column(name).is_some() {
            return Err(DatasetError::SchemaMismatch(format!(
                "duplicate column {name}"
            )));
        }
        if self.columns.is_empty() {
            self.n_rows = column.n_rows();
        } else if column.n_rows() != self.n_rows {
            return Err(DatasetError::RowCountMismatch(
                name.to_string(),
                column.n_rows(),
                self.n_rows,
            ));
        }
        self.columns.push((name.to_string(), column));
        Ok(())
    }

    /// Append the rows of other to this table. Schemas must match exactly
    pub fn append_rows(&mut self, other: &ColumnTable) -> Result<(), DatasetError> {
        if let Some(diff) = self.schema().difference(&other.schema()) {
            return Err(DatasetError::SchemaMismatch(diff));
        }
        for ((_, mine), (_, theirs)) in self.columns.iter_mut().zip(other.columns.iter()) {
            *mine = match (&*mine, theirs) {
                (Column::Scalar(a), Column::Scalar(b)) => {
                    Column::Scalar(concatenate(Axis(0), &[a.view(), b.view()])?)
                }
                (Column::Trace(a), Column::Trace(b)) => {
                    Column::Trace(concatenate(Axis(0), &[a.view(), b.view()])?)
                }
                _ => {
                    return Err(DatasetError::SchemaMismatch(String::from(
                        "column kinds changed while appending",
                    )))
                }
            };
        }
        self.n_rows += other.n_rows;
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(col_name, _)| col_name == name)
            .map(|(_, column)| column)
    }

    pub fn scalar(&self, name: &str) -> Result<&Array1<f64>, DatasetError> {
        match self.column(name) {
            Some(Column::Scalar(values)) => Ok(values),
            Some(Column::Trace(_)) => {
                Err(DatasetError::WrongColumnKind(name.to_string(), "scalar"))
            }
            None => Err(DatasetError::MissingColumn(name.to_string())),
        }
    }

    pub fn trace(&self, name: &str) -> Result<&Array2<f64>, DatasetError> {
        match self.column(name) {
            Some(Column::Trace(values)) => Ok(values),
            Some(Column::Scalar(_)) => {
                Err(DatasetError::WrongColumnKind(name.to_string(), "trace"))
            }
            None => Err(DatasetError::MissingColumn(name.to_string())),
        }
    }

    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|(name, column)| ColumnSpec::new(name, column.kind()))
                .collect(),
        )
    }
}

/// A dataset whose writer has been closed. Ownership of the file passes with this token
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedDataset {
    pub path: PathBuf,
    pub schema: Schema,
    pub n_rows: usize,
}

impl ClosedDataset {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Writable handle to a dataset being filled
pub trait DatasetWriter {
    fn schema(&self) -> &Schema;
    fn n_rows(&self) -> usize;

    /// Append a block of rows. Blocks not matching the schema are rejected without writing anything
    fn append(&mut self, rows: &ColumnTable) -> Result<(), DatasetError>;

    /// Flush everything to storage and give up write access
    fn close(self) -> Result<ClosedDataset, DatasetError>;
}

/// A persistent columnar dataset format
pub trait DatasetStore: Send + Sync {
    type Writer: DatasetWriter;

    /// File extension used for datasets of this store
    fn extension(&self) -> &'static str;

    fn create(&self, path: &Path, schema: Schema) -> Result<Self::Writer, DatasetError>;
    fn open(&self, path: &Path) -> Result<ColumnTable, DatasetError>;

    /// Replace the dataset at path with table
    fn rewrite(&self, path: &Path, table: &ColumnTable) -> Result<(), DatasetError>;

    /// Describe a closed dataset on disk without keeping its data
    fn inspect(&self, path: &Path) -> Result<ClosedDataset, DatasetError> {
        let table = self.open(path)?;
        Ok(ClosedDataset {
            path: path.to_path_buf(),
            schema: table.schema(),
            n_rows: table.n_rows(),
        })
    }
}

/// The dataset of the setpoint currently being captured.
///
/// Storage is created lazily with the schema of the first block appended, so the schema is
/// whatever the first successful capture looked like.
pub struct SetpointDataset<S: DatasetStore> {
    path: PathBuf,
    writer: Option<S::Writer>,
}

impl<S: DatasetStore> SetpointDataset<S> {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_rows(&self) -> usize {
        self.writer.as_ref().map_or(0, |writer| writer.n_rows())
    }

    /// Append a block, fixing the schema if this is the first one. Returns the rows written
    pub fn append(&mut self, store: &S, block: &ColumnTable) -> Result<usize, DatasetError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => store.create(&self.path, block.schema())?,
        };
        self.writer.insert(writer).append(block)?;
        Ok(block.n_rows())
    }

    /// Close the dataset. A setpoint without any capture still gets an (empty) dataset
    pub fn close(self, store: &S, setpoint: &Setpoint) -> Result<ClosedDataset, DatasetError> {
        match self.writer {
            Some(writer) => writer.close(),
            None => store
                .create(&self.path, setpoint.metadata_schema())?
                .close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_table() -> ColumnTable {
        let mut table = ColumnTable::new();
        table
            .push_column("time", Column::Trace(array![[0.0, 1.0], [0.0, 1.0]]))
            .unwrap();
        table
            .push_column("drift_voltage", Column::Scalar(array![95.0, 95.0]))
            .unwrap();
        table
    }

    #[test]
    fn test_push_column_checks_rows_and_names() {
        let mut table = small_table();
        assert!(matches!(
            table.push_column("extra", Column::Scalar(array![1.0])),
            Err(DatasetError::RowCountMismatch(_, 1, 2))
        ));
        assert!(matches!(
            table.push_column("time", Column::Scalar(array![1.0, 2.0])),
            Err(DatasetError::SchemaMismatch(_))
        ));
        assert_eq!(table.n_columns(), 2);
    }

    #[test]
    fn test_append_rows_requires_same_schema() {
        let mut table = small_table();
        table.append_rows(&small_table()).unwrap();
        assert_eq!(table.n_rows(), 4);
        assert_eq!(table.trace("time").unwrap().nrows(), 4);

        let mut other = ColumnTable::new();
        other
            .push_column("time", Column::Trace(array![[0.0, 1.0, 2.0]]))
            .unwrap();
        other
            .push_column("drift_voltage", Column::Scalar(array![95.0]))
            .unwrap();
        assert!(matches!(
            table.append_rows(&other),
            Err(DatasetError::SchemaMismatch(_))
        ));
        assert_eq!(table.n_rows(), 4);
    }

    #[test]
    fn test_bitwise_eq_treats_nan_as_value() {
        let a = Column::Scalar(array![1.0, f64::NAN]);
        let b = Column::Scalar(array![1.0, f64::NAN]);
        let c = Column::Scalar(array![1.0, 2.0]);
        assert!(a.bitwise_eq(&b));
        assert!(!a.bitwise_eq(&c));
        assert!(!a.bitwise_eq(&Column::Trace(array![[1.0, 2.0]])));
    }

    #[test]
    fn test_accessors_report_kind() {
        let table = small_table();
        assert!(table.scalar("drift_voltage").is_ok());
        assert!(matches!(
            table.scalar("time"),
            Err(DatasetError::WrongColumnKind(_, "scalar"))
        ));
        assert!(matches!(
            table.trace("CH3"),
            Err(DatasetError::MissingColumn(_))
        ));
    }
}
