use hdf5::types::VarLenUnicode;
use hdf5::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::dataset::{
    ClosedDataset, Column, ColumnKind, ColumnSpec, ColumnTable, DatasetStore, DatasetWriter, Schema,
};
use super::error::DatasetError;

const EVENTS_NAME: &str = "events";
const EXTENSION: &str = "h5";
/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

// Structure
// events - columns, n_events, version
// |---- <column>(dset) 1-D for scalars, n_events x samples for traces

fn to_unicode(value: &str) -> Result<VarLenUnicode, DatasetError> {
    VarLenUnicode::from_str(value).map_err(|e| DatasetError::BadColumnName(e.to_string()))
}

/// Datasets stored as HDF5 files, one dataset per column under the events group
#[derive(Debug, Clone, Copy, Default)]
pub struct Hdf5Store;

/// HDF5 datasets are written in one shot, so rows are buffered until close
#[derive(Debug)]
pub struct Hdf5Writer {
    path: PathBuf,
    schema: Schema,
    rows: ColumnTable,
}

impl DatasetWriter for Hdf5Writer {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn n_rows(&self) -> usize {
        self.rows.n_rows()
    }

    fn append(&mut self, rows: &ColumnTable) -> Result<(), DatasetError> {
        self.rows.append_rows(rows)
    }

    fn close(self) -> Result<ClosedDataset, DatasetError> {
        write_table(&self.path, &self.rows)?;
        let size = self.path.metadata()?.len();
        spdlog::info!(
            "Closed {} with {} events ({})",
            self.path.display(),
            self.rows.n_rows(),
            human_bytes::human_bytes(size as f64)
        );
        Ok(ClosedDataset {
            path: self.path,
            schema: self.schema,
            n_rows: self.rows.n_rows(),
        })
    }
}

fn write_table(path: &Path, table: &ColumnTable) -> Result<(), DatasetError> {
    let names = table.schema().names().join("\n");
    let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

    let file = File::create(path)?;
    let events_group = file.create_group(EVENTS_NAME)?;
    events_group
        .new_attr::<VarLenUnicode>()
        .create("columns")?
        .write_scalar(&to_unicode(&names)?)?;
    events_group
        .new_attr::<u64>()
        .create("n_events")?
        .write_scalar(&(table.n_rows() as u64))?;
    events_group
        .new_attr::<VarLenUnicode>()
        .create("version")?
        .write_scalar(&to_unicode(&version)?)?;

    for (name, column) in table.columns() {
        match column {
            Column::Scalar(values) => {
                events_group
                    .new_dataset_builder()
                    .with_data(values)
                    .create(name)?;
            }
            Column::Trace(values) => {
                events_group
                    .new_dataset_builder()
                    .with_data(values)
                    .create(name)?;
            }
        }
    }
    Ok(())
}

fn read_column_names(events_group: &hdf5::Group) -> Result<Vec<String>, DatasetError> {
    let names: VarLenUnicode = events_group.attr("columns")?.read_scalar()?;
    Ok(names
        .as_str()
        .split('\n')
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect())
}

impl DatasetStore for Hdf5Store {
    type Writer = Hdf5Writer;

    fn extension(&self) -> &'static str {
        EXTENSION
    }

    fn create(&self, path: &Path, schema: Schema) -> Result<Hdf5Writer, DatasetError> {
        if let Some(bad) = schema.names().iter().find(|name| name.contains('\n')) {
            return Err(DatasetError::BadColumnName(bad.to_string()));
        }
        // Claim the path now so a never closed dataset still shows up on disk
        File::create(path)?;
        Ok(Hdf5Writer {
            path: path.to_path_buf(),
            rows: ColumnTable::empty(&schema),
            schema,
        })
    }

    fn open(&self, path: &Path) -> Result<ColumnTable, DatasetError> {
        if !path.exists() {
            return Err(DatasetError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let events_group = file
            .group(EVENTS_NAME)
            .map_err(|_| DatasetError::Truncated(path.to_path_buf()))?;
        let mut table = ColumnTable::new();
        for name in read_column_names(&events_group)? {
            let dataset = events_group.dataset(&name)?;
            let column = match dataset.ndim() {
                1 => Column::Scalar(dataset.read_1d::<f64>()?),
                2 => Column::Trace(dataset.read_2d::<f64>()?),
                ndim => return Err(DatasetError::BadColumnKind(name, ndim as u8)),
            };
            table.push_column(&name, column)?;
        }
        Ok(table)
    }

    fn rewrite(&self, path: &Path, table: &ColumnTable) -> Result<(), DatasetError> {
        let tmp_path = path.with_extension(format!("{EXTENSION}.tmp"));
        let result = write_table(&tmp_path, table)
            .and_then(|_| std::fs::rename(&tmp_path, path).map_err(DatasetError::from));
        if result.is_err() && tmp_path.exists() {
            if let Err(e) = std::fs::remove_file(&tmp_path) {
                spdlog::warn!("Could not remove {}: {e}", tmp_path.display());
            }
        }
        result
    }

    fn inspect(&self, path: &Path) -> Result<ClosedDataset, DatasetError> {
        if !path.exists() {
            return Err(DatasetError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let events_group = file
            .group(EVENTS_NAME)
            .map_err(|_| DatasetError::Truncated(path.to_path_buf()))?;
        let n_rows: u64 = events_group.attr("n_events")?.read_scalar()?;
        let mut columns = Vec::new();
        for name in read_column_names(&events_group)? {
            let shape = events_group.dataset(&name)?.shape();
            let kind = match shape.len() {
                1 => ColumnKind::Scalar,
                2 => ColumnKind::Trace(shape[1]),
                ndim => return Err(DatasetError::BadColumnKind(name, ndim as u8)),
            };
            columns.push(ColumnSpec { name, kind });
        }
        Ok(ClosedDataset {
            path: path.to_path_buf(),
            schema: Schema::new(columns),
            n_rows: n_rows as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.h5");
        let mut block = ColumnTable::new();
        block
            .push_column("time", Column::Trace(array![[0.0, 1.0], [0.0, 1.0]]))
            .unwrap();
        block
            .push_column("CH3", Column::Trace(array![[0.5, 1.5], [2.5, 3.5]]))
            .unwrap();
        block
            .push_column("drift_voltage", Column::Scalar(array![95.0, 95.0]))
            .unwrap();

        let mut writer = Hdf5Store.create(&path, block.schema()).unwrap();
        writer.append(&block).unwrap();
        writer.append(&block).unwrap();
        let closed = writer.close().unwrap();
        assert_eq!(closed.n_rows, 4);

        let table = Hdf5Store.open(&path).unwrap();
        assert_eq!(table.schema(), block.schema());
        assert_eq!(table.trace("CH3").unwrap()[[3, 1]], 3.5);
        assert_eq!(Hdf5Store.inspect(&path).unwrap(), closed);
    }
}
