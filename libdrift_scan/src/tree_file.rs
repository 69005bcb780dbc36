use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::dataset::{
    ClosedDataset, Column, ColumnKind, ColumnSpec, ColumnTable, DatasetStore, DatasetWriter, Schema,
};
use super::error::DatasetError;

const MAGIC: &[u8; 8] = b"DSTREE\0\0";
const FOOTER_MARK: &[u8; 8] = b"DSFOOTER";
const FOOTER_SIZE: u64 = 16;
/// This is the version of the tree file format
const FORMAT_VERSION: u16 = 1;
const KIND_SCALAR: u8 = 0;
const KIND_TRACE: u8 = 1;
const EXTENSION: &str = "tree";

// Layout (little endian)
// magic[8] | version u16 | n_columns u16
// per column: name_len u16 | name utf8 | kind u8 | samples u32
// per row, per column: f64 (scalar) or samples x f64 (trace)
// footer: FOOTER_MARK[8] | n_rows u64

/// Map an early EOF onto a truncation error for this file
fn eof_as_truncated(path: &Path) -> impl Fn(std::io::Error) -> DatasetError + '_ {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            DatasetError::Truncated(path.to_path_buf())
        } else {
            DatasetError::IOError(e)
        }
    }
}

fn row_size_bytes(schema: &Schema) -> u64 {
    schema
        .columns()
        .iter()
        .map(|spec| match spec.kind {
            ColumnKind::Scalar => 8,
            ColumnKind::Trace(samples) => 8 * samples as u64,
        })
        .sum()
}

fn write_header<W: Write>(writer: &mut W, schema: &Schema) -> Result<(), DatasetError> {
    let n_columns = u16::try_from(schema.len())
        .map_err(|_| DatasetError::SchemaMismatch(format!("too many columns: {}", schema.len())))?;
    writer.write_all(MAGIC)?;
    writer.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    writer.write_u16::<LittleEndian>(n_columns)?;
    for spec in schema.columns() {
        let name = spec.name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| DatasetError::BadColumnName(spec.name.clone()))?;
        writer.write_u16::<LittleEndian>(name_len)?;
        writer.write_all(name)?;
        match spec.kind {
            ColumnKind::Scalar => {
                writer.write_u8(KIND_SCALAR)?;
                writer.write_u32::<LittleEndian>(0)?;
            }
            ColumnKind::Trace(samples) => {
                let samples = u32::try_from(samples).map_err(|_| {
                    DatasetError::SchemaMismatch(format!("trace {} is too long", spec.name))
                })?;
                writer.write_u8(KIND_TRACE)?;
                writer.write_u32::<LittleEndian>(samples)?;
            }
        }
    }
    Ok(())
}

/// Read the header, returning the schema and the header size in bytes
fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<(Schema, u64), DatasetError> {
    let truncated = eof_as_truncated(path);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(&truncated)?;
    if &magic != MAGIC {
        return Err(DatasetError::BadMagic(path.to_path_buf()));
    }
    let version = reader.read_u16::<LittleEndian>().map_err(&truncated)?;
    if version != FORMAT_VERSION {
        return Err(DatasetError::BadVersion(path.to_path_buf(), version));
    }
    let n_columns = reader.read_u16::<LittleEndian>().map_err(&truncated)?;
    let mut header_size: u64 = 12;
    let mut columns = Vec::with_capacity(n_columns as usize);
    for _ in 0..n_columns {
        let name_len = reader.read_u16::<LittleEndian>().map_err(&truncated)?;
        let mut name = vec![0u8; name_len as usize];
        reader.read_exact(&mut name).map_err(&truncated)?;
        let name = String::from_utf8(name).map_err(|e| {
            DatasetError::BadColumnName(String::from_utf8_lossy(e.as_bytes()).to_string())
        })?;
        let kind = match reader.read_u8().map_err(&truncated)? {
            KIND_SCALAR => {
                reader.read_u32::<LittleEndian>().map_err(&truncated)?;
                ColumnKind::Scalar
            }
            KIND_TRACE => {
                ColumnKind::Trace(reader.read_u32::<LittleEndian>().map_err(&truncated)? as usize)
            }
            tag => return Err(DatasetError::BadColumnKind(name, tag)),
        };
        header_size += 2 + name_len as u64 + 1 + 4;
        columns.push(ColumnSpec { name, kind });
    }
    Ok((Schema::new(columns), header_size))
}

/// Work out the row count from the file size and confirm it against the footer
fn read_footer<R: Read + Seek>(
    reader: &mut R,
    path: &Path,
    schema: &Schema,
    header_size: u64,
    file_size: u64,
) -> Result<usize, DatasetError> {
    let truncated = || DatasetError::Truncated(path.to_path_buf());
    if file_size < header_size + FOOTER_SIZE {
        return Err(truncated());
    }
    let data_size = file_size - header_size - FOOTER_SIZE;
    reader.seek(SeekFrom::Start(header_size + data_size))?;
    let mut mark = [0u8; 8];
    reader.read_exact(&mut mark).map_err(eof_as_truncated(path))?;
    if &mark != FOOTER_MARK {
        return Err(truncated());
    }
    let footer_rows = reader
        .read_u64::<LittleEndian>()
        .map_err(eof_as_truncated(path))?;
    let row_size = row_size_bytes(schema);
    let n_rows = if row_size == 0 {
        if data_size != 0 {
            return Err(truncated());
        }
        footer_rows
    } else {
        if data_size % row_size != 0 {
            return Err(truncated());
        }
        data_size / row_size
    };
    if n_rows != footer_rows {
        return Err(truncated());
    }
    reader.seek(SeekFrom::Start(header_size))?;
    Ok(n_rows as usize)
}

/// The default dataset store: one little-endian binary "tree" file per setpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeFileStore;

/// Row-at-a-time writer for a tree file. The footer is written on close, so a file whose
/// writer was dropped is detected as truncated when opened.
#[derive(Debug)]
pub struct TreeFileWriter {
    path: PathBuf,
    schema: Schema,
    file: BufWriter<File>,
    n_rows: usize,
}

impl DatasetWriter for TreeFileWriter {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn append(&mut self, rows: &ColumnTable) -> Result<(), DatasetError> {
        if let Some(diff) = self.schema.difference(&rows.schema()) {
            return Err(DatasetError::SchemaMismatch(diff));
        }
        for row in 0..rows.n_rows() {
            for (_, column) in rows.columns() {
                match column {
                    Column::Scalar(values) => self.file.write_f64::<LittleEndian>(values[row])?,
                    Column::Trace(values) => {
                        for value in values.row(row).iter() {
                            self.file.write_f64::<LittleEndian>(*value)?;
                        }
                    }
                }
            }
        }
        self.n_rows += rows.n_rows();
        Ok(())
    }

    fn close(mut self) -> Result<ClosedDataset, DatasetError> {
        self.file.write_all(FOOTER_MARK)?;
        self.file.write_u64::<LittleEndian>(self.n_rows as u64)?;
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        spdlog::info!(
            "Closed {} with {} events ({})",
            self.path.display(),
            self.n_rows,
            human_bytes::human_bytes(size as f64)
        );
        Ok(ClosedDataset {
            path: self.path,
            schema: self.schema,
            n_rows: self.n_rows,
        })
    }
}

impl DatasetStore for TreeFileStore {
    type Writer = TreeFileWriter;

    fn extension(&self) -> &'static str {
        EXTENSION
    }

    fn create(&self, path: &Path, schema: Schema) -> Result<TreeFileWriter, DatasetError> {
        let mut file = BufWriter::new(File::create(path)?);
        write_header(&mut file, &schema)?;
        Ok(TreeFileWriter {
            path: path.to_path_buf(),
            schema,
            file,
            n_rows: 0,
        })
    }

    fn open(&self, path: &Path) -> Result<ColumnTable, DatasetError> {
        if !path.exists() {
            return Err(DatasetError::BadFilePath(path.to_path_buf()));
        }
        let file_size = path.metadata()?.len();
        let mut reader = BufReader::new(File::open(path)?);
        let (schema, header_size) = read_header(&mut reader, path)?;
        let n_rows = read_footer(&mut reader, path, &schema, header_size, file_size)?;

        let mut columns: Vec<Column> = schema
            .columns()
            .iter()
            .map(|spec| match spec.kind {
                ColumnKind::Scalar => Column::Scalar(Array1::zeros(n_rows)),
                ColumnKind::Trace(samples) => Column::Trace(Array2::zeros((n_rows, samples))),
            })
            .collect();
        let truncated = eof_as_truncated(path);
        for row in 0..n_rows {
            for column in columns.iter_mut() {
                match column {
                    Column::Scalar(values) => {
                        values[row] = reader.read_f64::<LittleEndian>().map_err(&truncated)?
                    }
                    Column::Trace(values) => {
                        for value in values.row_mut(row).iter_mut() {
                            *value = reader.read_f64::<LittleEndian>().map_err(&truncated)?;
                        }
                    }
                }
            }
        }

        let mut table = ColumnTable::new();
        for (spec, column) in schema.columns().iter().zip(columns) {
            table.push_column(&spec.name, column)?;
        }
        Ok(table)
    }

    fn rewrite(&self, path: &Path, table: &ColumnTable) -> Result<(), DatasetError> {
        let tmp_path = path.with_extension(format!("{EXTENSION}.tmp"));
        let result = self
            .create(&tmp_path, table.schema())
            .and_then(|mut writer| {
                writer.append(table)?;
                writer.close()
            })
            .and_then(|_| std::fs::rename(&tmp_path, path).map_err(DatasetError::from));
        if result.is_err() && tmp_path.exists() {
            // The original is untouched; only the partial copy has to go
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
        let file_size = path.metadata()?.len();
        let mut reader = BufReader::new(File::open(path)?);
        let (schema, header_size) = read_header(&mut reader, path)?;
        let n_rows = read_footer(&mut reader, path, &schema, header_size, file_size)?;
        Ok(ClosedDataset {
            path: path.to_path_buf(),
            schema,
            n_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn block(offset: f64) -> ColumnTable {
        let mut table = ColumnTable::new();
        table
            .push_column(
                "time",
                Column::Trace(array![[0.0, 1.0, 2.0], [0.0, 1.0, 2.0]]),
            )
            .unwrap();
        table
            .push_column(
                "CH3",
                Column::Trace(array![[offset, f64::NAN, -1.5], [4.0, 5.0, offset]]),
            )
            .unwrap();
        table
            .push_column("drift_voltage", Column::Scalar(array![95.0, 95.0]))
            .unwrap();
        table
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap_10.0_mesh_340.0_drift_95.0.tree");
        let store = TreeFileStore;
        let first = block(1.0);
        let mut writer = store.create(&path, first.schema()).unwrap();
        writer.append(&first).unwrap();
        writer.append(&block(2.0)).unwrap();
        let closed = writer.close().unwrap();
        assert_eq!(closed.n_rows, 4);

        let table = store.open(&path).unwrap();
        assert_eq!(table.n_rows(), 4);
        assert_eq!(table.schema(), first.schema());
        let ch3 = table.trace("CH3").unwrap();
        assert_eq!(ch3[[0, 0]], 1.0);
        assert!(ch3[[0, 1]].is_nan());
        assert_eq!(ch3[[3, 2]], 2.0);

        let inspected = store.inspect(&path).unwrap();
        assert_eq!(inspected, closed);
    }

    #[test]
    fn test_schema_change_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tree");
        let store = TreeFileStore;
        let first = block(1.0);
        let mut writer = store.create(&path, first.schema()).unwrap();
        writer.append(&first).unwrap();

        let mut other = ColumnTable::new();
        other
            .push_column("time", Column::Trace(array![[0.0, 1.0, 2.0]]))
            .unwrap();
        other
            .push_column("CH2", Column::Trace(array![[0.0, 1.0, 2.0]]))
            .unwrap();
        other
            .push_column("drift_voltage", Column::Scalar(array![95.0]))
            .unwrap();
        assert!(matches!(
            writer.append(&other),
            Err(DatasetError::SchemaMismatch(_))
        ));
        writer.close().unwrap();

        let table = store.open(&path).unwrap();
        assert_eq!(table.n_rows(), 2);
        assert!(table.column("CH2").is_none());
    }

    #[test]
    fn test_unclosed_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tree");
        let store = TreeFileStore;
        {
            let first = block(1.0);
            let mut writer = store.create(&path, first.schema()).unwrap();
            writer.append(&first).unwrap();
        }
        assert!(matches!(
            store.open(&path),
            Err(DatasetError::Truncated(_))
        ));
    }

    #[test]
    fn test_bad_magic_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tree");
        std::fs::write(&path, b"definitely not a tree file").unwrap();
        assert!(matches!(
            TreeFileStore.open(&path),
            Err(DatasetError::BadMagic(_))
        ));
        assert!(matches!(
            TreeFileStore.open(&dir.path().join("absent.tree")),
            Err(DatasetError::BadFilePath(_))
        ));
    }

    #[test]
    fn test_rewrite_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tree");
        let store = TreeFileStore;
        let mut table = block(1.0);
        let mut writer = store.create(&path, table.schema()).unwrap();
        writer.append(&table).unwrap();
        writer.close().unwrap();

        table
            .push_column("peak_height", Column::Scalar(array![0.5, 0.25]))
            .unwrap();
        store.rewrite(&path, &table).unwrap();

        let back = store.open(&path).unwrap();
        assert_eq!(back.n_columns(), 4);
        assert_eq!(back.scalar("peak_height").unwrap(), &array![0.5, 0.25]);
        assert!(!path.with_extension("tree.tmp").exists());
    }

    #[test]
    fn test_failed_rewrite_removes_partial_copy() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the dataset should be makes the final rename fail
        let path = dir.path().join("data.tree");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
        let store = TreeFileStore;

        assert!(store.rewrite(&path, &block(1.0)).is_err());
        assert!(!path.with_extension("tree.tmp").exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn test_metadata_only_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tree");
        let schema = Schema::new(vec![ColumnSpec::new("drift_voltage", ColumnKind::Scalar)]);
        let closed = TreeFileStore.create(&path, schema).unwrap().close().unwrap();
        assert_eq!(closed.n_rows, 0);
        let table = TreeFileStore.open(&path).unwrap();
        assert_eq!(table.n_rows(), 0);
        assert_eq!(table.n_columns(), 1);
    }
}
