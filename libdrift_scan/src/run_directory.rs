use std::path::{Path, PathBuf};

use super::error::RunDirectoryError;

const RUN_PREFIX: &str = "run_";
const MANIFEST_NAME: &str = "manifest.yml";

/// Construct the run string, e.g. run_0004
pub fn get_run_str(run_number: u32) -> String {
    format!("{RUN_PREFIX}{run_number:0>4}")
}

/// Parse the run number out of a run directory name. Anything not of the form run_<digits> is None
fn parse_run_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(RUN_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Find the next free run number under root: one past the highest existing run, or 1.
///
/// Entries that are not directories or do not follow the run naming are ignored. A missing
/// root is not an error; it simply has no runs yet.
pub fn next_run_number(root: &Path) -> Result<u32, RunDirectoryError> {
    if !root.exists() {
        return Ok(1);
    }
    let mut max_run: Option<u32> = None;
    for item in root.read_dir()? {
        let item_path = item?.path();
        if !item_path.is_dir() {
            continue;
        }
        if let Some(number) = parse_run_number(&item_path) {
            max_run = Some(max_run.map_or(number, |current| current.max(number)));
        }
    }
    match max_run {
        None => Ok(1),
        Some(max) => max
            .checked_add(1)
            .ok_or(RunDirectoryError::Exhausted(root.to_path_buf())),
    }
}

/// One run on disk: a numbered directory holding a dataset per setpoint and the run manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    number: u32,
    path: PathBuf,
}

impl RunDirectory {
    /// Allocate and create the next run directory under root
    pub fn allocate(root: &Path) -> Result<Self, RunDirectoryError> {
        let number = next_run_number(root)?;
        let path = root.join(get_run_str(number));
        std::fs::create_dir_all(&path)?;
        Ok(Self { number, path })
    }

    /// Open an existing run directory
    pub fn open(root: &Path, number: u32) -> Result<Self, RunDirectoryError> {
        let path = root.join(get_run_str(number));
        if path.is_dir() {
            Ok(Self { number, path })
        } else {
            Err(RunDirectoryError::MissingRun(number, root.to_path_buf()))
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_run_skips_garbage() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("run_0001")).unwrap();
        std::fs::create_dir(root.path().join("run_0003")).unwrap();
        std::fs::create_dir(root.path().join("garbage")).unwrap();
        std::fs::create_dir(root.path().join("run_")).unwrap();
        std::fs::create_dir(root.path().join("run_12b")).unwrap();
        // A file with a run name is not a run
        std::fs::write(root.path().join("run_0042"), b"not a directory").unwrap();

        assert_eq!(next_run_number(root.path()).unwrap(), 4);
        let run = RunDirectory::allocate(root.path()).unwrap();
        assert_eq!(run.number(), 4);
        assert!(root.path().join("run_0004").is_dir());
    }

    #[test]
    fn test_next_run_empty_and_absent() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(next_run_number(root.path()).unwrap(), 1);
        let absent = root.path().join("nothing_here");
        assert_eq!(next_run_number(&absent).unwrap(), 1);

        let run = RunDirectory::allocate(&absent).unwrap();
        assert_eq!(run.path(), absent.join("run_0001"));
    }

    #[test]
    fn test_run_numbers_exhausted() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join(get_run_str(u32::MAX))).unwrap();
        assert!(matches!(
            next_run_number(root.path()),
            Err(RunDirectoryError::Exhausted(_))
        ));
        assert!(RunDirectory::allocate(root.path()).is_err());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_open_missing_run() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            RunDirectory::open(root.path(), 7),
            Err(RunDirectoryError::MissingRun(7, _))
        ));
    }
}
