use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Sidecar file recording which log the current run writes to
///
/// The file holds a single line with the path of the active log. The acquisition
/// process reads the same file to know where to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerFile {
    path: PathBuf,
}

impl PointerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded log path
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the pointer file does not exist or its first line is blank.
    pub fn read(&self) -> std::io::Result<Option<PathBuf>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .next()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the recorded log path
    ///
    /// Writes to a temporary sibling and renames it over the pointer, so a reader
    /// never sees a half-written path.
    pub fn write(&self, log_path: &Path) -> std::io::Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, log_path.to_string_lossy().as_bytes())?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            "Pointer {} now refers to {}",
            self.path.display(),
            log_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let pointer = PointerFile::new(dir.path().join("db_loc.txt"));
        assert_eq!(pointer.read().unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let pointer = PointerFile::new(dir.path().join("db_loc.txt"));
        let log = dir.path().join("anubis_low-voltage_3522_04-09-2017.db");

        pointer.write(&log).unwrap();
        assert_eq!(pointer.read().unwrap(), Some(log.clone()));

        // Single line, no trailing newline, as the acquisition script expects
        let raw = fs::read_to_string(pointer.path()).unwrap();
        assert_eq!(raw, log.to_string_lossy());
    }

    #[test]
    fn test_read_tolerates_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let pointer = PointerFile::new(dir.path().join("db_loc.txt"));
        fs::write(pointer.path(), "run.db\n").unwrap();

        assert_eq!(pointer.read().unwrap(), Some(PathBuf::from("run.db")));
    }

    #[test]
    fn test_read_blank_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let pointer = PointerFile::new(dir.path().join("db_loc.txt"));
        fs::write(pointer.path(), "\n").unwrap();

        assert_eq!(pointer.read().unwrap(), None);
    }
}
