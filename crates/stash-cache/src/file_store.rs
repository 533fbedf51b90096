use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Bound on memory held while spooling a streaming value to disk.
pub(crate) const WRITE_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Allocates, writes, and removes value files under the cache directory.
///
/// Value files are named `<cc>/<dd>/<rest>.val` where `ccdd<rest>` is a
/// fresh 128-bit random identifier rendered as 32 hex characters. The two
/// hex-pair directory levels cap fan-out per directory. Fresh names mean two
/// writers can never collide on a path; removal tolerates a concurrent
/// unlink of the same orphan.
#[derive(Clone, Debug)]
pub(crate) struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub(crate) fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Reserve a fresh relative filename and create its parent directories.
    ///
    /// Returns the path relative to the cache directory (what the metadata
    /// row records) alongside the absolute path.
    pub(crate) fn prep_file(&self) -> Result<(String, PathBuf)> {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let relative = format!("{}/{}/{}.val", &hex[..2], &hex[2..4], &hex[4..]);
        let full_path = self.directory.join(&relative);

        if let Some(parent) = full_path.parent() {
            // create_dir_all treats already-existing directories as success,
            // so writers racing on the same hex prefix are benign.
            fs::create_dir_all(parent)?;
        }

        Ok((relative, full_path))
    }

    /// Write `bytes` to a fresh value file. Returns the relative filename.
    pub(crate) fn write_bytes(&self, bytes: &[u8]) -> Result<String> {
        let (filename, full_path) = self.prep_file()?;
        fs::write(&full_path, bytes)?;
        Ok(filename)
    }

    /// Spool `reader` to a fresh value file in bounded chunks.
    ///
    /// Returns the relative filename and the number of bytes written.
    pub(crate) fn write_reader(&self, reader: &mut dyn Read) -> Result<(String, u64)> {
        let (filename, full_path) = self.prep_file()?;
        let mut writer = fs::File::create(&full_path)?;
        let mut buf = vec![0u8; WRITE_CHUNK_BYTES];
        let mut size = 0u64;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            size += n as u64;
        }

        Ok((filename, size))
    }

    pub(crate) fn full_path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    pub(crate) fn open(&self, filename: &str) -> io::Result<fs::File> {
        fs::File::open(self.full_path(filename))
    }

    pub(crate) fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.full_path(filename))
    }

    pub(crate) fn read_text(&self, filename: &str) -> io::Result<String> {
        fs::read_to_string(self.full_path(filename))
    }

    /// Remove a value file.
    ///
    /// A missing file is accepted silently: two caches may race to unlink a
    /// shared orphan after a lost write. Any other error surfaces.
    pub(crate) fn remove(&self, filename: &str) -> Result<()> {
        let full_path = self.full_path(filename);
        match fs::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    target = "stash.cache",
                    path = %full_path.display(),
                    "value file already removed"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prep_file_uses_two_hex_prefix_levels() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());

        let (filename, full_path) = files.prep_file().unwrap();
        let parts: Vec<&str> = filename.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert!(parts[2].ends_with(".val"));
        assert!(parts[2].trim_end_matches(".val").len() == 28);
        assert!(full_path.parent().unwrap().is_dir());
    }

    #[test]
    fn write_reader_counts_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());

        let payload = vec![0xA5u8; 70_000];
        let (filename, size) = files
            .write_reader(&mut std::io::Cursor::new(payload.clone()))
            .unwrap();
        assert_eq!(size, payload.len() as u64);
        assert_eq!(files.read(&filename).unwrap(), payload);
    }

    #[test]
    fn remove_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());

        files.remove("aa/bb/not-there.val").unwrap();

        let filename = files.write_bytes(b"payload").unwrap();
        files.remove(&filename).unwrap();
        files.remove(&filename).unwrap();
    }
}
