use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Filesystem layout for live and rewind output. Cloned per session so the
/// rewind flag can differ from the global default when the admission service
/// disables rewind for a stream.
#[derive(Debug, Clone)]
pub struct Storage {
    pub root_dir: PathBuf,
    pub rewind_root: PathBuf,
    pub enable_rewind: bool,
}

impl Storage {
    pub fn new<P: Into<PathBuf>>(root_dir: P, rewind_root: P, enable_rewind: bool) -> Self {
        Self {
            root_dir: root_dir.into(),
            rewind_root: rewind_root.into(),
            enable_rewind,
        }
    }

    pub fn stream_dir(&self, stream_name: &str) -> PathBuf {
        self.root_dir.join(stream_name)
    }

    pub fn rewind_dir(&self, stream_name: &str) -> PathBuf {
        self.rewind_root.join(stream_name)
    }

    /// Create the live (and, when enabled, rewind) directory for a stream.
    pub fn ensure_stream_dirs(&self, stream_name: &str) -> io::Result<(PathBuf, Option<PathBuf>)> {
        let live_dir = self.stream_dir(stream_name);
        create_dir_all(&live_dir)?;
        let rewind_dir = if self.enable_rewind {
            let dir = self.rewind_dir(stream_name);
            create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };
        Ok((live_dir, rewind_dir))
    }

    /// Remove a stream's output directories. The name must be non-empty:
    /// removing the storage root itself would take every stream with it.
    pub fn remove_stream_dirs(&self, stream_name: &str) -> io::Result<()> {
        if stream_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty stream name",
            ));
        }
        remove_dir_all(&self.stream_dir(stream_name))?;
        if self.enable_rewind {
            remove_dir_all(&self.rewind_dir(stream_name))?;
        }
        Ok(())
    }
}

fn create_dir_all(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

fn remove_dir_all(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn create_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);
    options.open(path)
}

/// Write `data` to `.<basename>.tmp` in the target directory, then rename
/// over the destination. Readers never observe a partial file.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(dir)?;
    let base = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{}.tmp", base.to_string_lossy()));
    {
        let mut file = create_file(&tmp)?;
        file.write_all(data)?;
    }
    fs::rename(&tmp, path)
}

/// Hardlink `src` to `dst`, falling back to a copy + fsync when the link
/// fails (cross-device rewind roots).
pub fn copy_or_link(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(dir) = dst.parent() {
        create_dir_all(dir)?;
    }
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    let mut reader = fs::File::open(src)?;
    let mut writer = create_file(dst)?;
    io::copy(&mut reader, &mut writer)?;
    writer.sync_all()
}

/// Remove a file, treating a missing file as success.
pub fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.m3u8");
        write_file_atomic(&path, b"one").unwrap();
        write_file_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // no temp file left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn copy_or_link_duplicates_bytes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("seg.m4s");
        let dst = dir.path().join("rewind").join("seg.m4s");
        fs::write(&src, b"payload").unwrap();
        copy_or_link(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn remove_file_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        assert!(remove_file(&dir.path().join("nope.m4s")).is_ok());
    }

    #[test]
    fn remove_stream_dirs_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().to_path_buf(), dir.path().join("rw"), true);
        assert!(storage.remove_stream_dirs("").is_err());
    }

    #[test]
    fn ensure_and_remove_stream_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("live"), dir.path().join("rw"), true);
        let (live, rewind) = storage.ensure_stream_dirs("abc").unwrap();
        assert!(live.is_dir());
        assert!(rewind.unwrap().is_dir());
        storage.remove_stream_dirs("abc").unwrap();
        assert!(!storage.stream_dir("abc").exists());
    }
}
