//! File Mutex: serializes writers to a configuration file across both
//! in-process callers and cooperating external processes.

use crate::error::{Result, SupervisorError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// An advisory lock around a filesystem path.
///
/// `Lock`/`Unlock` are total: failure to obtain the kernel lock is an
/// irrecoverable error, surfaced to callers as [`SupervisorError::FatalStartup`].
pub struct FileMutex {
    path: PathBuf,
    in_process: Mutex<()>,
    file: File,
}

impl FileMutex {
    /// Opens (creating if absent) the backing file read-only, mode 0777.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .mode(0o777)
            .open(&path)
            .map_err(|source| SupervisorError::FatalStartup(format!(
                "{}: could not open for locking ({source})",
                path.display()
            )))?;
        Ok(FileMutex {
            path,
            in_process: Mutex::new(()),
            file,
        })
    }

    /// Acquires the in-process mutex, then an exclusive advisory lock on the
    /// backing file. Blocks the calling thread until both are held.
    pub fn lock(&self) -> Result<FileMutexGuard<'_>> {
        let guard = self.in_process.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.file.lock_exclusive().map_err(|source| {
            SupervisorError::FatalStartup(format!(
                "{}: failed to acquire file lock ({source})",
                self.path.display()
            ))
        })?;
        Ok(FileMutexGuard {
            _in_process: guard,
            file: &self.file,
            path: &self.path,
        })
    }
}

/// Held while the lock is outstanding. Releases the file lock then the
/// in-process mutex (reverse acquisition order) on drop.
pub struct FileMutexGuard<'a> {
    _in_process: std::sync::MutexGuard<'a, ()>,
    file: &'a File,
    path: &'a Path,
}

impl Drop for FileMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(source) = self.file.unlock() {
            tracing::error!(path = %self.path.display(), %source, "failed to release file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_excludes_concurrent_in_process_callers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mutex = Arc::new(FileMutex::new(&path).unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));

        let m1 = mutex.clone();
        let o1 = order.clone();
        let t1 = std::thread::spawn(move || {
            let _g = m1.lock().unwrap();
            o1.lock().unwrap().push(1);
            std::thread::sleep(std::time::Duration::from_millis(20));
            o1.lock().unwrap().push(2);
        });

        std::thread::sleep(std::time::Duration::from_millis(5));
        let _g = mutex.lock().unwrap();
        order.lock().unwrap().push(3);

        t1.join().unwrap();
        let seq = order.lock().unwrap().clone();
        // Either thread can go first, but `1` and `2` must be contiguous:
        // the second locker cannot observe the interval between them.
        let idx1 = seq.iter().position(|&x| x == 1).unwrap();
        let idx2 = seq.iter().position(|&x| x == 2).unwrap();
        assert_eq!(idx2, idx1 + 1);
    }
}
