use escalor_core::{EscalorError, EscalorResult};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Exclusive ownership of a data directory, held for the lifetime of the
/// owning process.
///
/// Everything under one data dir assumes a single live writer: the queue
/// rewrites full snapshots, the quota ledger admits from an in-memory
/// view loaded at open, and startup recovery re-offers `Running` items on
/// the premise that nothing else is executing them. Acquiring this lock
/// is what makes that premise true. The OS releases the lock when the
/// holder exits, however it exits, so a leftover `LOCK` file from a
/// crashed process never blocks a fresh start.
#[derive(Debug)]
pub struct DataDirLock {
    _file: File,
}

impl DataDirLock {
    /// Acquire the lock, creating `dir` and its `LOCK` file as needed.
    ///
    /// Fails with [`EscalorError::State`] when another live process holds
    /// the directory.
    pub fn acquire(dir: &Path) -> EscalorResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("LOCK");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                let holder = holder.trim();
                return Err(EscalorError::State(if holder.is_empty() {
                    format!("data dir '{}' is locked by another process", dir.display())
                } else {
                    format!(
                        "data dir '{}' is locked by another process (pid {holder})",
                        dir.display()
                    )
                }));
            }
            Err(TryLockError::Error(e)) => return Err(EscalorError::Io(e)),
        }

        // Best-effort pid breadcrumb for the contention message above.
        let _ = file.set_len(0);
        let mut writer = &file;
        let _ = write!(writer, "{}", std::process::id());

        debug!(dir = %dir.display(), "acquired data dir lock");
        Ok(Self { _file: file })
    }
}
