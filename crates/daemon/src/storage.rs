//! Disk quota accounting for relay instances
//!
//! Free space is read through a [`DiskProbe`] so the quota math does not
//! depend on how the platform reports disk usage. A fixed share of the disk
//! is never handed out, and space granted to an instance is reserved up
//! front with a sized lock file in its data directory.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mumblechat_core::Tier;
use thiserror::Error;
use tracing::{debug, info};

const MB: u64 = 1024 * 1024;

/// Share of total disk kept free regardless of allocations
pub const SAFETY_BUFFER_PERCENT: u64 = 10;

/// Reservation file inside an instance directory
pub const LOCK_FILE: &str = "storage.lock";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disk probe failed: {0}")]
    Probe(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
}

impl DiskInfo {
    pub fn total_mb(&self) -> u64 {
        self.total_bytes / MB
    }

    pub fn free_mb(&self) -> u64 {
        self.free_bytes / MB
    }

    pub fn used_mb(&self) -> u64 {
        self.used_bytes / MB
    }
}

/// Source of disk usage for the filesystem holding `path`
pub trait DiskProbe: Send + Sync {
    fn disk_info(&self, path: &Path) -> Result<DiskInfo>;
}

/// Space reported by the filesystem itself (`statvfs` on unix)
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl DiskProbe for FsProbe {
    fn disk_info(&self, path: &Path) -> Result<DiskInfo> {
        // the directory may not exist before the first instance is added
        let mut target = path;
        while !target.exists() {
            match target.parent() {
                Some(parent) => target = parent,
                None => break,
            }
        }

        let total_bytes =
            fs2::total_space(target).map_err(|e| StorageError::Probe(format!("{:?}: {}", target, e)))?;
        let free_bytes =
            fs2::available_space(target).map_err(|e| StorageError::Probe(format!("{:?}: {}", target, e)))?;
        Ok(DiskInfo {
            total_bytes,
            free_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
        })
    }
}

/// Fixed numbers, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub DiskInfo);

impl FixedProbe {
    pub fn from_mb(total_mb: u64, free_mb: u64) -> Self {
        Self(DiskInfo {
            total_bytes: total_mb * MB,
            free_bytes: free_mb * MB,
            used_bytes: total_mb.saturating_sub(free_mb) * MB,
        })
    }
}

impl DiskProbe for FixedProbe {
    fn disk_info(&self, _path: &Path) -> Result<DiskInfo> {
        Ok(self.0)
    }
}

/// Outcome of [`StorageManager::can_allocate_storage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ok: bool,
    pub available_mb: u64,
}

#[derive(Clone)]
pub struct StorageManager {
    probe: Arc<dyn DiskProbe>,
    root: PathBuf,
}

impl StorageManager {
    pub fn new(probe: Arc<dyn DiskProbe>, root: PathBuf) -> Self {
        Self { probe, root }
    }

    /// Manager backed by the real filesystem
    pub fn system(root: PathBuf) -> Self {
        Self::new(Arc::new(FsProbe), root)
    }

    pub fn get_disk_info(&self) -> Result<DiskInfo> {
        self.probe.disk_info(&self.root)
    }

    pub fn safety_buffer_mb(info: &DiskInfo) -> u64 {
        info.total_mb() * SAFETY_BUFFER_PERCENT / 100
    }

    /// Headroom left for new allocations
    pub fn available_mb(&self, allocated_mb: u64) -> Result<u64> {
        let info = self.get_disk_info()?;
        Ok(info
            .free_mb()
            .saturating_sub(allocated_mb)
            .saturating_sub(Self::safety_buffer_mb(&info)))
    }

    /// Whether `requested_mb` fits after existing allocations and the buffer
    pub fn can_allocate_storage(&self, requested_mb: u64, allocated_mb: u64) -> Result<Allocation> {
        let available_mb = self.available_mb(allocated_mb)?;
        let ok = requested_mb <= available_mb;
        debug!(
            "Storage check: requested {} MB, available {} MB -> {}",
            requested_mb, available_mb, ok
        );
        Ok(Allocation { ok, available_mb })
    }

    /// Largest tier the remaining headroom can hold
    pub fn recommended_tier(&self, allocated_mb: u64) -> Result<Option<Tier>> {
        Ok(Tier::recommended_for(self.available_mb(allocated_mb)?))
    }

    /// Reserve `mb` in `dir` by sizing a lock file
    pub fn lock_storage(&self, dir: &Path, mb: u64) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(LOCK_FILE))?;
        file.set_len(mb * MB)?;
        info!("Reserved {} MB in {:?}", mb, dir);
        Ok(())
    }

    /// Drop a reservation; a missing lock file is not an error
    pub fn release_storage(&self, dir: &Path) -> Result<()> {
        match std::fs::remove_file(dir.join(LOCK_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(total_mb: u64, free_mb: u64) -> StorageManager {
        StorageManager::new(
            Arc::new(FixedProbe::from_mb(total_mb, free_mb)),
            std::env::temp_dir(),
        )
    }

    #[test]
    fn test_buffer_and_allocations_are_subtracted() {
        let mgr = manager(10_000, 2_500);
        let check = mgr.can_allocate_storage(2048, 0).unwrap();
        assert!(!check.ok);
        assert_eq!(check.available_mb, 1500);

        assert!(mgr.can_allocate_storage(1500, 0).unwrap().ok);
        assert!(!mgr.can_allocate_storage(1500, 1).unwrap().ok);
    }

    #[test]
    fn test_headroom_never_underflows() {
        let mgr = manager(10_000, 500);
        assert_eq!(mgr.available_mb(4096).unwrap(), 0);
        assert!(!mgr.can_allocate_storage(1, 0).unwrap().ok);
    }

    #[test]
    fn test_recommended_tier() {
        assert_eq!(manager(100_000, 20_000).recommended_tier(0).unwrap(), Some(Tier::Platinum));
        // 5000 free - 1000 buffer = 4000
        assert_eq!(manager(10_000, 5_000).recommended_tier(0).unwrap(), Some(Tier::Silver));
        assert_eq!(manager(10_000, 1_500).recommended_tier(0).unwrap(), None);
    }

    #[test]
    fn test_fs_probe_reads_real_disk() {
        let missing = std::env::temp_dir().join(format!("mumblechat-probe-{}", std::process::id())).join("nodes");
        let info = FsProbe.disk_info(&missing).unwrap();
        assert!(info.total_bytes > 0);
        assert!(info.free_bytes <= info.total_bytes);
        assert_eq!(info.used_bytes, info.total_bytes - info.free_bytes);
    }

    #[test]
    fn test_lock_and_release() {
        let dir = std::env::temp_dir().join(format!("mumblechat-lock-{}", std::process::id()));
        let mgr = manager(10_000, 10_000);
        mgr.lock_storage(&dir, 2).unwrap();
        assert_eq!(std::fs::metadata(dir.join(LOCK_FILE)).unwrap().len(), 2 * MB);
        mgr.release_storage(&dir).unwrap();
        assert!(!dir.join(LOCK_FILE).exists());
        mgr.release_storage(&dir).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
