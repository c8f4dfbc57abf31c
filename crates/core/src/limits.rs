//! Resource limits attached to a task.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Memory/disk limit pair, in bytes.
///
/// A zero sub-limit means "unset": the corresponding backend limit
/// operation is never invoked for that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLimits {
    pub memory_limit_bytes: u64,
    pub disk_limit_bytes: u64,
}

impl TaskLimits {
    pub const fn new(memory_limit_bytes: u64, disk_limit_bytes: u64) -> Self {
        Self {
            memory_limit_bytes,
            disk_limit_bytes,
        }
    }

    /// From whole megabytes, as carried by control-plane messages.
    /// Rejects values whose byte count does not fit in a `u64`.
    pub fn from_megabytes(memory_mb: u64, disk_mb: u64) -> Result<Self> {
        let memory_limit_bytes = memory_mb
            .checked_mul(BYTES_PER_MEGABYTE)
            .ok_or_else(|| Error::limit_invalid(format!("memory limit {memory_mb} MB overflows")))?;
        let disk_limit_bytes = disk_mb
            .checked_mul(BYTES_PER_MEGABYTE)
            .ok_or_else(|| Error::limit_invalid(format!("disk limit {disk_mb} MB overflows")))?;
        Ok(Self {
            memory_limit_bytes,
            disk_limit_bytes,
        })
    }

    /// Start-request policy: both sub-limits must be strictly positive.
    pub fn is_valid(&self) -> bool {
        self.memory_limit_bytes > 0 && self.disk_limit_bytes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_positive_is_valid() {
        assert!(TaskLimits::new(1, 1).is_valid());
    }

    #[test]
    fn zero_sub_limit_is_invalid() {
        assert!(!TaskLimits::new(0, 1).is_valid());
        assert!(!TaskLimits::new(1, 0).is_valid());
        assert!(!TaskLimits::new(0, 0).is_valid());
    }

    #[test]
    fn megabytes_convert_to_bytes() {
        let limits = TaskLimits::from_megabytes(32, 1).unwrap();
        assert_eq!(limits.memory_limit_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.disk_limit_bytes, 1024 * 1024);
    }

    #[test]
    fn overflowing_megabytes_are_rejected() {
        assert!(matches!(
            TaskLimits::from_megabytes(u64::MAX, 1),
            Err(Error::LimitInvalid(_))
        ));
        assert!(matches!(
            TaskLimits::from_megabytes(1, u64::MAX / 2),
            Err(Error::LimitInvalid(_))
        ));
    }
}
