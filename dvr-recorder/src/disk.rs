use std::path::Path;

use crate::error::DiskError;

/// Disk usage percentage for the filesystem containing `path`.
#[cfg(unix)]
pub fn disk_usage_percent(path: &Path) -> Result<u8, DiskError> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| DiskError::StatvfsFailed(e.to_string()))?;
    let total = stat.blocks() as u64;
    let available = stat.blocks_available() as u64;
    if total == 0 {
        return Err(DiskError::InvalidFilesystem);
    }

    let used = total.saturating_sub(available);
    Ok(((used as f64 / total as f64) * 100.0) as u8)
}

#[cfg(not(unix))]
pub fn disk_usage_percent(_path: &Path) -> Result<u8, DiskError> {
    Err(DiskError::Unsupported)
}

/// Bytes available to unprivileged users on the filesystem containing `path`.
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Result<u64, DiskError> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| DiskError::StatvfsFailed(e.to_string()))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> Result<u64, DiskError> {
    Err(DiskError::Unsupported)
}

/// Current usage if it has reached `reserve_percent`, `None` if there is room.
///
/// An unreadable filesystem counts as room; recording is not blocked on a
/// failed check.
pub fn over_reserve(path: &Path, reserve_percent: u8) -> Option<u8> {
    match disk_usage_percent(path) {
        Ok(usage) if usage >= reserve_percent => Some(usage),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Could not check disk space of {}: {}", path.display(), e);
            None
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}
