//! Destination filesystem queries used to classify write failures

use std::io;
use std::path::{Path, PathBuf};

/// Blocks kept free when computing usable space
const RESERVED_BLOCKS: u64 = 4;

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether the storage holding `path` is still reachable, i.e. its directory exists
pub fn storage_available(path: &Path) -> bool {
    parent_dir(path).is_dir()
}

/// Usable bytes on the filesystem holding `path`, minus a few allocation blocks
pub fn available_bytes(path: &Path) -> Option<u64> {
    let dir = parent_dir(path);
    let available = match fs2::available_space(&dir) {
        Ok(available) => available,
        Err(e) => {
            tracing::debug!(error = %e.kind(), "Failed to query free space");
            return None;
        }
    };

    let block = fs2::allocation_granularity(&dir).unwrap_or(0);
    Some(available.saturating_sub(block.saturating_mul(RESERVED_BLOCKS)))
}

/// Whether `err` reports a full device
pub fn is_out_of_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOSPC)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
