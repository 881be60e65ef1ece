//! Shared SHA-256 hex digest utilities.
//!
//! Used by the prompt fingerprint, seed derivation, and the run manifest's
//! input-content hashes.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute a SHA-256 hex digest of a file's contents, streamed in 1 MiB
/// chunks so large workflow files are not held in memory.
pub fn sha256_file(path: &Path) -> Result<String, CoreError> {
    let io_err = |source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
