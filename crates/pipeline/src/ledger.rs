//! Append-only metadata ledger.
//!
//! Newline-delimited JSON, one record per line. Every append is flushed
//! and fsynced before it returns, so a record observed on disk survives
//! a crash. The loader is the mirror image: it tolerates a truncated or
//! corrupt line (the tail of an interrupted write) by skipping it, and
//! reduces the file to the latest record per grid coordinate.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::record::MetadataRecord;

/// Load the ledger into a latest-record-per-coordinate index.
///
/// A missing file is an empty ledger. Blank lines are skipped; lines
/// that do not parse as records are skipped with a debug log rather
/// than failing the load.
pub fn load_latest_records(
    path: &Path,
) -> Result<HashMap<(usize, usize), MetadataRecord>, PipelineError> {
    let mut latest = HashMap::new();
    if !path.exists() {
        return Ok(latest);
    }

    let contents = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
    for (line_number, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<MetadataRecord>(trimmed) {
            Ok(record) => {
                latest.insert((record.x_index, record.y_index), record);
            }
            Err(e) => {
                tracing::debug!(
                    line = line_number + 1,
                    error = %e,
                    "Skipping unparseable ledger line",
                );
            }
        }
    }
    Ok(latest)
}

/// Exclusive append handle for one run's ledger.
///
/// The dispatcher is the only writer; workers hand their records back
/// over the completion channel instead of touching the file.
pub struct LedgerWriter {
    file: std::fs::File,
    path: PathBuf,
}

impl LedgerWriter {
    /// Open (creating if needed) the ledger for appending.
    ///
    /// If the file is non-empty and does not end with a newline (the
    /// residue of an interrupted append), a newline is written first so
    /// the next record starts on its own line.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;
        }
        ensure_newline_terminated(path)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(PipelineError::io(path))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Append one record: serialize, write line + newline, flush, fsync.
    ///
    /// When this returns `Ok`, the record is durable.
    pub fn append(&mut self, record: &MetadataRecord) -> Result<(), PipelineError> {
        let line = serde_json::to_string(record)?;
        let io_err = PipelineError::io(&self.path);

        (|| {
            self.file.write_all(line.as_bytes())?;
            self.file.write_all(b"\n")?;
            self.file.flush()?;
            self.file.sync_all()
        })()
        .map_err(io_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ensure_newline_terminated(path: &Path) -> Result<(), PipelineError> {
    let io_err = || PipelineError::io(path);

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return Ok(()),
    };
    if metadata.len() == 0 {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err())?;
    file.seek(SeekFrom::End(-1)).map_err(io_err())?;
    let mut last_byte = [0u8; 1];
    file.read_exact(&mut last_byte).map_err(io_err())?;
    if last_byte[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::End(0)).map_err(io_err())?;
    file.write_all(b"\n").map_err(io_err())?;
    file.flush().map_err(io_err())?;
    file.sync_all().map_err(io_err())?;
    Ok(())
}
