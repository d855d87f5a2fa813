//! Backup & Verification
//!
//! Streams the live partition into a backup image while hashing it, then
//! checks the result against the update header's expected pre-image digest.

use super::digest::{self, Digest, DigestEngine};
use crate::engine::error::UpdateError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Log progress every this many chunks
const PROGRESS_EVERY: u64 = 64;

/// Outcome of comparing the partition against the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// Header carried an all-zero digest
    Skipped,
    Matched,
}

/// Copy `source` into `sink` in `chunk_size` pieces, hashing as we go.
///
/// Returns the digest and the number of bytes copied.
pub fn compute_digest_and_backup<R: Read, W: Write>(
    source: &mut R,
    sink: &mut W,
    chunk_size: usize,
    total: Option<u64>,
) -> io::Result<(Digest, u64)> {
    let mut engine = DigestEngine::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;
    let mut chunks = 0u64;

    loop {
        let n = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        engine.update(&buffer[..n]);
        sink.write_all(&buffer[..n])?;
        copied += n as u64;
        chunks += 1;

        if chunks % PROGRESS_EVERY == 0 {
            match total {
                Some(total) => debug!(copied, total, "backing up partition"),
                None => debug!(copied, "backing up partition"),
            }
        }
    }

    sink.flush()?;
    Ok((engine.digest(), copied))
}

/// A byte-exact, fully flushed copy of the pre-update partition
#[derive(Debug)]
pub struct BackupImage {
    path: PathBuf,
    file: File,
    size: u64,
    digest: Digest,
}

impl BackupImage {
    /// Back up `partition` into a new file at `backup_path`.
    ///
    /// A partially written backup is removed before the error is returned.
    pub fn create(partition: &Path, backup_path: &Path, chunk_size: usize) -> io::Result<Self> {
        info!(partition = %partition.display(), backup = %backup_path.display(), "verifying partition");

        let mut source = File::open(partition)?;
        // Block devices report a zero length in metadata
        let total = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(backup_path)?;

        let result = compute_digest_and_backup(&mut source, &mut file, chunk_size, Some(total))
            .and_then(|outcome| file.sync_all().map(|_| outcome));

        match result {
            Ok((digest, size)) => {
                info!(size, digest = %digest::to_hex(&digest), "partition backed up");
                Ok(Self {
                    path: backup_path.to_path_buf(),
                    file,
                    size,
                    digest,
                })
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = fs::remove_file(backup_path) {
                    warn!(error = %rm, "could not remove partial backup");
                }
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Give up the writable handle and reopen the image read-only at offset 0.
    ///
    /// From here on the backup is never written again.
    pub fn into_read_only(self) -> io::Result<(PathBuf, File)> {
        let Self { path, mut file, .. } = self;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let mut read_only = File::open(&path)?;
        read_only.seek(SeekFrom::Start(0))?;
        Ok((path, read_only))
    }
}

/// Compare the computed partition digest with the header's expectation
pub fn verify_preimage(expected: &Digest, actual: &Digest) -> Result<Verification, UpdateError> {
    if digest::is_zero(expected) {
        warn!("update carries no target digest, skipping verification");
        return Ok(Verification::Skipped);
    }
    if expected != actual {
        return Err(UpdateError::DigestMismatch {
            what: "system partition".to_string(),
            expected: digest::to_hex(expected),
            actual: digest::to_hex(actual),
        });
    }
    Ok(Verification::Matched)
}
