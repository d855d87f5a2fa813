//! Update File Format
//!
//! Binary layout (all integers little-endian):
//!
//! | Offset | Field         | Size                          |
//! |--------|---------------|-------------------------------|
//! | 0      | magic         | 8 bytes, `EVOXUPD\0`          |
//! | 8      | target digest | 20 bytes, all-zero = unchecked|
//! | 28..   | records       | repeated until EOF            |
//!
//! Each record is `bytes_added` (u64) · `bytes_removed` (u64) · path (NUL
//! terminated) · `patch_size` (u32) · patch data · record digest (20 bytes).
//! The record digest is SHA-1 over the two counters as written, the path bytes
//! without the terminator, and the patch data.

use super::digest::{self, Digest, DigestEngine, DIGEST_LEN};
use crate::engine::error::{FormatError, UpdateError};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Literal tag plus trailing NUL
pub const MAGIC: [u8; 8] = *b"EVOXUPD\0";

/// Paths this long or longer are rejected
pub const PATH_MAX: usize = 4096;

/// Size of the fixed header
pub const HEADER_LEN: usize = MAGIC.len() + DIGEST_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeader {
    pub magic: [u8; 8],
    /// Partition digest the update was built against
    pub target_digest: Digest,
}

impl UpdateHeader {
    pub fn new(target_digest: Digest) -> Self {
        Self {
            magic: MAGIC,
            target_digest,
        }
    }

    /// Header whose target digest is unknown
    pub fn unchecked() -> Self {
        Self::new([0u8; DIGEST_LEN])
    }

    pub fn is_unchecked(&self) -> bool {
        digest::is_zero(&self.target_digest)
    }
}

/// A single file edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub bytes_added: u64,
    pub bytes_removed: u64,
    /// Relative to the partition root
    pub path: PathBuf,
    pub patch_data: Vec<u8>,
    pub record_digest: Digest,
}

impl UpdateRecord {
    /// Build a record, computing its digest
    pub fn new(bytes_added: u64, bytes_removed: u64, path: impl Into<PathBuf>, patch_data: Vec<u8>) -> Self {
        let mut record = Self {
            bytes_added,
            bytes_removed,
            path: path.into(),
            patch_data,
            record_digest: [0u8; DIGEST_LEN],
        };
        record.record_digest = record.compute_digest();
        record
    }

    pub fn patch_size(&self) -> u32 {
        self.patch_data.len() as u32
    }

    /// Digest over the fields the record digest covers
    pub fn compute_digest(&self) -> Digest {
        let mut engine = DigestEngine::new();
        engine.update(&self.bytes_added.to_le_bytes());
        engine.update(&self.bytes_removed.to_le_bytes());
        engine.update(self.path.as_os_str().as_bytes());
        engine.update(&self.patch_data);
        engine.digest()
    }

    /// Detect corruption before the record is applied
    pub fn verify(&self) -> Result<(), UpdateError> {
        let actual = self.compute_digest();
        if actual != self.record_digest {
            return Err(UpdateError::DigestMismatch {
                what: format!("record {}", self.path.display()),
                expected: digest::to_hex(&self.record_digest),
                actual: digest::to_hex(&actual),
            });
        }
        Ok(())
    }
}

/// Check a raw path from the stream and turn it into a relative path
pub fn validate_path(raw: &[u8]) -> Result<PathBuf, FormatError> {
    if raw.is_empty() {
        return Err(FormatError::EmptyPath);
    }
    if raw.len() >= PATH_MAX {
        return Err(FormatError::PathTooLong {
            len: raw.len(),
            limit: PATH_MAX,
        });
    }

    let path = Path::new(OsStr::from_bytes(raw));
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe || !path.components().any(|c| matches!(c, Component::Normal(_))) {
        return Err(FormatError::UnsafePath {
            path: path.display().to_string(),
        });
    }
    Ok(path.to_path_buf())
}

/// Sequential parser over an update stream. Each byte is consumed once.
pub struct UpdateReader<R> {
    inner: R,
}

impl UpdateReader<BufReader<File>> {
    /// Open an update file from the start
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> UpdateReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read and validate the fixed header
    pub fn read_header(&mut self) -> Result<UpdateHeader, FormatError> {
        let mut magic = [0u8; 8];
        self.read_field(&mut magic, "magic")?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic {
                found: magic.to_vec(),
            });
        }

        let mut target_digest = [0u8; DIGEST_LEN];
        self.read_field(&mut target_digest, "target digest")?;

        Ok(UpdateHeader {
            magic,
            target_digest,
        })
    }

    /// Next record, or `None` at a clean end of stream
    pub fn read_record(&mut self) -> Result<Option<UpdateRecord>, FormatError> {
        let mut word = [0u8; 8];
        match self.fill(&mut word)? {
            0 => return Ok(None),
            8 => {}
            _ => return Err(FormatError::Truncated { field: "bytes added" }),
        }
        let bytes_added = u64::from_le_bytes(word);

        self.read_field(&mut word, "bytes removed")?;
        let bytes_removed = u64::from_le_bytes(word);

        let path = self.read_path()?;

        let mut size = [0u8; 4];
        self.read_field(&mut size, "patch size")?;
        let patch_size = u32::from_le_bytes(size) as u64;

        // Sized by the bytes actually present, not by the declared length
        let mut patch_data = Vec::new();
        (&mut self.inner).take(patch_size).read_to_end(&mut patch_data)?;
        if patch_data.len() as u64 != patch_size {
            return Err(FormatError::Truncated { field: "patch data" });
        }

        let mut record_digest = [0u8; DIGEST_LEN];
        self.read_field(&mut record_digest, "record digest")?;

        Ok(Some(UpdateRecord {
            bytes_added,
            bytes_removed,
            path,
            patch_data,
            record_digest,
        }))
    }

    /// Iterate the remaining records; stops after the first error
    pub fn records(self) -> Records<R> {
        Records {
            reader: self,
            done: false,
        }
    }

    fn read_path(&mut self) -> Result<PathBuf, FormatError> {
        let mut raw = Vec::new();
        (&mut self.inner).take(PATH_MAX as u64).read_until(0, &mut raw)?;
        match raw.last() {
            Some(0) => {
                raw.pop();
                validate_path(&raw)
            }
            _ if raw.len() >= PATH_MAX => Err(FormatError::PathTooLong {
                len: raw.len(),
                limit: PATH_MAX,
            }),
            _ => Err(FormatError::Truncated { field: "path" }),
        }
    }

    fn read_field(&mut self, buf: &mut [u8], field: &'static str) -> Result<(), FormatError> {
        if self.fill(buf)? != buf.len() {
            return Err(FormatError::Truncated { field });
        }
        Ok(())
    }

    /// Read until `buf` is full or EOF; returns the byte count
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, FormatError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

/// Lazy, forward-only record sequence
pub struct Records<R> {
    reader: UpdateReader<R>,
    done: bool,
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<UpdateRecord, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Serialises update files
pub struct UpdateWriter<W: Write> {
    inner: W,
}

impl<W: Write> UpdateWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_header(&mut self, header: &UpdateHeader) -> io::Result<()> {
        self.inner.write_all(&header.magic)?;
        self.inner.write_all(&header.target_digest)
    }

    pub fn write_record(&mut self, record: &UpdateRecord) -> io::Result<()> {
        let path = record.path.as_os_str().as_bytes();
        if path.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record path contains a NUL byte",
            ));
        }
        let patch_size = u32::try_from(record.patch_data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "patch data exceeds 4 GiB")
        })?;

        self.inner.write_all(&record.bytes_added.to_le_bytes())?;
        self.inner.write_all(&record.bytes_removed.to_le_bytes())?;
        self.inner.write_all(path)?;
        self.inner.write_all(&[0])?;
        self.inner.write_all(&patch_size.to_le_bytes())?;
        self.inner.write_all(&record.patch_data)?;
        self.inner.write_all(&record.record_digest)
    }

    /// Flush and hand back the sink
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Author an update file of full-replacement records.
///
/// New content for each of `paths` is read from `new_root`; the removed byte
/// count is the size of the same path under `old_root`, or zero. Returns the
/// records written, without their patch data.
pub fn build_update_file(
    output: &Path,
    header: &UpdateHeader,
    new_root: &Path,
    old_root: Option<&Path>,
    paths: &[PathBuf],
) -> Result<Vec<UpdateRecord>, UpdateError> {
    let mut writer = UpdateWriter::new(io::BufWriter::new(File::create(output)?));
    writer.write_header(header)?;

    let mut written = Vec::with_capacity(paths.len());
    for path in paths {
        let relative = validate_path(path.as_os_str().as_bytes())?;
        let content = std::fs::read(new_root.join(&relative))?;
        let removed = match old_root {
            Some(root) => match std::fs::metadata(root.join(&relative)) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            },
            None => 0,
        };

        let mut record = UpdateRecord::new(content.len() as u64, removed, relative, content);
        writer.write_record(&record)?;
        record.patch_data = Vec::new();
        written.push(record);
    }

    let file = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}
