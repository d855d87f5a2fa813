//! Patch Application
//!
//! Turns a record's patch data into the final file bytes.

use super::format::UpdateRecord;
use std::io::{self, Read, Write};

pub trait PatchApplier {
    /// Write the post-update content for `record` into `out`, returning the
    /// number of bytes written. `old` is the pre-update content when the file
    /// already existed.
    fn apply(&self, record: &UpdateRecord, old: Option<&mut dyn Read>, out: &mut dyn Write) -> io::Result<u64>;
}

impl<T: PatchApplier + ?Sized> PatchApplier for &T {
    fn apply(&self, record: &UpdateRecord, old: Option<&mut dyn Read>, out: &mut dyn Write) -> io::Result<u64> {
        (**self).apply(record, old, out)
    }
}

/// Patch data is the complete new file content
#[derive(Debug, Clone, Copy, Default)]
pub struct FullReplacement;

impl PatchApplier for FullReplacement {
    fn apply(&self, record: &UpdateRecord, _old: Option<&mut dyn Read>, out: &mut dyn Write) -> io::Result<u64> {
        out.write_all(&record.patch_data)?;
        Ok(record.patch_data.len() as u64)
    }
}
