//! Atomic File Replacer
//!
//! Per-file replacement on a live partition. New content is staged in a
//! hidden sibling file inside the scratch view, made durable, and then
//! renamed over the target. The scratch view shares its dentries with the
//! live mount, so readers of the real path see the old file until the rename
//! and the complete new file afterwards. A file that did not exist appears
//! only once it is whole.
//!
//! Directories are resolved one component at a time beneath the scratch
//! root and never through a symbolic link, so a record cannot reach outside
//! the partition.
//!
//! SELinux labels are not touched; callers run `restorecon` after the update.

use super::format::UpdateRecord;
use super::mounts::{MountOps, MountPlan};
use super::patch::PatchApplier;
use crate::engine::error::{FormatError, Result, UpdateError};
use rustix::fs::{fsync, mkdirat, openat, renameat, unlinkat, AtFlags, Mode, OFlags, CWD};
use rustix::io::Errno;
use std::ffi::{OsStr, OsString};
use std::fs::{File, Metadata, Permissions};
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::fs::{fchown, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Mode for files that did not exist before the update
pub const NEW_FILE_MODE: u32 = 0o644;

/// Mode for parent directories created on the way to a new file
pub const NEW_DIR_MODE: u32 = 0o755;

const STAGING_SUFFIX: &str = ".evox-new";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// The file did not exist before
    pub created: bool,
}

/// Name of the staging file next to `name`
pub fn staging_name(name: &OsStr) -> OsString {
    let mut staged = OsString::from(".");
    staged.push(name);
    staged.push(STAGING_SUFFIX);
    staged
}

pub struct FileReplacer<A: PatchApplier> {
    scratch_root: PathBuf,
    applier: A,
}

impl<A: PatchApplier> FileReplacer<A> {
    pub fn new(scratch_root: impl Into<PathBuf>, applier: A) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            applier,
        }
    }

    /// Replacer writing through the scratch view of an established plan
    pub fn for_plan<M: MountOps>(plan: &MountPlan<'_, M>, applier: A) -> Self {
        Self::new(plan.layout().scratch_system_dir.clone(), applier)
    }

    /// Apply one record
    pub fn replace(&self, record: &UpdateRecord) -> Result<ReplaceOutcome> {
        let (dir, name) = self.open_parent(&record.path)?;
        let previous = open_previous(&dir, &name, &record.path)?;
        let created = previous.is_none();

        let staged = staging_name(&name);
        // Left behind by an interrupted run
        match unlinkat(&dir, &staged, AtFlags::empty()) {
            Ok(()) => debug!(path = %record.path.display(), "removed stale staging file"),
            Err(e) if e == Errno::NOENT => {}
            Err(e) => return Err(io::Error::from(e).into()),
        }

        let bytes_written = match self.stage(record, &dir, &staged, previous) {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = unlinkat(&dir, &staged, AtFlags::empty()) {
                    warn!(path = %record.path.display(), error = %rm, "could not remove staging file");
                }
                return Err(e);
            }
        };

        if let Err(e) = renameat(&dir, &staged, &dir, &name) {
            let _ = unlinkat(&dir, &staged, AtFlags::empty());
            return Err(io::Error::from(e).into());
        }
        fsync(&dir).map_err(io::Error::from)?;

        debug!(path = %record.path.display(), bytes_written, created, "file replaced");
        Ok(ReplaceOutcome {
            path: record.path.clone(),
            bytes_written,
            created,
        })
    }

    /// Write the new content to `staged` and make it durable
    fn stage(
        &self,
        record: &UpdateRecord,
        dir: &OwnedFd,
        staged: &OsStr,
        previous: Option<(File, Metadata)>,
    ) -> Result<u64> {
        let (mut old, meta) = match previous {
            Some((file, meta)) => (Some(file), Some(meta)),
            None => (None, None),
        };
        let mode = meta.as_ref().map_or(NEW_FILE_MODE, |m| m.mode() & 0o7777);

        let fd = openat(
            dir,
            staged,
            OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode),
        )
        .map_err(io::Error::from)?;
        let mut file = File::from(fd);

        let written = self
            .applier
            .apply(record, old.as_mut().map(|f| f as &mut dyn Read), &mut file)?;

        if let Some(meta) = &meta {
            copy_ownership_and_mode(&file, meta)?;
        }
        file.sync_all()?;
        Ok(written)
    }

    /// Directory holding the record's target, created if missing
    fn open_parent(&self, relative: &Path) -> Result<(OwnedFd, OsString)> {
        let mut names: Vec<&OsStr> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .collect();
        let name = names.pop().ok_or(FormatError::EmptyPath)?;

        let mut dir = openat(
            CWD,
            self.scratch_root.as_path(),
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(io::Error::from)?;
        for component in names {
            dir = match open_subdir(&dir, component) {
                Ok(next) => next,
                Err(e) if e == Errno::NOENT => {
                    match mkdirat(&dir, component, Mode::from_raw_mode(NEW_DIR_MODE)) {
                        Ok(()) => {}
                        Err(e) if e == Errno::EXIST => {}
                        Err(e) => return Err(io::Error::from(e).into()),
                    }
                    open_subdir(&dir, component).map_err(|e| unsafe_component(relative, e))?
                }
                Err(e) => return Err(unsafe_component(relative, e)),
            };
        }
        Ok((dir, name.to_os_string()))
    }
}

fn open_subdir(dir: &OwnedFd, name: &OsStr) -> rustix::io::Result<OwnedFd> {
    openat(
        dir,
        name,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
}

/// A symlink or a non-directory where a directory was expected
fn unsafe_component(relative: &Path, e: Errno) -> UpdateError {
    if e == Errno::LOOP || e == Errno::NOTDIR {
        FormatError::UnsafePath {
            path: relative.display().to_string(),
        }
        .into()
    } else {
        io::Error::from(e).into()
    }
}

/// The current target, if any; it must be a regular file
fn open_previous(dir: &OwnedFd, name: &OsStr, relative: &Path) -> Result<Option<(File, Metadata)>> {
    let fd = match openat(
        dir,
        name,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::NONBLOCK | OFlags::CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(e) if e == Errno::NOENT => return Ok(None),
        Err(e) if e == Errno::LOOP => {
            return Err(FormatError::UnsafePath {
                path: relative.display().to_string(),
            }
            .into())
        }
        Err(e) => return Err(io::Error::from(e).into()),
    };

    let file = File::from(fd);
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", relative.display()),
        )
        .into());
    }
    Ok(Some((file, meta)))
}

/// Owner first: chown clears set-id bits, so the mode is applied afterwards
fn copy_ownership_and_mode(file: &File, meta: &Metadata) -> io::Result<()> {
    fchown(file, Some(meta.uid()), Some(meta.gid()))?;
    file.set_permissions(Permissions::from_mode(meta.mode() & 0o7777))
}
