//! Mount Orchestrator
//!
//! Builds the bind-mount topology that isolates in-flight edits from live
//! readers, and tears it down again on every exit path.

use super::loopdev::LoopDevice;
use crate::engine::error::{MountError, Result, UpdateError};
use rustix::mount::{MountFlags, MountPropagationFlags, UnmountFlags};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The mount syscalls the updater needs
pub trait MountOps {
    /// Remount `mount_point` (backed by `device`) read-write with private propagation
    fn remount_writable_private(&self, device: &Path, mount_point: &Path) -> std::result::Result<(), MountError>;

    fn remount_read_only(&self, mount_point: &Path) -> std::result::Result<(), MountError>;

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> std::result::Result<(), MountError>;

    /// Mount a filesystem image read-only through a loop device
    fn mount_image_read_only(&self, image: &File, target: &Path, fs_type: &str) -> std::result::Result<(), MountError>;

    fn unmount(&self, target: &Path) -> std::result::Result<(), MountError>;
}

impl<M: MountOps + ?Sized> MountOps for &M {
    fn remount_writable_private(&self, device: &Path, mount_point: &Path) -> std::result::Result<(), MountError> {
        (**self).remount_writable_private(device, mount_point)
    }

    fn remount_read_only(&self, mount_point: &Path) -> std::result::Result<(), MountError> {
        (**self).remount_read_only(mount_point)
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> std::result::Result<(), MountError> {
        (**self).bind(source, target, recursive)
    }

    fn mount_image_read_only(&self, image: &File, target: &Path, fs_type: &str) -> std::result::Result<(), MountError> {
        (**self).mount_image_read_only(image, target, fs_type)
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        (**self).unmount(target)
    }
}

/// Real implementation over mount(2)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallMounts;

impl MountOps for SyscallMounts {
    fn remount_writable_private(&self, device: &Path, mount_point: &Path) -> std::result::Result<(), MountError> {
        debug!(device = %device.display(), mount_point = %mount_point.display(), "remounting read-write");
        rustix::mount::mount_remount(mount_point, MountFlags::empty(), "")
            .map_err(|e| MountError::new("remount read-write", mount_point, e.into()))?;
        rustix::mount::mount_change(mount_point, MountPropagationFlags::PRIVATE)
            .map_err(|e| MountError::new("make private", mount_point, e.into()))
    }

    fn remount_read_only(&self, mount_point: &Path) -> std::result::Result<(), MountError> {
        rustix::mount::mount_remount(mount_point, MountFlags::RDONLY, "")
            .map_err(|e| MountError::new("remount read-only", mount_point, e.into()))
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> std::result::Result<(), MountError> {
        let result = if recursive {
            rustix::mount::mount_recursive_bind(source, target)
        } else {
            rustix::mount::mount_bind(source, target)
        };
        result.map_err(|e| MountError::new("bind", target, e.into()))
    }

    fn mount_image_read_only(&self, image: &File, target: &Path, fs_type: &str) -> std::result::Result<(), MountError> {
        let device = LoopDevice::attach_read_only(image)
            .map_err(|e| MountError::new("attach loop device", target, e))?;

        if let Err(e) = rustix::mount::mount(device.path(), target, fs_type, MountFlags::RDONLY, "") {
            let err = MountError::new("mount backup image", target, e.into());
            if let Err(detach) = device.detach() {
                warn!(error = %detach, "could not detach loop device");
            }
            return Err(err);
        }
        // Autoclear ties the loop device's lifetime to the mount from here on
        drop(device);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), MountError> {
        rustix::mount::unmount(target, UnmountFlags::empty())
            .map_err(|e| MountError::new("unmount", target, e.into()))
    }
}

/// Paths the orchestrator works with
#[derive(Debug, Clone)]
pub struct MountLayout {
    pub system_device: PathBuf,
    pub system_mount_point: PathBuf,
    pub scratch_system_dir: PathBuf,
    pub scratch_backup_dir: PathBuf,
    pub backup_fs_type: String,
}

/// The established mount topology for one run.
///
/// Everything mounted through the plan is unmounted in reverse order when the
/// plan is torn down or dropped, unless it was kept for inspection.
pub struct MountPlan<'a, M: MountOps> {
    ops: &'a M,
    layout: MountLayout,
    established: Vec<PathBuf>,
    remounted: bool,
    restore_read_only: bool,
    released: bool,
}

impl<'a, M: MountOps> MountPlan<'a, M> {
    /// Remount the system writable and private, bind it onto the scratch
    /// system dir, and mount the backup image read-only on the scratch backup dir.
    pub fn prepare(ops: &'a M, layout: MountLayout, backup_image: &File, restore_read_only: bool) -> Result<Self> {
        fs::create_dir_all(&layout.scratch_system_dir)?;
        fs::create_dir_all(&layout.scratch_backup_dir)?;

        let mut plan = Self {
            ops,
            layout,
            established: Vec::new(),
            remounted: false,
            restore_read_only,
            released: false,
        };

        // Any failure below drops `plan`, which releases what was already mounted
        ops.remount_writable_private(&plan.layout.system_device, &plan.layout.system_mount_point)?;
        plan.remounted = true;

        ops.bind(&plan.layout.system_mount_point, &plan.layout.scratch_system_dir, true)?;
        plan.established.push(plan.layout.scratch_system_dir.clone());
        info!(
            system = %plan.layout.system_mount_point.display(),
            scratch = %plan.layout.scratch_system_dir.display(),
            "system bound to scratch view"
        );

        ops.mount_image_read_only(backup_image, &plan.layout.scratch_backup_dir, &plan.layout.backup_fs_type)?;
        plan.established.push(plan.layout.scratch_backup_dir.clone());
        info!(target = %plan.layout.scratch_backup_dir.display(), "backup image mounted read-only");

        Ok(plan)
    }

    pub fn layout(&self) -> &MountLayout {
        &self.layout
    }

    /// Mount points currently held, oldest first
    pub fn established(&self) -> &[PathBuf] {
        &self.established
    }

    /// Unmount everything; attempts every entry and reports the first failure
    pub fn teardown(mut self) -> std::result::Result<(), MountError> {
        self.release()
    }

    /// Leave the topology in place for forensic inspection
    pub fn keep_for_inspection(mut self) {
        warn!(mounts = ?self.established, "leaving mounts in place for inspection");
        self.released = true;
    }

    fn release(&mut self) -> std::result::Result<(), MountError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_error = None;
        while let Some(target) = self.established.pop() {
            match self.ops.unmount(&target) {
                Ok(()) => debug!(target = %target.display(), "unmounted"),
                Err(e) => {
                    warn!(error = %e, "unmount failed during teardown");
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.remounted && self.restore_read_only {
            if let Err(e) = self.ops.remount_read_only(&self.layout.system_mount_point) {
                warn!(error = %e, "could not restore read-only system mount");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<M: MountOps> Drop for MountPlan<'_, M> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Find where `device` is mounted by scanning a `/proc/mounts` style table
pub fn find_mount_point(device: &Path, mounts_table: &Path) -> Result<PathBuf> {
    let table = fs::read_to_string(mounts_table)?;
    parse_mount_table(&table, device).ok_or_else(|| {
        UpdateError::Config(format!("system not mounted (searched for {})", device.display()))
    })
}

/// First mount directory whose source is `device`
pub fn parse_mount_table(table: &str, device: &Path) -> Option<PathBuf> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = unescape_mount_field(fields.next()?);
        let target = unescape_mount_field(fields.next()?);
        (Path::new(&source) == device).then(|| PathBuf::from(target))
    })
}

/// The kernel writes space, tab, newline and backslash as octal escapes
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = (bytes[i + 1] - b'0') as u32 * 64 + (bytes[i + 2] - b'0') as u32 * 8 + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
