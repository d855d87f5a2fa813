use evox_lib::engine::error::{MountError, UpdateError};
use evox_lib::engine::locks::RunLock;
use evox_lib::engine::updater::digest::{digest_of, DIGEST_LEN};
use evox_lib::engine::updater::format::{UpdateHeader, UpdateRecord, UpdateWriter};
use evox_lib::engine::updater::patch::FullReplacement;
use evox_lib::engine::updater::state::{Phase, RunJournal, RunStatus, JOURNAL_FILE};
use evox_lib::engine::updater::storage::FixedProbe;
use evox_lib::engine::updater::{MountOps, RunRequest, UpdateDriver, Verification};
use evox_lib::engine::UpdaterConfig;
use std::cell::RefCell;
use std::fs::{self, File, Permissions};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// Emulates the mount topology with symlinks so runs need no privileges.
///
/// A recursive bind replaces the (empty) target directory with a symlink to
/// the source; unmounting a symlinked target restores the empty directory.
/// Plain binds and image mounts are only recorded.
#[derive(Default)]
struct SymlinkMounts {
    log: RefCell<Vec<String>>,
}

impl SymlinkMounts {
    fn log(&self, entry: String) {
        self.log.borrow_mut().push(entry);
    }

    fn count(&self, prefix: &str) -> usize {
        self.log.borrow().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

impl MountOps for SymlinkMounts {
    fn remount_writable_private(&self, _device: &Path, mount_point: &Path) -> Result<(), MountError> {
        self.log(format!("remount_rw {}", mount_point.display()));
        Ok(())
    }

    fn remount_read_only(&self, mount_point: &Path) -> Result<(), MountError> {
        self.log(format!("remount_ro {}", mount_point.display()));
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> Result<(), MountError> {
        if recursive {
            fs::remove_dir(target).map_err(|e| MountError::new("bind", target, e))?;
            symlink(source, target).map_err(|e| MountError::new("bind", target, e))?;
            self.log(format!("rbind {}", target.display()));
        } else {
            self.log(format!("bind {}", target.display()));
        }
        Ok(())
    }

    fn mount_image_read_only(&self, _image: &File, target: &Path, _fs_type: &str) -> Result<(), MountError> {
        self.log(format!("image {}", target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let is_link = fs::symlink_metadata(target)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            fs::remove_file(target).map_err(|e| MountError::new("unmount", target, e))?;
            fs::create_dir(target).map_err(|e| MountError::new("unmount", target, e))?;
        }
        self.log(format!("unmount {}", target.display()));
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    live: PathBuf,
    request: RunRequest,
}

impl Fixture {
    fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let live = dir.path().join("live");
        fs::create_dir_all(live.join("etc"))?;
        fs::create_dir_all(live.join("bin"))?;
        fs::write(live.join("etc/hosts"), b"127.0.0.1 localhost\n")?;
        fs::write(live.join("bin/tool"), b"#!/bin/sh\necho old\n")?;
        fs::set_permissions(live.join("bin/tool"), Permissions::from_mode(0o755))?;

        let request = RunRequest {
            system_image: dir.path().join("system.img"),
            update_file: dir.path().join("update.bin"),
            backup_file: dir.path().join("backup.img"),
            scratch_dir: dir.path().join("scratch"),
        };
        fs::write(&request.system_image, partition_bytes())?;

        Ok(Self {
            _dir: dir,
            live,
            request,
        })
    }

    fn config(&self) -> UpdaterConfig {
        UpdaterConfig {
            mount_point: Some(self.live.clone()),
            chunk_size: 4096,
            ..Default::default()
        }
    }

    fn write_update(&self, header: UpdateHeader, records: &[UpdateRecord]) -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = UpdateWriter::new(File::create(&self.request.update_file)?);
        writer.write_header(&header)?;
        for record in records {
            writer.write_record(record)?;
        }
        writer.finish()?;
        Ok(())
    }
}

fn partition_bytes() -> Vec<u8> {
    (0..65_536u32).map(|i| (i % 251) as u8).collect()
}

fn standard_records() -> Vec<UpdateRecord> {
    vec![
        UpdateRecord::new(25, 20, "etc/hosts", b"127.0.0.1 localhost evox\n".to_vec()),
        UpdateRecord::new(19, 19, "bin/tool", b"#!/bin/sh\necho new\n".to_vec()),
        UpdateRecord::new(12, 0, "etc/evox/channel", b"stable-2026\n".to_vec()),
    ]
}

#[test]
fn test_full_run_applies_every_record() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::new(digest_of(&partition_bytes())), &standard_records())?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let summary = driver.run(&fx.request)?;

    // 1. Summary reflects the run
    assert_eq!(summary.verification, Verification::Matched);
    assert_eq!(summary.records_applied, 3);
    assert_eq!(summary.files_created, 1);
    assert_eq!(summary.totals.bytes_added, 56);
    assert!(!summary.storage.requires_shadow_fallback);

    // 2. Live tree carries the new content with original modes
    assert_eq!(fs::read(fx.live.join("etc/hosts"))?, b"127.0.0.1 localhost evox\n");
    assert_eq!(fs::read(fx.live.join("bin/tool"))?, b"#!/bin/sh\necho new\n");
    assert_eq!(fs::metadata(fx.live.join("bin/tool"))?.permissions().mode() & 0o777, 0o755);
    assert_eq!(fs::read(fx.live.join("etc/evox/channel"))?, b"stable-2026\n");
    let staged: Vec<_> = fs::read_dir(fx.live.join("etc"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(staged.is_empty());

    // 3. Backup is the pre-update partition
    assert_eq!(fs::read(&fx.request.backup_file)?, partition_bytes());

    // 4. No per-file mounts; scratch view torn down, read-only restored
    assert_eq!(mounts.count("bind "), 0);
    assert_eq!(mounts.count("unmount "), 2);
    assert_eq!(mounts.count("remount_ro "), 1);
    assert!(fx.request.scratch_dir.join("system").is_dir());
    assert!(!fs::symlink_metadata(fx.request.scratch_dir.join("system"))?.file_type().is_symlink());

    // 5. Journal says done, lock is gone
    let journal = RunJournal::load(&fx.request.scratch_dir.join(JOURNAL_FILE))?;
    assert_eq!(journal.status, RunStatus::Done);
    assert_eq!(journal.records_applied, 3);
    assert!(RunLock::read(&fx.request.scratch_dir).is_none());
    Ok(())
}

#[test]
fn test_zero_target_digest_skips_verification() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::new([0u8; DIGEST_LEN]), &standard_records()[..1])?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let summary = driver.run(&fx.request)?;

    assert_eq!(summary.verification, Verification::Skipped);
    assert_eq!(summary.records_applied, 1);
    Ok(())
}

#[test]
fn test_digest_mismatch_leaves_partition_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::new(digest_of(b"some other partition")), &standard_records())?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Verifying);
    assert!(matches!(err.source, UpdateError::DigestMismatch { .. }));
    assert!(mounts.log.borrow().is_empty());
    assert_eq!(fs::read(fx.live.join("etc/hosts"))?, b"127.0.0.1 localhost\n");
    assert!(!fx.live.join("etc/evox").exists());
    Ok(())
}

#[test]
fn test_corrupted_magic_has_no_side_effects() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records())?;
    let mut bytes = fs::read(&fx.request.update_file)?;
    bytes[3] ^= 0x20;
    fs::write(&fx.request.update_file, bytes)?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Init);
    assert_eq!(err.kind(), "format");
    assert!(!fx.request.backup_file.exists());
    assert!(mounts.log.borrow().is_empty());
    Ok(())
}

#[test]
fn test_corrupt_record_caught_before_mounting() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records())?;
    let mut bytes = fs::read(&fx.request.update_file)?;
    // Inside the last record's patch data, just before its digest
    let at = bytes.len() - DIGEST_LEN - 2;
    bytes[at] ^= 0x01;
    fs::write(&fx.request.update_file, bytes)?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Planning);
    assert_eq!(err.kind(), "digest_mismatch");
    assert!(mounts.log.borrow().is_empty());
    // Earlier, valid records were not applied either
    assert_eq!(fs::read(fx.live.join("etc/hosts"))?, b"127.0.0.1 localhost\n");
    Ok(())
}

#[test]
fn test_truncated_update_fails_in_planning() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records())?;
    let bytes = fs::read(&fx.request.update_file)?;
    fs::write(&fx.request.update_file, &bytes[..bytes.len() - 7])?;

    let driver = UpdateDriver::new(fx.config(), SymlinkMounts::default(), FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Planning);
    assert_eq!(err.kind(), "truncated_input");
    Ok(())
}

#[test]
fn test_shadow_fallback_when_additions_exceed_free_space() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records()[..2])?;

    // added 44, removed 39: delta 5 fits, additions alone do not
    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(40), FullReplacement);
    let summary = driver.run(&fx.request)?;

    assert!(summary.storage.requires_shadow_fallback);
    assert_eq!(summary.records_applied, 2);
    assert_eq!(fs::read(fx.live.join("bin/tool"))?, b"#!/bin/sh\necho new\n");
    Ok(())
}

#[test]
fn test_insufficient_storage_aborts_before_mounting() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records())?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(10), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Planning);
    assert_eq!(err.kind(), "insufficient_storage");
    assert!(mounts.log.borrow().is_empty());

    let journal = RunJournal::load(&fx.request.scratch_dir.join(JOURNAL_FILE))?;
    assert!(matches!(journal.status, RunStatus::Failed { phase: Phase::Planning, .. }));
    Ok(())
}

#[test]
fn test_concurrent_run_is_refused() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    fx.write_update(UpdateHeader::unchecked(), &standard_records())?;
    let _held = RunLock::acquire(&fx.request.scratch_dir, &fx.request.system_image)?;

    let driver = UpdateDriver::new(fx.config(), SymlinkMounts::default(), FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Init);
    assert_eq!(err.kind(), "lock");
    assert!(!fx.request.backup_file.exists());
    Ok(())
}

#[test]
fn test_symlinked_directory_in_partition_is_not_followed() -> Result<(), Box<dyn std::error::Error>> {
    let fx = Fixture::new()?;
    let outside = fx.live.parent().ok_or("no parent")?.join("vendor");
    fs::create_dir_all(&outside)?;
    symlink(&outside, fx.live.join("vendor"))?;
    fx.write_update(
        UpdateHeader::unchecked(),
        &[UpdateRecord::new(7, 0, "vendor/lib/evil.so", b"payload".to_vec())],
    )?;

    let mounts = SymlinkMounts::default();
    let driver = UpdateDriver::new(fx.config(), &mounts, FixedProbe(1 << 30), FullReplacement);
    let err = driver.run(&fx.request).unwrap_err();

    assert_eq!(err.phase, Phase::Applying);
    assert!(matches!(err.source, UpdateError::Format(_)));
    assert!(fs::read_dir(&outside)?.next().is_none());
    assert_eq!(mounts.count("unmount "), 2);
    Ok(())
}
