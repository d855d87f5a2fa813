//! Update Driver
//!
//! Sequences one run: verify the partition against the update header, plan
//! storage, establish mounts, then apply records one at a time until the
//! stream ends. Every error is fatal to the run; mounts established before
//! the failure are released before the error is returned.

use super::backup::{verify_preimage, BackupImage, Verification};
use super::digest;
use super::format::{UpdateReader, UpdateRecord};
use super::mounts::{find_mount_point, MountLayout, MountOps, MountPlan, SyscallMounts};
use super::patch::{FullReplacement, PatchApplier};
use super::replace::FileReplacer;
use super::state::{Phase, RunJournal, JOURNAL_FILE};
use super::storage::{GrowthBudget, SpaceProbe, StatvfsProbe, StorageDecision, StoragePlanner};
use crate::engine::config::UpdaterConfig;
use crate::engine::error::{DriverError, Result, UpdateError};
use crate::engine::locks::RunLock;
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Caller-supplied paths for one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub system_image: PathBuf,
    pub update_file: PathBuf,
    pub backup_file: PathBuf,
    pub scratch_dir: PathBuf,
}

/// Record totals for a whole update file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateTotals {
    pub records: u64,
    pub bytes_added: u64,
    pub bytes_removed: u64,
}

impl UpdateTotals {
    /// Count one record; byte totals saturate instead of wrapping
    pub fn add(&mut self, record: &UpdateRecord) {
        self.records += 1;
        self.bytes_added = self.bytes_added.saturating_add(record.bytes_added);
        self.bytes_removed = self.bytes_removed.saturating_add(record.bytes_removed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub verification: Verification,
    pub partition_digest: String,
    pub storage: StorageDecision,
    pub totals: UpdateTotals,
    pub records_applied: u64,
    pub files_created: u64,
    pub bytes_written: u64,
}

/// Read every record once, checking its digest, and sum the byte counts
pub fn scan_update(update_file: &Path) -> Result<UpdateTotals> {
    let mut reader = UpdateReader::open(update_file)?;
    reader.read_header()?;

    let mut totals = UpdateTotals::default();
    while let Some(record) = reader.read_record()? {
        record.verify()?;
        totals.add(&record);
    }
    Ok(totals)
}

/// Journal saved to the scratch directory on every change
struct Journal {
    state: RunJournal,
    path: PathBuf,
}

impl Journal {
    fn create(request: &RunRequest) -> Result<Self> {
        let journal = Self {
            state: RunJournal::new(&request.system_image, &request.update_file),
            path: request.scratch_dir.join(JOURNAL_FILE),
        };
        journal.save()?;
        Ok(journal)
    }

    fn save(&self) -> Result<()> {
        self.state.save(&self.path)?;
        Ok(())
    }

    fn advance(&mut self, next: Phase) -> Result<()> {
        self.state.advance(next)?;
        info!(phase = %next, "entering phase");
        self.save()
    }
}

#[derive(Debug, Default)]
struct ApplyStats {
    applied: u64,
    created: u64,
    bytes_written: u64,
}

pub struct UpdateDriver<M, P, A> {
    config: UpdaterConfig,
    mounts: M,
    probe: P,
    applier: A,
}

impl UpdateDriver<SyscallMounts, StatvfsProbe, FullReplacement> {
    /// Driver using real mounts and statvfs
    pub fn system(config: UpdaterConfig) -> Self {
        Self::new(config, SyscallMounts, StatvfsProbe, FullReplacement)
    }
}

impl<M: MountOps, P: SpaceProbe, A: PatchApplier> UpdateDriver<M, P, A> {
    pub fn new(config: UpdaterConfig, mounts: M, probe: P, applier: A) -> Self {
        Self {
            config,
            mounts,
            probe,
            applier,
        }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Run the update to completion, or fail reporting the phase
    pub fn run(&self, request: &RunRequest) -> std::result::Result<RunSummary, DriverError> {
        let at_init = |source: UpdateError| DriverError {
            phase: Phase::Init,
            source,
        };

        let _lock = RunLock::acquire(&request.scratch_dir, &request.system_image).map_err(|e| at_init(e.into()))?;
        let mut journal = Journal::create(request).map_err(at_init)?;

        match self.execute(request, &mut journal) {
            Ok(summary) => {
                info!(records = summary.records_applied, "update complete");
                Ok(summary)
            }
            Err(source) => {
                let phase = journal.state.phase();
                error!(phase = %phase, kind = source.kind(), error = %source, "update failed");
                journal.state.mark_failed(source.kind(), source.to_string());
                if let Err(e) = journal.save() {
                    warn!(error = %e, "could not record failure in journal");
                }
                Err(DriverError { phase, source })
            }
        }
    }

    fn execute(&self, request: &RunRequest, journal: &mut Journal) -> Result<RunSummary> {
        // Nothing is written outside the scratch directory until the header parses
        let mut stream = UpdateReader::open(&request.update_file)?;
        let header = stream.read_header()?;

        journal.advance(Phase::Verifying)?;
        let backup = BackupImage::create(&request.system_image, &request.backup_file, self.config.chunk_size)?;
        let verification = verify_preimage(&header.target_digest, backup.digest())?;
        let partition_digest = digest::to_hex(backup.digest());
        journal.state.partition_digest = Some(partition_digest.clone());
        journal.state.verification = Some(verification);

        journal.advance(Phase::Planning)?;
        let totals = scan_update(&request.update_file)?;
        let mount_point = match &self.config.mount_point {
            Some(path) => path.clone(),
            None => find_mount_point(&request.system_image, &self.config.mounts_table)?,
        };
        let storage = StoragePlanner::new(&self.probe).plan(totals.bytes_added, totals.bytes_removed, &mount_point)?;
        journal.state.storage = Some(storage);

        journal.advance(Phase::Mounting)?;
        let (_, image) = backup.into_read_only()?;
        let layout = MountLayout {
            system_device: request.system_image.clone(),
            system_mount_point: mount_point.clone(),
            scratch_system_dir: request.scratch_dir.join(&self.config.scratch_system_name),
            scratch_backup_dir: request.scratch_dir.join(&self.config.scratch_backup_name),
            backup_fs_type: self.config.backup_fs_type.clone(),
        };
        let plan = MountPlan::prepare(&self.mounts, layout, &image, self.config.restore_read_only)?;

        let applied = journal
            .advance(Phase::Applying)
            .and_then(|_| self.apply_records(&plan, &mut stream, storage, &mount_point, journal));

        let stats = match applied {
            Ok(stats) => stats,
            Err(e) => {
                if self.config.keep_mounts_on_failure {
                    plan.keep_for_inspection();
                } else if let Err(teardown) = plan.teardown() {
                    warn!(error = %teardown, "cleanup after failure was incomplete");
                }
                return Err(e);
            }
        };

        plan.teardown()?;
        journal.advance(Phase::Done)?;

        Ok(RunSummary {
            verification,
            partition_digest,
            storage,
            totals,
            records_applied: stats.applied,
            files_created: stats.created,
            bytes_written: stats.bytes_written,
        })
    }

    fn apply_records<R: BufRead>(
        &self,
        plan: &MountPlan<'_, M>,
        stream: &mut UpdateReader<R>,
        storage: StorageDecision,
        mount_point: &Path,
        journal: &mut Journal,
    ) -> Result<ApplyStats> {
        let replacer = FileReplacer::for_plan(plan, &self.applier);
        let mut budget = storage
            .requires_shadow_fallback
            .then(|| GrowthBudget::new(self.config.shadow_growth_budget));
        let mut stats = ApplyStats::default();

        // Clean end of stream is the only way out that is not an error
        while let Some(record) = stream.read_record()? {
            record.verify()?;
            if let Some(budget) = budget.as_mut() {
                budget.admit(&record, &self.probe, mount_point)?;
            }

            let outcome = replacer.replace(&record)?;
            info!(path = %outcome.path.display(), bytes = outcome.bytes_written, created = outcome.created, "record applied");

            stats.applied += 1;
            stats.bytes_written += outcome.bytes_written;
            if outcome.created {
                stats.created += 1;
            }
            journal.state.record_applied(&record.path);
            journal.save()?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::MountError;
    use crate::engine::updater::format::{UpdateHeader, UpdateWriter};
    use crate::engine::updater::storage::FixedProbe;
    use std::cell::RefCell;
    use std::fs::{self, File};
    use tempfile::tempdir;

    /// Records calls; the scratch view is not populated
    #[derive(Default)]
    struct NoopMounts {
        calls: RefCell<Vec<String>>,
    }

    impl MountOps for NoopMounts {
        fn remount_writable_private(&self, _d: &Path, _m: &Path) -> std::result::Result<(), MountError> {
            self.calls.borrow_mut().push("remount_rw".into());
            Ok(())
        }
        fn remount_read_only(&self, _m: &Path) -> std::result::Result<(), MountError> {
            self.calls.borrow_mut().push("remount_ro".into());
            Ok(())
        }
        fn bind(&self, _s: &Path, _t: &Path, _r: bool) -> std::result::Result<(), MountError> {
            self.calls.borrow_mut().push("bind".into());
            Ok(())
        }
        fn mount_image_read_only(&self, _i: &File, _t: &Path, _f: &str) -> std::result::Result<(), MountError> {
            self.calls.borrow_mut().push("mount_image".into());
            Ok(())
        }
        fn unmount(&self, _t: &Path) -> std::result::Result<(), MountError> {
            self.calls.borrow_mut().push("unmount".into());
            Ok(())
        }
    }

    fn write_update(path: &Path, header: UpdateHeader, records: &[UpdateRecord]) {
        let mut writer = UpdateWriter::new(File::create(path).unwrap());
        writer.write_header(&header).unwrap();
        for record in records {
            writer.write_record(record).unwrap();
        }
        writer.finish().unwrap();
    }

    fn request(root: &Path) -> RunRequest {
        RunRequest {
            system_image: root.join("system.img"),
            update_file: root.join("update.bin"),
            backup_file: root.join("backup.img"),
            scratch_dir: root.join("scratch"),
        }
    }

    #[test]
    fn test_scan_update_totals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.bin");
        write_update(
            &path,
            UpdateHeader::unchecked(),
            &[
                UpdateRecord::new(10, 4, "a", b"0123456789".to_vec()),
                UpdateRecord::new(5, 0, "b/c", b"hello".to_vec()),
            ],
        );

        let totals = scan_update(&path).unwrap();
        assert_eq!(
            totals,
            UpdateTotals {
                records: 2,
                bytes_added: 15,
                bytes_removed: 4
            }
        );
    }

    #[test]
    fn test_totals_saturate() {
        let mut totals = UpdateTotals::default();
        let huge = UpdateRecord::new(u64::MAX, u64::MAX - 1, "a", Vec::new());
        totals.add(&huge);
        totals.add(&huge);
        assert_eq!(totals.records, 2);
        assert_eq!(totals.bytes_added, u64::MAX);
        assert_eq!(totals.bytes_removed, u64::MAX);
    }

    #[test]
    fn test_bad_header_fails_in_init_without_backup() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![7u8; 4096]).unwrap();
        fs::write(&req.update_file, b"NOTANUPDATEFILE-----------------").unwrap();

        let mounts = NoopMounts::default();
        let driver = UpdateDriver::new(UpdaterConfig::default(), &mounts, FixedProbe(1 << 30), FullReplacement);
        let err = driver.run(&req).unwrap_err();

        assert_eq!(err.phase, Phase::Init);
        assert_eq!(err.kind(), "format");
        assert!(!req.backup_file.exists());
        assert!(mounts.calls.borrow().is_empty());
        assert!(!RunLock::lock_path(&req.scratch_dir).exists());
    }

    #[test]
    fn test_digest_mismatch_stops_before_mounting() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![1u8; 8192]).unwrap();
        write_update(
            &req.update_file,
            UpdateHeader::new([0xAB; 20]),
            &[UpdateRecord::new(1, 0, "x", b"x".to_vec())],
        );

        let mounts = NoopMounts::default();
        let driver = UpdateDriver::new(UpdaterConfig::default(), &mounts, FixedProbe(1 << 30), FullReplacement);
        let err = driver.run(&req).unwrap_err();

        assert_eq!(err.phase, Phase::Verifying);
        assert_eq!(err.kind(), "digest_mismatch");
        assert!(mounts.calls.borrow().is_empty());

        let journal = RunJournal::load(&req.scratch_dir.join(JOURNAL_FILE)).unwrap();
        assert!(journal.is_terminal());
        assert_eq!(journal.phase(), Phase::Verifying);
    }

    #[test]
    fn test_insufficient_storage_fails_in_planning() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![0u8; 1024]).unwrap();
        write_update(
            &req.update_file,
            UpdateHeader::unchecked(),
            &[UpdateRecord::new(100, 0, "big", vec![0; 100])],
        );

        let config = UpdaterConfig {
            mount_point: Some(dir.path().join("live")),
            ..Default::default()
        };
        let mounts = NoopMounts::default();
        let driver = UpdateDriver::new(config, &mounts, FixedProbe(50), FullReplacement);
        let err = driver.run(&req).unwrap_err();

        assert_eq!(err.phase, Phase::Planning);
        assert!(matches!(
            err.source,
            UpdateError::InsufficientStorage { required: 100, available: 50 }
        ));
        assert!(mounts.calls.borrow().is_empty());
        // The backup survives a failed run
        assert_eq!(fs::read(&req.backup_file).unwrap().len(), 1024);
    }

    #[test]
    fn test_unknown_device_fails_in_planning() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![0u8; 1024]).unwrap();
        write_update(&req.update_file, UpdateHeader::unchecked(), &[]);
        let table = dir.path().join("mounts");
        fs::write(&table, "/dev/sda1 / ext4 rw 0 0\n").unwrap();

        let config = UpdaterConfig {
            mounts_table: table,
            ..Default::default()
        };
        let driver = UpdateDriver::new(config, NoopMounts::default(), FixedProbe(1 << 30), FullReplacement);
        let err = driver.run(&req).unwrap_err();
        assert_eq!(err.phase, Phase::Planning);
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_failure_while_applying_releases_mounts() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![0u8; 1024]).unwrap();
        // Scratch view stays empty, so a path under a regular file cannot be created
        fs::create_dir_all(req.scratch_dir.join("system")).unwrap();
        fs::write(req.scratch_dir.join("system/etc"), b"file, not dir").unwrap();
        write_update(
            &req.update_file,
            UpdateHeader::unchecked(),
            &[UpdateRecord::new(2, 0, "etc/hosts", b"ok".to_vec())],
        );

        let config = UpdaterConfig {
            mount_point: Some(dir.path().join("live")),
            ..Default::default()
        };
        let mounts = NoopMounts::default();
        let driver = UpdateDriver::new(config, &mounts, FixedProbe(1 << 30), FullReplacement);
        let err = driver.run(&req).unwrap_err();

        assert_eq!(err.phase, Phase::Applying);
        let calls = mounts.calls.borrow();
        assert_eq!(
            *calls,
            vec!["remount_rw", "bind", "mount_image", "unmount", "unmount", "remount_ro"]
        );
    }

    #[test]
    fn test_keep_mounts_on_failure() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        fs::write(&req.system_image, vec![0u8; 1024]).unwrap();
        fs::create_dir_all(req.scratch_dir.join("system")).unwrap();
        fs::write(req.scratch_dir.join("system/etc"), b"file, not dir").unwrap();
        write_update(
            &req.update_file,
            UpdateHeader::unchecked(),
            &[UpdateRecord::new(2, 0, "etc/hosts", b"ok".to_vec())],
        );

        let config = UpdaterConfig {
            mount_point: Some(dir.path().join("live")),
            keep_mounts_on_failure: true,
            ..Default::default()
        };
        let mounts = NoopMounts::default();
        let driver = UpdateDriver::new(config, &mounts, FixedProbe(1 << 30), FullReplacement);
        assert!(driver.run(&req).is_err());
        assert!(!mounts.calls.borrow().iter().any(|c| c == "unmount"));
    }
}
