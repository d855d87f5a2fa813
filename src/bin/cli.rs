//! EvoX Updater CLI - Main entry point for CLI binary
//!
//! This binary provides the `evox-updater` tool for applying and authoring updates.

use anyhow::{bail, Context};
use clap::Parser;
use evox_lib::engine::{
    cli::{formatter::CliFormatter, Cli, Commands, OutputFormat},
    config::UpdaterConfig,
    locks::RunLock,
    updater::{
        digest,
        format::{build_update_file, UpdateHeader, UpdateReader},
        state::{RunJournal, RunStatus, JOURNAL_FILE},
        RunRequest, RunSummary, UpdateDriver, UpdateTotals,
    },
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let json_output = cli.format == OutputFormat::Json;
    let config = cli.load_config().context("loading configuration")?;

    match cli.command {
        Commands::Apply {
            system_image,
            update_file,
            backup_file,
            scratch_dir,
            mount_point,
            keep_mounts,
            fs_type,
        } => {
            let mut config = config;
            if mount_point.is_some() {
                config.mount_point = mount_point;
            }
            if keep_mounts {
                config.keep_mounts_on_failure = true;
            }
            if let Some(fs_type) = fs_type {
                config.backup_fs_type = fs_type;
            }
            config.validate()?;

            let request = RunRequest {
                system_image,
                update_file,
                backup_file,
                scratch_dir,
            };
            cmd_apply(config, &request, json_output)?;
        }
        Commands::Inspect { update_file } => {
            cmd_inspect(&update_file, json_output)?;
        }
        Commands::Build {
            output,
            new_root,
            old_root,
            target_digest,
            paths,
        } => {
            cmd_build(&output, &new_root, old_root.as_deref(), target_digest.as_deref(), &paths, json_output)?;
        }
        Commands::Status { scratch_dir } => {
            cmd_status(&scratch_dir, json_output)?;
        }
    }

    Ok(())
}

fn cmd_apply(config: UpdaterConfig, request: &RunRequest, json: bool) -> anyhow::Result<()> {
    let driver = UpdateDriver::system(config);

    match driver.run(request) {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::json!({ "success": true, "summary": summary }));
            } else {
                print_summary(&summary);
                CliFormatter::warning("Run restorecon on the system partition to restore SELinux labels");
            }
            Ok(())
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "success": false,
                        "phase": e.phase,
                        "kind": e.kind(),
                        "error": e.source.to_string(),
                    })
                );
            }
            bail!("{} phase failed ({}): {}", e.phase, e.kind(), e.source)
        }
    }
}

fn print_summary(summary: &RunSummary) {
    CliFormatter::success("Update applied");
    CliFormatter::kv("Partition digest", &summary.partition_digest);
    CliFormatter::kv("Verification", &format!("{:?}", summary.verification).to_lowercase());
    CliFormatter::kv(
        "Storage",
        if summary.storage.requires_shadow_fallback {
            "shadow fallback"
        } else {
            "direct"
        },
    );
    CliFormatter::kv("Records applied", &summary.records_applied.to_string());
    CliFormatter::kv("Files created", &summary.files_created.to_string());
    CliFormatter::kv("Bytes written", &CliFormatter::bytes(summary.bytes_written));
}

fn cmd_inspect(update_file: &Path, json: bool) -> anyhow::Result<()> {
    let mut reader = UpdateReader::open(update_file)
        .with_context(|| format!("opening {}", update_file.display()))?;
    let header = reader.read_header()?;

    if !json {
        CliFormatter::header(&format!("Update file {}", update_file.display()));
        if header.is_unchecked() {
            CliFormatter::kv("Target digest", "none (unchecked)");
        } else {
            CliFormatter::kv("Target digest", &digest::to_hex(&header.target_digest));
        }
        println!();
    }

    // One record in memory at a time; only its summary is kept for JSON
    let mut totals = UpdateTotals::default();
    let mut listing = Vec::new();
    while let Some(record) = reader.read_record()? {
        record.verify()?;
        totals.add(&record);
        if json {
            listing.push(serde_json::json!({
                "path": record.path.display().to_string(),
                "bytes_added": record.bytes_added,
                "bytes_removed": record.bytes_removed,
                "patch_size": record.patch_size(),
                "digest": digest::to_hex(&record.record_digest),
            }));
        } else {
            CliFormatter::record(totals.records, &record.path.display().to_string(), record.bytes_added, record.bytes_removed);
        }
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "target_digest": digest::to_hex(&header.target_digest),
                "unchecked": header.is_unchecked(),
                "bytes_added": totals.bytes_added,
                "bytes_removed": totals.bytes_removed,
                "records": listing,
            })
        );
    } else {
        println!();
        CliFormatter::kv("Records", &totals.records.to_string());
        CliFormatter::kv("Bytes added", &CliFormatter::bytes(totals.bytes_added));
        CliFormatter::kv("Bytes removed", &CliFormatter::bytes(totals.bytes_removed));
    }

    Ok(())
}

fn cmd_build(
    output: &Path,
    new_root: &Path,
    old_root: Option<&Path>,
    target_digest: Option<&str>,
    paths: &[PathBuf],
    json: bool,
) -> anyhow::Result<()> {
    let header = match target_digest {
        Some(hex) => match digest::from_hex(hex) {
            Some(d) => UpdateHeader::new(d),
            None => bail!("target digest must be {} hex characters", digest::DIGEST_LEN * 2),
        },
        None => UpdateHeader::unchecked(),
    };

    let records = build_update_file(output, &header, new_root, old_root, paths)
        .with_context(|| format!("building {}", output.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "output": output.display().to_string(),
                "records": records.len(),
            })
        );
    } else {
        CliFormatter::success(&format!("Wrote {} records to {}", records.len(), output.display()));
    }
    Ok(())
}

fn cmd_status(scratch_dir: &Path, json: bool) -> anyhow::Result<()> {
    let journal = RunJournal::load(&scratch_dir.join(JOURNAL_FILE))
        .with_context(|| format!("no run journal in {}", scratch_dir.display()))?;
    let holder = RunLock::read(scratch_dir);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "journal": journal,
                "locked_by": holder.map(|h| h.pid),
            })
        );
        return Ok(());
    }

    CliFormatter::header("Last update run");
    CliFormatter::kv("System image", &journal.system_image);
    CliFormatter::kv("Update file", &journal.update_file);
    CliFormatter::kv("Started", &journal.started_at.to_rfc3339());
    match &journal.status {
        RunStatus::Running { phase } => CliFormatter::kv("Status", &format!("running ({})", phase)),
        RunStatus::Done => CliFormatter::kv("Status", "done"),
        RunStatus::Failed { phase, kind, reason } => {
            CliFormatter::kv("Status", &format!("failed in {} ({})", phase, kind));
            CliFormatter::kv("Reason", reason);
        }
    }
    CliFormatter::kv("Records applied", &journal.records_applied.to_string());
    if let Some(path) = &journal.last_path {
        CliFormatter::kv("Last file", path);
    }
    if let Some(holder) = holder {
        CliFormatter::warning(&format!("Lock held by PID {}", holder.pid));
    }
    Ok(())
}
