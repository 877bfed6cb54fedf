use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use vmsnap::cli::{Cli, Command, LogLevel};
use vmsnap::errors::BackupError;
use vmsnap::operations::{execute_backup, execute_list, execute_merge, execute_rotation};
use vmsnap::services::lock::DomainLock;
use vmsnap::types::{BackupRequest, ListRequest, MergeRequest, RotateRequest};
use vmsnap::{ConfigManager, VirshHypervisor};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("vmsnap: failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let domain = cli.command.domain().to_string();
    let span = info_span!("vmsnap", domain = %domain);

    match run(cli).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&domain, &e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; RUST_LOG takes precedence over `-v`.
fn init_logging(level: LogLevel) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.directive())?,
    };

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ConfigManager::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?
        .into_config();
    cli.command.apply_overrides(&mut config);
    config.validate()?;

    let _lock = if cli.command.needs_lock() {
        Some(DomainLock::try_acquire(&config.lock_dir(), cli.command.domain())?)
    } else {
        None
    };

    let hypervisor = VirshHypervisor::new(&config.hypervisor);

    match cli.command {
        Command::Backup(args) => {
            let request = BackupRequest {
                domain: args.domain,
                backup_dir: args.backup_dir,
                verify_checksum: config.backup.verify_checksum,
                quiesce: config.backup.quiesce,
                save_domain_definition: config.backup.save_domain_definition,
            };
            let report = execute_backup(&hypervisor, &request).await?;
            println!("Backup set: {}", report.set_dir.display());
            println!("Snapshot:   {}", report.snapshot_id);
            for disk in &report.disks {
                println!("  {:<8} {} ({} bytes)", disk.device, disk.file, disk.size_bytes);
            }
        }
        Command::Merge(args) => {
            let request = MergeRequest {
                domain: args.domain,
                poll_interval: config.merge.poll_interval(),
                max_wait: config.merge.max_wait(),
            };
            let report = execute_merge(&hypervisor, &request).await?;
            for disk in &report.disks {
                println!("  {:<8} {}", disk.device, disk.outcome);
            }
            report.into_result()?;
        }
        Command::Rotate(args) => {
            let request = RotateRequest {
                domain: args.domain,
                backup_dir: args.backup_dir,
                retention: config.rotate.retention,
            };
            let report = execute_rotation(&hypervisor, &request).await?;
            println!(
                "Kept {}, removed {}, skipped {} incomplete",
                report.kept.len(),
                report.removed.len(),
                report.skipped.len()
            );
            for name in &report.removed {
                println!("  removed {}", name);
            }
        }
        Command::List(args) => {
            let request = ListRequest {
                domain: args.domain,
                backup_dir: args.backup_dir,
            };
            let sets = execute_list(&request).await?;
            if sets.is_empty() {
                info!("No backup sets found for {}", request.domain);
            }
            for set in &sets {
                println!("{}", set.describe());
            }
        }
    }

    Ok(())
}

/// Prints `domain[/device]: kind: message` lines on stderr.
fn report_failure(domain: &str, err: &anyhow::Error) {
    match err.downcast_ref::<BackupError>() {
        Some(BackupError::DiskFailures { failures, .. }) => {
            for failure in failures {
                eprintln!(
                    "{}/{}: {}: {}",
                    domain, failure.device, failure.kind, failure.message
                );
            }
        }
        Some(e) => {
            let target = match e.device() {
                Some(device) => format!("{}/{}", domain, device),
                None => domain.to_string(),
            };
            eprintln!("{}: {}: {}", target, e.kind(), e);
        }
        None => eprintln!("{}: Error: {:#}", domain, err),
    }
}
