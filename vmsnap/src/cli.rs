use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "vmsnap",
    version,
    about = "Incremental VM disk backups on top of hypervisor external snapshots"
)]
pub struct Cli {
    /// Log level
    #[arg(
        short = 'v',
        long = "verbose",
        value_enum,
        default_value = "INFO",
        ignore_case = true,
        global = true
    )]
    pub verbose: LogLevel,

    /// Configuration file (defaults to $VMSNAP_CONFIG, then /etc/vmsnap/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    #[value(name = "DEBUG")]
    Debug,
    #[value(name = "INFO")]
    Info,
    #[value(name = "WARNING")]
    Warning,
    #[value(name = "ERROR")]
    Error,
    #[value(name = "CRITICAL")]
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Snapshot every disk and copy the frozen files into a new backup set
    Backup(BackupArgs),
    /// Pull each disk's backing chain into its top file and drop the old chain files
    Merge(MergeArgs),
    /// Delete complete backup sets beyond the retention count
    Rotate(RotateArgs),
    /// Show the backup sets of a domain, newest first
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[arg(short = 'd', long)]
    pub domain: String,

    #[arg(short = 'b', long = "backup-dir")]
    pub backup_dir: PathBuf,

    /// Ask the guest agent to quiesce file systems during the snapshot
    #[arg(long)]
    pub quiesce: bool,

    /// Compare sizes only, skip SHA-256 verification of copies
    #[arg(long)]
    pub no_checksum: bool,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    #[arg(short = 'd', long)]
    pub domain: String,

    /// Seconds between block job polls
    #[arg(long = "poll-interval")]
    pub poll_interval: Option<u64>,

    /// Seconds a single disk's block job may run before it is abandoned
    #[arg(long = "max-wait")]
    pub max_wait: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RotateArgs {
    #[arg(short = 'd', long)]
    pub domain: String,

    #[arg(short = 'b', long = "backup-dir")]
    pub backup_dir: PathBuf,

    /// Number of complete backup sets to keep
    #[arg(short = 'r', long = "retention")]
    pub retention: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(short = 'd', long)]
    pub domain: String,

    #[arg(short = 'b', long = "backup-dir")]
    pub backup_dir: PathBuf,
}

impl Command {
    pub fn domain(&self) -> &str {
        match self {
            Command::Backup(args) => &args.domain,
            Command::Merge(args) => &args.domain,
            Command::Rotate(args) => &args.domain,
            Command::List(args) => &args.domain,
        }
    }

    /// Read-only commands run without the domain lock.
    pub fn needs_lock(&self) -> bool {
        !matches!(self, Command::List(_))
    }

    /// Command line values win over the configuration file.
    pub fn apply_overrides(&self, config: &mut Config) {
        match self {
            Command::Backup(args) => {
                if args.quiesce {
                    config.backup.quiesce = true;
                }
                if args.no_checksum {
                    config.backup.verify_checksum = false;
                }
            }
            Command::Merge(args) => {
                if let Some(seconds) = args.poll_interval {
                    config.merge.poll_interval_seconds = seconds;
                }
                if let Some(seconds) = args.max_wait {
                    config.merge.max_wait_seconds = seconds;
                }
            }
            Command::Rotate(args) => {
                if let Some(retention) = args.retention {
                    config.rotate.retention = retention;
                }
            }
            Command::List(_) => {}
        }
    }
}
