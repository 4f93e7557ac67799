use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patrimoine_core::{
    EntityKind, IntegrityCheckOutcome, KeyManager, KeyProvider, Vault, VaultPaths, VaultSettings,
};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "patrimoine")]
#[command(author, version, about = "Maintenance tools for the Patrimoine encrypted store", long_about = None)]
struct Cli {
    /// Data directory (defaults to PATRIMOINE_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate fresh key material and take the initial key backup
    InitKeys {
        /// Replace existing key files (they are archived first)
        #[arg(long)]
        force: bool,
    },

    /// Create the database schema, generating keys on first use
    InitDb,

    /// Write an encrypted backup container
    Backup {
        /// Data file to back up (defaults to the vault database)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Container path (defaults to backup_{timestamp}.zip.enc next to the source)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Restore a backup container over the database
    Restore {
        backup: PathBuf,
        /// File to replace (defaults to the vault database)
        #[arg(long)]
        target: Option<PathBuf>,
    },

    /// Verify that encrypted values decode
    CheckIntegrity {
        /// Records sampled per entity kind
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        sample_size: Option<u64>,
        /// Always run the complete scan
        #[arg(long)]
        full: bool,
    },

    /// Backup, rotation and daily key backup in one run
    ScheduledBackup {
        /// Scheduled containers to keep
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Snapshot the live key files
    BackupKeys {
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Bump the key metadata version
    RotateVersion,

    /// Archive the live keys and switch to fresh material
    RotateKeys,

    /// List archived key sets as JSON
    ListKeyBackups,

    /// Delete old non-initial key backups
    PruneKeyBackups {
        #[arg(long)]
        keep: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let paths = match cli.data_dir {
        Some(dir) => VaultPaths::new(dir),
        None => VaultPaths::discover()?,
    };

    match cli.command {
        Commands::InitKeys { force } => init_keys(&paths, force)?,
        Commands::InitDb => {
            let vault = Vault::open_or_initialize(paths)?;
            let store = vault.open_store()?;
            let mut rows = serde_json::Map::new();
            for kind in EntityKind::ALL {
                rows.insert(kind.table().to_string(), json!(store.count(kind)?));
            }
            info!(path = %vault.paths().database().display(), "database ready");
            let summary = json!({ "database": vault.paths().database(), "rows": rows });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Backup { source, output } => {
            let vault = Vault::open(paths)?;
            let source = source.unwrap_or_else(|| vault.paths().database());
            let path = vault
                .backup_service()
                .create_backup(&source, output.as_deref())?;
            println!("{}", path.display());
        }
        Commands::Restore { backup, target } => {
            let vault = Vault::open(paths)?;
            let target = target.unwrap_or_else(|| vault.paths().database());
            let outcome = vault.backup_service().restore_backup(&backup, &target)?;
            let report = json!({
                "target": outcome.target,
                "safety_copy": outcome.safety_copy,
                "manifest": outcome.manifest,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::CheckIntegrity { sample_size, full } => {
            let vault = Vault::open(paths)?;
            let sample_size = match sample_size {
                Some(n) => usize::try_from(n).context("sample size too large")?,
                None => vault.settings().integrity_sample_size,
            };
            return check_integrity(&vault, sample_size, full);
        }
        Commands::ScheduledBackup { keep } => {
            let vault = Vault::open(paths)?;
            let keep = keep.unwrap_or(vault.settings().backup_retention);
            let report = vault.scheduled_backup(keep)?;
            let summary = json!({
                "backup": report.backup,
                "removed": report.removed,
                "key_backup": report.key_backup,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::BackupKeys { prefix } => {
            let backup = KeyManager::open(&paths)?.backup_keys(&prefix)?;
            println!("{}", serde_json::to_string_pretty(&backup)?);
        }
        Commands::RotateVersion => {
            let version = KeyManager::open(&paths)?.increment_version()?;
            println!("{version}");
        }
        Commands::RotateKeys => {
            let vault = Vault::open(paths)?;
            let version = vault.rotate_keys()?;
            println!("{version}");
        }
        Commands::ListKeyBackups => {
            let backups = KeyManager::open(&paths)?.list_backups()?;
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        Commands::PruneKeyBackups { keep } => {
            let removed = KeyManager::open(&paths)?.prune_backups(keep)?;
            println!("{}", serde_json::to_string_pretty(&removed)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init_keys(paths: &VaultPaths, force: bool) -> Result<()> {
    let settings = VaultSettings::load(&paths.settings_file())?;
    let manager = KeyManager::init_new_keys(paths, settings.kdf_iterations, force)
        .with_context(|| format!("initialising keys in {}", paths.root().display()))?;

    let vault = Vault::open(paths.clone())?;
    let key = vault.keys().active_key()?;
    let summary = json!({
        "version": manager.current_version(),
        "fingerprint": key.fingerprint(),
        "data_dir": paths.root(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check_integrity(vault: &Vault, sample_size: usize, full: bool) -> Result<ExitCode> {
    match vault.integrity_check(sample_size, full)? {
        IntegrityCheckOutcome::Passed { safety_backup } => {
            let summary = json!({ "passed": true, "safety_backup": safety_backup });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        IntegrityCheckOutcome::Failed {
            safety_backup,
            report,
        } => {
            let summary = json!({
                "passed": false,
                "safety_backup": safety_backup,
                "report": report,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::from(1))
        }
    }
}
