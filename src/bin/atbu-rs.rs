//! Command-line front end for atbu-rs (spec §6 CLI surface). Thin wiring
//! only: argument parsing and destination resolution live here, every
//! behavior lives in the library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atbu_rs::backup_info::model::{BackupType, ProviderKind, StorageDefinition, SCHEMA_VERSION};
use atbu_rs::backup_info::BackupInfoStore;
use atbu_rs::engine::{BackupConfig, BackupEngine};
use atbu_rs::error::{BackupError, ConfigError, Result};
use atbu_rs::keys::{KeyManager, KeyringSecretStore};
use atbu_rs::persistent_info::{diff, update_digests, ChangeDetectionType, DiffAction, PerDirSink, PerFileSink, PersistentInfoSink};
use atbu_rs::restore::RestoreEngine;
use atbu_rs::storage::{create_storage_backend, StorageBackend, StorageConfig};
use atbu_rs::Context;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "atbu-rs", version, about = "Content-addressed backup engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding storage-definition documents and history DBs.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Back up one or more source trees into a destination repository.
    Backup {
        #[arg(long, conflicts_with_all = ["incremental", "incremental_plus"])]
        full: bool,
        #[arg(long, conflicts_with_all = ["full", "incremental_plus"])]
        incremental: bool,
        #[arg(long = "incremental-plus", conflicts_with_all = ["full", "incremental"])]
        incremental_plus: bool,
        #[arg(long)]
        dedup: bool,
        #[arg(long = "no-detect-bitrot")]
        no_detect_bitrot: bool,
        #[arg(long, default_value_t = 8)]
        upload_concurrency: usize,
        src: Vec<PathBuf>,
        dest: String,
    },
    /// Restore files from a backup into a local directory.
    Restore {
        dest: String,
        #[arg(value_parser = parse_backup_ref)]
        backup: String,
        #[arg(value_parser = parse_files_ref)]
        files: String,
        out_dir: PathBuf,
    },
    /// Verify a backup's stored objects against their recorded digests.
    Verify {
        dest: String,
        #[arg(value_parser = parse_backup_ref)]
        backup: String,
        #[arg(value_parser = parse_files_ref)]
        files: String,
        #[arg(long)]
        compare: bool,
    },
    /// List backups (and optionally files within one) at a destination.
    List {
        dest: String,
        #[arg(value_parser = parse_backup_ref)]
        backup: Option<String>,
        #[arg(value_parser = parse_files_ref)]
        files: Option<String>,
    },
    /// Credential / storage-definition management.
    Creds {
        #[command(subcommand)]
        action: CredsAction,
    },
    /// Refresh per-file digest records under one or more locations.
    UpdateDigests {
        #[arg(long, value_enum, default_value = "datesize")]
        cdt: Cdt,
        locations: Vec<String>,
    },
    /// Materialize one or more locations into a single JSON database file.
    SaveDb {
        #[arg(long)]
        db: PathBuf,
        locations: Vec<String>,
    },
    /// Compute A\B by content digest, optionally removing duplicates in A.
    Diff {
        a: String,
        b: String,
        #[arg(long, value_enum)]
        action: Option<DiffActionArg>,
        #[arg(long)]
        md: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CredsAction {
    /// Create a new storage definition and generate its encryption key.
    CreateStorageDef {
        name: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        password: Option<String>,
    },
    /// Export a storage definition's key to a signed JSON document.
    Export {
        name: String,
        out_path: PathBuf,
        #[arg(long)]
        password: bool,
    },
    /// Import a storage definition's key from a signed JSON document.
    Import {
        name: String,
        in_path: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum Cdt {
    Datesize,
    Digest,
}

#[derive(Clone, clap::ValueEnum)]
enum DiffActionArg {
    RemoveDuplicates,
    MoveDuplicates,
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("ATBU_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config").join("atbu-rs"))
                .unwrap_or_else(|| PathBuf::from(".atbu-rs"))
        })
}

/// Strips the `backup:` prefix the spec's CLI grammar uses (`backup:last`,
/// `backup:<label>`), accepting the bare value too.
fn parse_backup_ref(s: &str) -> std::result::Result<String, String> {
    Ok(s.strip_prefix("backup:").unwrap_or(s).to_string())
}

fn parse_files_ref(s: &str) -> std::result::Result<String, String> {
    Ok(s.strip_prefix("files:").unwrap_or(s).to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir).map_err(BackupError::Io)?;
    let cli_command = cli.command;

    match cli_command {
        Command::Backup {
            full,
            incremental,
            incremental_plus,
            dedup,
            no_detect_bitrot,
            upload_concurrency,
            src,
            dest,
        } => {
            let backup_type = if full {
                BackupType::Full
            } else if incremental_plus {
                if dedup {
                    BackupType::IncrementalPlusDedup
                } else {
                    BackupType::IncrementalPlus
                }
            } else if incremental {
                BackupType::Incremental
            } else {
                BackupType::Incremental
            };

            let (definition, backend) = resolve_destination(&config_dir, &dest).await?;
            let crypto = load_crypto(&config_dir, &definition)?;
            let mut store = BackupInfoStore::open(&config_dir, definition.clone())?;

            let engine = BackupEngine::new(
                backend,
                definition.container.clone(),
                crypto,
                BackupConfig {
                    source_roots: src,
                    backup_type,
                    detect_bitrot: !no_detect_bitrot,
                    upload_concurrency,
                },
            );
            let ctx = Context::new();
            let manifest = engine.run(&store, &ctx).await?;
            println!(
                "backup {} complete: {} records, {} errors",
                manifest.label,
                manifest.records.len(),
                manifest.errors.len()
            );
            let had_errors = !manifest.errors.is_empty();
            store.commit_with_self_backup(manifest, &engine, &ctx).await?;
            if had_errors {
                std::process::exit(1);
            }
        }
        Command::Restore {
            dest,
            backup,
            files,
            out_dir,
        } => {
            let (definition, backend) = resolve_destination(&config_dir, &dest).await?;
            let crypto = load_crypto(&config_dir, &definition)?;
            let store = BackupInfoStore::open(&config_dir, definition.clone())?;
            let restorer = RestoreEngine::new(backend, definition.container.clone(), crypto);
            let ctx = Context::new();
            let report = restorer.restore(&store, &backup, &files, &out_dir, &ctx).await?;
            println!("restored {} files, {} errors", report.restored.len(), report.errors.len());
            for err in &report.errors {
                eprintln!("  {err}");
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Command::Verify {
            dest,
            backup,
            files,
            compare,
        } => {
            let (definition, backend) = resolve_destination(&config_dir, &dest).await?;
            let crypto = load_crypto(&config_dir, &definition)?;
            let store = BackupInfoStore::open(&config_dir, definition.clone())?;
            let restorer = RestoreEngine::new(backend, definition.container.clone(), crypto);
            let ctx = Context::new();
            let report = restorer.verify(&store, &backup, &files, compare, &ctx).await?;
            println!(
                "verified {} files, {} mismatches, {} errors",
                report.verified.len(),
                report.mismatches.len(),
                report.errors.len()
            );
            for mismatch in &report.mismatches {
                eprintln!("  {mismatch}");
            }
            for err in &report.errors {
                eprintln!("  {err}");
            }
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Command::List { dest, backup, files } => {
            let (definition, _backend) = resolve_destination(&config_dir, &dest).await?;
            let store = BackupInfoStore::open(&config_dir, definition)?;
            match backup {
                None => {
                    for label in store.list_backup_labels() {
                        println!("{label}");
                    }
                }
                Some(label) => {
                    let glob = files.as_deref().unwrap_or("*");
                    for record in store.files_in_backup(&label, glob)? {
                        println!("{}\t{}\t{}", record.source_path.display(), record.size, record.plaintext_digest);
                    }
                }
            }
        }
        Command::Creds { action } => run_creds(&config_dir, action)?,
        Command::UpdateDigests { cdt, locations } => {
            let cdt = match cdt {
                Cdt::Datesize => ChangeDetectionType::DateSize,
                Cdt::Digest => ChangeDetectionType::Digest,
            };
            for location in locations {
                let sink = open_location(&location);
                let report = update_digests(sink.as_ref(), cdt)?;
                println!(
                    "{location}: {} updated, {} unchanged, {} sneaky-corruption, {} errors",
                    report.updated.len(),
                    report.unchanged.len(),
                    report.sneaky_corruption.len(),
                    report.errors.len()
                );
                for warning in &report.sneaky_corruption {
                    eprintln!(
                        "  sneaky corruption: {} ({} -> {})",
                        warning.path.display(),
                        warning.previous_digest,
                        warning.current_digest
                    );
                }
            }
        }
        Command::SaveDb { db, locations } => {
            let sinks: Vec<Box<dyn PersistentInfoSink>> = locations.iter().map(|l| open_location(l)).collect();
            atbu_rs::persistent_info::save_db(&sinks, &db)?;
            println!("saved {} locations to {}", locations.len(), db.display());
        }
        Command::Diff { a, b, action, md } => {
            let sink_a = open_location(&a);
            let sink_b = open_location(&b);
            let diff_action = match action {
                Some(DiffActionArg::RemoveDuplicates) => Some(DiffAction::RemoveDuplicates),
                Some(DiffActionArg::MoveDuplicates) => {
                    let dir = md.ok_or_else(|| {
                        BackupError::Config(ConfigError::Invalid("--md is required with move-duplicates".into()))
                    })?;
                    Some(DiffAction::MoveDuplicates(dir))
                }
                None => None,
            };
            let report = diff(sink_a.as_ref(), sink_b.as_ref(), diff_action)?;
            if report.a_only.is_empty() {
                println!("All items in Location A were found in Location B.");
            } else {
                for path in &report.a_only {
                    println!("{}", path.display());
                }
            }
            if !report.actioned.is_empty() {
                println!("{} duplicate(s) actioned in A", report.actioned.len());
            }
            for err in &report.errors {
                eprintln!("  {err}");
            }
        }
    }
    Ok(())
}

/// Accepts `per-file:`/`pf:` prefixed locations for the sidecar shape;
/// anything else uses the per-directory database shape.
fn open_location(location: &str) -> Box<dyn PersistentInfoSink> {
    if let Some(rest) = location.strip_prefix("per-file:") {
        Box::new(PerFileSink::new(PathBuf::from(rest)))
    } else if let Some(rest) = location.strip_prefix("pf:") {
        Box::new(PerFileSink::new(PathBuf::from(rest)))
    } else {
        Box::new(PerDirSink::new(PathBuf::from(location)))
    }
}

fn definition_path(config_dir: &Path, name: &str) -> PathBuf {
    config_dir.join(format!("{name}.atbudef.json"))
}

fn run_creds(config_dir: &Path, action: CredsAction) -> Result<()> {
    match action {
        CredsAction::CreateStorageDef {
            name,
            path,
            encrypt,
            password,
        } => {
            let key_manager = key_manager();
            if encrypt {
                key_manager.create_key(&name, password.as_deref())?;
            }
            let definition = StorageDefinition {
                schema_version: SCHEMA_VERSION,
                name: name.clone(),
                provider_kind: ProviderKind::Filesystem,
                container: "repo".to_string(),
                storage_config: StorageConfig::Filesystem {
                    root: path.to_string_lossy().to_string(),
                },
                encryption_enabled: encrypt,
                persisted_iv: true,
                encryption_key_ref: encrypt.then(|| name.clone()),
                case_insensitive: false,
            };
            let bytes = serde_json::to_vec_pretty(&definition)?;
            std::fs::write(definition_path(config_dir, &name), bytes).map_err(BackupError::Io)?;
            println!("created storage definition {name}");
        }
        CredsAction::Export { name, out_path, password } => {
            let key_manager = key_manager();
            key_manager.export(&name, &out_path, password)?;
            println!("exported {name} to {}", out_path.display());
        }
        CredsAction::Import {
            name,
            in_path,
            password,
            overwrite,
        } => {
            let key_manager = key_manager();
            key_manager.import(&name, &in_path, password.as_deref(), overwrite)?;
            println!("imported key for {name}");
        }
    }
    Ok(())
}

fn key_manager() -> KeyManager {
    KeyManager::new(Box::new(KeyringSecretStore))
}

async fn resolve_destination(config_dir: &Path, dest: &str) -> Result<(StorageDefinition, Arc<dyn StorageBackend>)> {
    let definition = if let Some(name) = dest.strip_prefix("storage:") {
        let bytes = std::fs::read(definition_path(config_dir, name)).map_err(BackupError::Io)?;
        serde_json::from_slice(&bytes)?
    } else {
        StorageDefinition {
            schema_version: SCHEMA_VERSION,
            name: Path::new(dest)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "local".to_string()),
            provider_kind: ProviderKind::Filesystem,
            container: "repo".to_string(),
            storage_config: StorageConfig::Filesystem {
                root: dest.to_string(),
            },
            encryption_enabled: false,
            persisted_iv: false,
            encryption_key_ref: None,
            case_insensitive: false,
        }
    };
    let backend: Arc<dyn StorageBackend> = Arc::from(create_storage_backend(&definition.storage_config).await?);
    Ok((definition, backend))
}

fn load_crypto(
    _config_dir: &Path,
    definition: &StorageDefinition,
) -> Result<Option<atbu_rs::CryptoEnvelope>> {
    if !definition.encryption_enabled {
        return Ok(None);
    }
    let key_ref = definition
        .encryption_key_ref
        .as_deref()
        .ok_or_else(|| BackupError::Config(ConfigError::Invalid("encryption enabled with no key reference".into())))?;
    let key_manager = key_manager();
    let key = key_manager.unlock(key_ref, None)?;
    Ok(Some(atbu_rs::CryptoEnvelope::new(&key)?))
}
