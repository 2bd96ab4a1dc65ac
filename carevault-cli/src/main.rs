//! CareVault CLI
//!
//! Composition root: builds every core component explicitly from the
//! configuration and drives the repository and sync manager.

use anyhow::{bail, Context, Result};
use carevault_core::api::{HttpRecordService, ResilientService, StaticConnectivity, StaticTokenAuth};
use carevault_core::audit::AuditLogger;
use carevault_core::crypto::{RecordSealer, SoftwareKeyProvider};
use carevault_core::records::{HealthRecord, RecordContent, RecordStatus, RecordType, RecordValidator};
use carevault_core::sync::RecordUploader;
use carevault_core::{
    CareConfig, CryptoError, Database, EncryptionManager, HardwareKeyProvider, RecordCache,
    RecordFilter, RecordsEvent, Repository, SyncManager, SyncReport, UploadState,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the API bearer token
const TOKEN_ENV: &str = "CAREVAULT_API_TOKEN";

#[derive(Parser)]
#[command(name = "carevault", about = "Encrypted health-record cache and sync")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Treat the device as offline
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and the first key version
    Init,

    /// Validate, cache and upload a record
    Add {
        #[arg(long)]
        patient: String,

        #[arg(long)]
        provider: String,

        /// Record type, e.g. lab_result
        #[arg(long = "type")]
        record_type: String,

        #[arg(long, default_value = "draft")]
        status: String,

        /// RFC 3339 date, defaults to now
        #[arg(long)]
        date: Option<String>,

        /// Record content as a JSON object
        #[arg(long)]
        content: String,
    },

    /// Read a patient's records
    List {
        #[arg(long)]
        patient: String,

        #[arg(long, default_value_t = 0)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        page_size: u32,

        /// Fetch from the server even if the cache is fresh
        #[arg(long)]
        refresh: bool,
    },

    /// List records waiting for upload
    Pending {
        #[arg(long)]
        patient: String,
    },

    /// Run one sync cycle
    Sync {
        /// Only this patient; all cached patients otherwise
        #[arg(long)]
        patient: Option<String>,
    },

    /// Rotate the record key and migrate cached rows
    RotateKey {
        /// Key alias, defaults to security.default_key_alias
        #[arg(long)]
        alias: Option<String>,
    },

    /// Destroy key versions past their grace period
    PurgeKeys,

    /// Show last sync times and the pending count
    Status,

    /// List unresolved sync conflicts
    Conflicts,

    /// Resolve a sync conflict
    Resolve {
        id: i64,

        /// Keep the local edit instead of the server copy
        #[arg(long)]
        keep_local: bool,
    },

    /// Sync periodically until Ctrl-C
    Daemon,
}

/// Components built from one configuration
struct App {
    crypto: Arc<EncryptionManager>,
    sync: Arc<SyncManager>,
    repo: Repository,
}

fn load_config(cli: &Cli) -> Result<CareConfig> {
    let mut config = match &cli.config {
        Some(path) => CareConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let path = carevault_core::platform::get_default_config_path();
            if path.exists() {
                CareConfig::load(&path)?
            } else {
                info!("No config file found, using defaults");
                CareConfig::default()
            }
        }
    };

    if let Some(database) = &cli.database {
        config.cache.database_path = database.clone();
    }
    config.validate()?;
    Ok(config)
}

fn key_provider(config: &CareConfig) -> Result<Arc<dyn HardwareKeyProvider>> {
    if config.security.require_hardware_keys {
        // No platform keystore binding exists for desktop targets
        return Err(CryptoError::HardwareUnavailable(
            "no hardware keystore on this platform; set security.require_hardware_keys = false \
             for developer mode"
                .to_string(),
        )
        .into());
    }
    let provider = SoftwareKeyProvider::load_or_create(&config.security.software_key_path)
        .with_context(|| {
            format!(
                "opening key file {}",
                config.security.software_key_path.display()
            )
        })?;
    Ok(Arc::new(provider))
}

fn build(config: &CareConfig, online: bool) -> Result<App> {
    if let Some(parent) = config.cache.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Mutex::new(Database::open_initialized(
        &config.cache.database_path,
    )?));

    let crypto = Arc::new(EncryptionManager::new(
        key_provider(config)?,
        Arc::clone(&db),
        &config.security,
    )?);
    let sealer = RecordSealer::new(Arc::clone(&crypto), config.security.default_key_alias.clone());
    let cache = RecordCache::new(Arc::clone(&db), &config.cache);
    let audit = AuditLogger::new(Arc::clone(&db));

    let auth = StaticTokenAuth::new(std::env::var(TOKEN_ENV).unwrap_or_default());
    let http = HttpRecordService::new(&config.api, Arc::new(auth))?;
    let service = Arc::new(ResilientService::new(http, &config.api));

    let uploader = Arc::new(RecordUploader::new(
        service,
        cache.clone(),
        sealer.clone(),
        audit.clone(),
    ));
    let sync = Arc::new(SyncManager::new(
        db,
        cache,
        sealer,
        uploader,
        audit,
        config.sync.conflict_policy,
    ));
    let repo = Repository::new(
        Arc::clone(&sync),
        Arc::new(StaticConnectivity::new(online)),
        RecordValidator::new(&config.validation),
    );

    Ok(App { crypto, sync, repo })
}

fn parse_content(json: &str) -> Result<RecordContent> {
    match serde_json::from_str(json).context("content is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("content must be a JSON object"),
    }
}

fn print_reports(reports: &[SyncReport]) {
    for r in reports {
        println!(
            "{}: uploaded {} (failed {}), pulled {}, merged {}, conflicts {}, rejected {}",
            r.entity_id, r.uploaded, r.upload_failures, r.pulled, r.merged, r.conflicts, r.rejected
        );
    }
}

fn print_records(label: &str, records: &[HealthRecord]) {
    println!("{} ({} records)", label, records.len());
    for record in records {
        println!(
            "  {}  {}  {}  v{}  {}",
            record.id,
            record.date.format("%Y-%m-%d"),
            record.record_type,
            record.metadata.version,
            record.status
        );
        println!("    {}", serde_json::Value::Object(record.content.clone()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let app = build(&config, !cli.offline)?;
    let alias = config.security.default_key_alias.clone();

    match cli.command {
        Commands::Init => {
            if app.crypto.current_version(&alias)?.is_none() {
                app.crypto.rotate_key(&alias)?;
            }
            println!(
                "Initialized {} (key version {:?}, provider {})",
                config.cache.database_path.display(),
                app.crypto.current_version(&alias)?,
                app.crypto.provider_kind().as_str()
            );
        }
        Commands::Add {
            patient,
            provider,
            record_type,
            status,
            date,
            content,
        } => {
            let record_type: RecordType = record_type.parse()?;
            let mut record = HealthRecord::new(patient, provider, record_type, parse_content(&content)?);
            record.status = status.parse::<RecordStatus>()?;
            if let Some(date) = date {
                record.date = DateTime::parse_from_rfc3339(&date)
                    .context("date must be RFC 3339")?
                    .with_timezone(&Utc);
            }

            let mut states = app.repo.upload(record.clone());
            while let Some(state) = states.next().await {
                match state {
                    UploadState::Uploading => println!("{}: uploading", record.id),
                    UploadState::Success(remote) => {
                        println!("{}: uploaded (server version {})", record.id, remote.server_version)
                    }
                    UploadState::Pending => println!("{}: queued for sync", record.id),
                    UploadState::Error(e) => bail!("{}: {}", record.id, e),
                }
            }
        }
        Commands::List {
            patient,
            page,
            page_size,
            refresh,
        } => {
            let mut filter = RecordFilter::for_patient(patient);
            filter.force_refresh = refresh;

            let mut events = app.repo.get_records(filter, page, page_size);
            while let Some(event) = events.next().await {
                match event {
                    RecordsEvent::Cached(page) => print_records("Cached", &page.items),
                    RecordsEvent::Fresh(page) => print_records("Fresh", &page.items),
                    RecordsEvent::Offline => println!("Offline: showing cached records"),
                    RecordsEvent::Failed(e) => bail!(e),
                }
            }
        }
        Commands::Pending { patient } => {
            let pending = app.sync.cache().get_pending(&patient)?;
            println!("{} pending", pending.len());
            for row in pending {
                println!(
                    "  {}  v{}  {}  key v{}",
                    row.record_id,
                    row.version,
                    row.last_modified.to_rfc3339(),
                    row.content.key_version
                );
            }
        }
        Commands::Sync { patient } => {
            let reports = match patient {
                Some(patient) => vec![app.sync.sync(&patient).await?],
                None => app.repo.refresh().await?,
            };
            print_reports(&reports);
        }
        Commands::RotateKey { alias: requested } => {
            if let Some(requested) = requested.filter(|a| *a != alias) {
                let version = app.repo.rotate_alias(&requested)?;
                println!("{}: key version {:?}", requested, version);
            } else {
                let (version, migrated) = app.repo.rotate_key()?;
                println!("{}: key version {:?}, {} rows re-encrypted", alias, version, migrated);
            }
        }
        Commands::PurgeKeys => {
            let purged = app.repo.purge_expired_keys()?;
            println!("Purged {} key versions", purged);
        }
        Commands::Status => {
            println!(
                "Provider: {}  key version: {:?}  retired: {:?}",
                app.crypto.provider_kind().as_str(),
                app.crypto.current_version(&alias)?,
                app.crypto.retired_versions()?
            );
            println!("Pending records: {}", app.sync.cache().count_pending(None)?);
            for (entity, at) in app.sync.last_sync_times()? {
                println!("  {}  last sync {}", entity, at.to_rfc3339());
            }
        }
        Commands::Conflicts => {
            let conflicts = app.sync.list_conflicts()?;
            println!("{} unresolved conflicts", conflicts.len());
            for c in conflicts {
                println!(
                    "  #{}  {}  local v{}  server v{}  {}",
                    c.conflict_id,
                    c.record_id,
                    c.local_version,
                    c.server_version,
                    c.detected_at.to_rfc3339()
                );
            }
        }
        Commands::Resolve { id, keep_local } => {
            app.sync.resolve_conflict(id, keep_local)?;
            println!("Conflict #{} resolved", id);
        }
        Commands::Daemon => {
            let schedule = app
                .sync
                .schedule_periodic_sync(config.sync.interval(), config.sync.entities.clone());
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            schedule.cancel();
            schedule.join().await;
        }
    }

    Ok(())
}
