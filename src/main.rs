use anyhow::{bail, Context, Result};
use book_reconcile::database_ops::{MemoryStore, PgStore, TargetStore};
use book_reconcile::legacy::{open_export, verify_sources};
use book_reconcile::reconcile::{
    repair_aggregates, run_migration, scan_export, CancelFlag, MigrationConfig, RunSummary,
};
use book_reconcile::util::db::Db;
use book_reconcile::util::env;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reconcile", version, about = "Legacy export reconciliation and migration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Reconcile legacy exports into the target store
    Run {
        /// Legacy export files, processed in the order given
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Run the whole pipeline against an in-memory store
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Rows per bulk write (overrides MIGRATION_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Exit non-zero when soft errors exceed this (overrides MAX_SOFT_ERRORS)
        #[arg(long)]
        max_soft_errors: Option<u64>,
        /// Write the JSON run report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Read and classify exports without touching any store
    Scan {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Recount book aggregates from stored pages
    Repair {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env::init_env();
    book_reconcile::tracing::init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            files,
            dry_run,
            batch_size,
            max_soft_errors,
            report,
            db_url,
        } => {
            let mut cfg = MigrationConfig::from_env()?;
            cfg.dry_run |= dry_run;
            if let Some(n) = batch_size {
                cfg.batch_size = n;
            }
            if max_soft_errors.is_some() {
                cfg.max_soft_errors = max_soft_errors;
            }
            cfg.validate()?;
            verify_sources(&files)?;

            let cancel = CancelFlag::new();
            cancel_on_ctrl_c(cancel.clone());

            let store: Box<dyn TargetStore> = if cfg.dry_run {
                info!("dry run: reconciling into an in-memory store");
                Box::new(MemoryStore::new())
            } else {
                Box::new(connect_store(db_url).await?)
            };
            let summary = run_migration(store.as_ref(), &files, &cfg, &cancel).await?;
            write_report(&summary, report.as_deref())?;

            if summary.exceeds(cfg.max_soft_errors) {
                error!(
                    soft_errors = summary.soft_error_total(),
                    max = ?cfg.max_soft_errors,
                    "soft error threshold exceeded"
                );
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Scan { files } => {
            let cfg = MigrationConfig::from_env()?;
            verify_sources(&files)?;
            let mut reports = Vec::with_capacity(files.len());
            for path in &files {
                let reader = open_export(path, cfg.probe_bytes)?;
                let report = scan_export(reader, &cfg.prefixes)
                    .with_context(|| format!("scan {}", path.display()))?;
                info!(
                    file = %path.display(),
                    documents = report.documents,
                    rejected = report.rejected,
                    "scan complete"
                );
                reports.push(json!({ "file": path.display().to_string(), "report": report }));
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Commands::Repair { db_url } => {
            let store = connect_store(db_url).await?;
            store.acquire_run_lock().await?;
            let result = repair_aggregates(&store).await;
            if let Err(e) = store.release_run_lock().await {
                warn!(error = %e, "failed to release run lock");
            }
            let corrected = result?;
            println!("{}", json!({ "books_corrected": corrected }));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cancel_on_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current batch");
            cancel.cancel();
        }
    });
}

fn resolve_database_url(db_url: Option<String>) -> Result<String> {
    if let Some(url) = db_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let env_url = env::db_url().context("resolve_database_url: missing database URL")?;
    let trimmed = env_url.trim();
    if trimmed.is_empty() {
        bail!("database URL is empty; set MIGRATION_DATABASE_URL / DATABASE_URL or pass --db-url");
    }
    Ok(trimmed.to_string())
}

async fn connect_store(db_url: Option<String>) -> Result<PgStore> {
    let url = resolve_database_url(db_url)?;
    let max_conns: u32 = env::env_parse("MIGRATION_DB_MAX_CONNECTIONS", 5);
    info!(url = %env::redact_dsn(&url), max_conns, "connecting to target store");
    let db = Db::connect(&url, max_conns).await?;
    db.ensure_schema().await?;
    Ok(PgStore::new(db))
}

fn write_report(summary: &RunSummary, path: Option<&Path>) -> Result<()> {
    let body = serde_json::to_string_pretty(summary)?;
    match path {
        Some(p) => {
            std::fs::write(p, body).with_context(|| format!("write run report {}", p.display()))?;
            info!(path = %p.display(), "run report written");
        }
        None => println!("{body}"),
    }
    Ok(())
}
