// safekeep: inspect and maintain a file-backed save store
//
// Opens the store without a host application. Every change goes through
// `SnapshotStore` so eviction, index and emergency-slot rules still apply;
// counters and the emergency slot are read straight from the archive.
// Restores are left to the host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use safekeep_lib::archive::Archive;
use safekeep_lib::capture::ValidationLimits;
use safekeep_lib::config::{RecoveryConfig, DIR_ENV};
use safekeep_lib::logging::init_logging;
use safekeep_lib::snapshot_store::{SnapshotStore, ValidationSummary};
use safekeep_lib::store::FileStore;

#[derive(Parser)]
#[command(name = "safekeep", version, about = "Inspect a safekeep save store")]
struct Cli {
    /// Store directory (defaults to the configured one)
    #[arg(long, global = true, env = DIR_ENV)]
    dir: Option<PathBuf>,

    /// Config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List save points, newest first
    List,
    /// Show one save point
    Show { id: String },
    /// Verify checksums and payloads
    Validate {
        /// Drop invalid save points
        #[arg(long)]
        repair: bool,
    },
    /// Storage usage against the configured budget
    Usage,
    /// Persisted save counters
    Stats,
    /// Delete one save point
    Delete { id: String },
    /// Remove every save point and the emergency slot
    Clear,
    /// Show the emergency slot
    Emergency,
}

struct Inspector {
    store: SnapshotStore,
    archive: Archive,
    limits: ValidationLimits,
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RecoveryConfig::load(path)?,
        None => RecoveryConfig::from_env().context("Failed to load config")?,
    };
    if let Some(dir) = cli.dir.clone() {
        config.storage.dir = Some(dir);
    }
    // Ignore a subscriber installed by the environment
    let _ = init_logging(&config.logging);

    let dir = config.storage_dir();
    let backend = Arc::new(FileStore::new(&dir));
    if !backend.is_available() {
        bail!("Store directory {} is not usable", dir.display());
    }
    tracing::debug!(dir = %dir.display(), "opened store");

    let settings = config.snapshot_settings();
    let ctx = Inspector {
        archive: Archive::new(backend.clone()),
        limits: settings.limits,
        store: SnapshotStore::open_detached(backend, settings),
        json: cli.json,
    };

    match cli.command {
        Command::List => list(&ctx),
        Command::Show { id } => show(&ctx, &id),
        Command::Validate { repair } => validate(&ctx, repair),
        Command::Usage => usage(&ctx),
        Command::Stats => stats(&ctx),
        Command::Delete { id } => delete(&ctx, &id),
        Command::Clear => clear(&ctx),
        Command::Emergency => emergency(&ctx),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list(ctx: &Inspector) -> Result<()> {
    let summaries = ctx.store.list_save_points();

    if ctx.json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("No save points");
        return Ok(());
    }
    for s in summaries {
        println!(
            "{:>4}  {:<14} {}  {:>8} B  p{:<2} {}  {}",
            s.save_index,
            s.save_type.as_str(),
            s.captured_at.format("%Y-%m-%d %H:%M:%S"),
            s.size_bytes,
            s.priority,
            if s.valid { "ok " } else { "BAD" },
            s.id
        );
    }
    Ok(())
}

fn show(ctx: &Inspector, id: &str) -> Result<()> {
    let Some(point) = ctx.store.get_save_point(id) else {
        bail!("No save point with id {}", id);
    };

    if ctx.json {
        return print_json(&point);
    }
    println!("id:          {}", point.id);
    println!("type:        {}", point.save_type);
    println!("index:       {}", point.save_index);
    println!("captured at: {}", point.captured_at.to_rfc3339());
    println!("size:        {} bytes", point.size_bytes);
    println!("checksum:    {}", point.checksum);
    match point.verify(&ctx.limits) {
        Ok(_) => println!("valid:       true"),
        Err(e) => println!("valid:       false ({})", e),
    }
    if let Some(session) = &point.snapshot.session_id {
        println!("session:     {}", session);
    }
    let sections: Vec<&str> = point.snapshot.sections.keys().map(String::as_str).collect();
    println!("sections:    {}", sections.join(", "));
    Ok(())
}

fn validate(ctx: &Inspector, repair: bool) -> Result<()> {
    let summary = if repair {
        ctx.store
            .validate_all_save_points()
            .context("Failed to write repaired save points")?
    } else {
        let mut summary = ValidationSummary::default();
        for s in ctx.store.list_save_points() {
            if s.valid {
                summary.valid += 1;
                continue;
            }
            summary.invalid += 1;
            if let Some(Err(e)) = ctx.store.get_save_point(&s.id).map(|p| p.verify(&ctx.limits)) {
                eprintln!("{}: {}", s.id, e);
            }
        }
        summary
    };

    if ctx.json {
        return print_json(&summary);
    }
    println!(
        "{} valid, {} invalid{}",
        summary.valid,
        summary.invalid,
        if summary.repaired > 0 { " (repaired)" } else { "" }
    );
    if summary.invalid > 0 && !repair {
        std::process::exit(1);
    }
    Ok(())
}

fn usage(ctx: &Inspector) -> Result<()> {
    let usage = ctx
        .store
        .storage_usage()
        .context("Failed to measure storage")?;
    if ctx.json {
        return print_json(&usage);
    }
    println!("save points: {} B", usage.save_points_bytes);
    println!("metadata:    {} B", usage.metadata_bytes);
    println!("emergency:   {} B", usage.emergency_bytes);
    println!(
        "total:       {} / {} B ({:.1}%)",
        usage.total_bytes, usage.budget_bytes, usage.percent_used
    );
    Ok(())
}

fn stats(ctx: &Inspector) -> Result<()> {
    let metadata = ctx.archive.load_metadata()?;
    if ctx.json {
        return print_json(&metadata);
    }
    println!("saves:    {}", metadata.total_saves);
    println!("restores: {}", metadata.total_restores);
    println!("errors:   {}", metadata.total_errors);
    if let (Some(at), Some(save_type)) = (metadata.last_save_at, metadata.last_save_type) {
        println!("last:     {} at {}", save_type, at.to_rfc3339());
    }
    if let Some(index) = metadata.last_save_index {
        println!("index:    {}", index);
    }
    Ok(())
}

fn delete(ctx: &Inspector, id: &str) -> Result<()> {
    let deleted = ctx
        .store
        .delete_save_point(id)
        .with_context(|| format!("Failed to delete {}", id))?;
    if !deleted {
        bail!("No save point with id {}", id);
    }
    println!("Deleted {}", id);
    Ok(())
}

fn clear(ctx: &Inspector) -> Result<()> {
    ctx.store
        .clear_all_save_points()
        .context("Failed to clear save points")?;
    println!("Cleared all save points");
    Ok(())
}

fn emergency(ctx: &Inspector) -> Result<()> {
    let Some(record) = ctx
        .archive
        .load_emergency()
        .context("Failed to read emergency slot")?
    else {
        println!("No emergency record");
        return Ok(());
    };

    if ctx.json {
        return print_json(&record);
    }
    println!("recorded at: {}", record.recorded_at.to_rfc3339());
    println!("error:       {}", record.error_message);
    println!(
        "valid:       {}",
        record.verify(&ctx.limits).is_ok()
    );
    Ok(())
}
