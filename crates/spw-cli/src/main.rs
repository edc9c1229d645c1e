//! 🚀 spw: the front door of spillway.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, sets up logging, wires Ctrl-C, prints a couple of tables,
//! and lets the library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use spw::app_config::{AppConfig, load_config};
use spw::compression::CompressionFormat;
use spw::filter_policy::ApplyOutcome;
use spw::pipeline::StatsSnapshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🌊 Buffered, retrying delivery from a record queue into a search index,
/// with a backup store for whatever the index refuses.
#[derive(Parser, Debug)]
#[command(name = "spw", version, about)]
struct Cli {
    /// 📄 TOML config file. Missing file means "environment variables only" (SPW_*).
    #[arg(long, short, env = "SPW_CONFIG", default_value = "spw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 🚚 Consume, batch and deliver until Ctrl-C. The default.
    Run,
    /// 🧹 Register the configured filter policy for its subscription, then exit.
    ApplyFilterPolicy {
        /// 📒 Registry file to use instead of the configured one.
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// 📮 Spool the lines of an NDJSON file into the configured spool queue.
    Enqueue {
        file: PathBuf,
        /// 🗜️ none, gzip, zip or snappy. Guessed from the file suffix when omitted.
        #[arg(long)]
        compression: Option<String>,
    },
    /// ♻️ Spool every record of a backup object back into the configured spool queue.
    Replay {
        object: PathBuf,
        /// 🗜️ none, gzip, zip or snappy. Guessed from the object key suffix when omitted.
        #[arg(long)]
        compression: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like a service isn't reachable. \
                Double-check that Elasticsearch is actually running and that the url in \
                [sink_config.Elasticsearch] points at it. If you're using Docker, try \
                `docker ps` to see what's up, or `docker compose up -d` to resurrect it. ☕"
            );
        }

        // 🗑️ Exit with prejudice.
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_file = cli.config.as_path();
    let config_file_that_exists = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Couldn't check whether the configuration file exists. Maybe a permissions thing, maybe a cwd thing. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => {
            info!(path = %config_file.display(), "📄 no config file there; using SPW_* environment variables only");
            None
        }
    };
    let app_config = load_config(config_file_that_exists)
        .context("💀 In spw, we couldn't load the config. Take a look at the file and the SPW_* variables, something in there is off")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(app_config).await,
        Command::ApplyFilterPolicy { registry } => apply_filter_policy(app_config, registry).await,
        Command::Enqueue { file, compression } => spool_file(app_config, file, compression, SpoolMode::Lines).await,
        Command::Replay { object, compression } => {
            spool_file(app_config, object, compression, SpoolMode::BackupObject).await
        }
    }
}

async fn run(app_config: AppConfig) -> Result<()> {
    println!("{}", wiring_table(&app_config));

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("🛑 Ctrl-C: finishing every accepted batch. Press Ctrl-C again to abandon stuck backups.");
            shutdown.cancel();
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("🧨 Ctrl-C again: abandoning backups that are still retrying");
            abort.cancel();
        });
    }

    let stats = spw::run(app_config, shutdown, abort).await?;
    println!("{}", stats_table(&stats));
    Ok(())
}

async fn apply_filter_policy(app_config: AppConfig, registry: Option<PathBuf>) -> Result<()> {
    let mut filter = app_config
        .filter_policy
        .context("💀 there is no [filter_policy] section in the config. Nothing to apply.")?;
    if let Some(registry) = registry {
        filter.registry = registry;
    }
    match spw::apply_filter_policy(&filter).await? {
        ApplyOutcome::Applied => println!("🧹 filter policy applied to '{}'", filter.subscription),
        ApplyOutcome::Unchanged => println!("🧹 '{}' already has this filter policy", filter.subscription),
    }
    Ok(())
}

enum SpoolMode {
    Lines,
    BackupObject,
}

async fn spool_file(app_config: AppConfig, file: PathBuf, compression: Option<String>, mode: SpoolMode) -> Result<()> {
    let compression = match compression {
        Some(name) => name.parse::<CompressionFormat>()?,
        None => CompressionFormat::from_key(&file.to_string_lossy()),
    };
    let payload = tokio::fs::read(&file)
        .await
        .with_context(|| format!("💀 could not read '{}'", file.display()))?;
    let spooled = match mode {
        SpoolMode::Lines => spw::enqueue_lines(&app_config.queue_config, &payload, compression).await,
        SpoolMode::BackupObject => spw::replay_backup_object(&app_config.queue_config, &payload, compression).await,
    }
    .with_context(|| format!("💀 could not spool the records from '{}'", file.display()))?;
    println!("📮 spooled {} records from {}", spooled, file.display());
    Ok(())
}

/// 🗺️ Where things come from and where they go.
fn wiring_table(app_config: &AppConfig) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    for (what, wired_to) in app_config.describe_wiring() {
        table.add_row(vec![Cell::new(what), Cell::new(wired_to)]);
    }
    table
}

/// 📊 What happened, in numbers.
fn stats_table(stats: &StatsSnapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    for (label, value) in stats.rows() {
        table.add_row(vec![
            Cell::new(label),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}
