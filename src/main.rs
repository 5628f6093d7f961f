//! gauge_discovery - command line entry point
//!
//! Subcommands:
//! - `run`        : discover gauges, classify them, checkpoint as it goes.
//! - `refresh`    : re-fetch thresholds for known gauges.
//! - `reclassify` : recompute tiers after a station or weight change.
//! - `report`     : write the registry JSON and print summaries.
//! - `export-db`  : mirror the registry into PostgreSQL.
//! - `check`      : evaluate a value against a gauge's cached thresholds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use gauge_discovery::alert::staleness::stale_entries;
use gauge_discovery::alert::thresholds::ThresholdCache;
use gauge_discovery::analysis::Assessor;
use gauge_discovery::config::{self, DiscoveryConfig};
use gauge_discovery::db;
use gauge_discovery::dev_mode::ReplayApi;
use gauge_discovery::discovery::generator::CandidateGenerator;
use gauge_discovery::discovery::probe::{ProbeExecutor, RetryPolicy};
use gauge_discovery::discovery::ratelimit::RateLimiter;
use gauge_discovery::discovery::runner::{
    self, CancelToken, DiscoveryRunner, RunBudget,
};
use gauge_discovery::discovery::store::DiscoveryStore;
use gauge_discovery::ingest::LookupApi;
use gauge_discovery::ingest::floodhub::FloodHubClient;
use gauge_discovery::logging::{self, LogLevel, LogSource};
use gauge_discovery::report;
use gauge_discovery::stations::ReferenceRegistry;

#[derive(Parser, Debug)]
#[command(name = "gauge_discovery")]
#[command(about = "Discover unlisted river gauges and classify their reliability")]
#[command(version)]
struct Cli {
    /// Configuration file; built-in defaults are used if it does not exist
    #[arg(short, long, default_value = "discovery.toml", env = "GAUGE_DISCOVERY_CONFIG")]
    config: PathBuf,

    /// debug, info, warn or error (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<String>,

    /// Answer lookups from a recorded replay file instead of the live API
    #[arg(long)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover and classify gauges
    Run {
        /// Stop after dispatching this many candidates
        #[arg(long)]
        budget: Option<u64>,
        /// Stop scheduling new probes after this many minutes
        #[arg(long)]
        deadline_minutes: Option<u64>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Re-fetch flood thresholds for every known gauge with a model
    Refresh,
    /// Recompute evidence, scores and tiers for every known gauge
    Reclassify,
    /// Write the registry JSON and print summaries
    Report {
        /// Defaults to run.registry_path from the configuration
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Upsert the registry and thresholds into PostgreSQL (DATABASE_URL)
    ExportDb,
    /// Check a current value against a gauge's cached thresholds
    Check { gauge_id: String, value: f64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logger(parse_log_level(&cli.log_level)?, cli.log_file.as_deref(), true)
        .context("Failed to open log file")?;

    let config = load_config(&cli.config)?;

    match &cli.command {
        Command::Run {
            budget,
            deadline_minutes,
            workers,
        } => {
            let mut config = config;
            if let Some(w) = workers {
                config.run.workers = *w;
            }
            if deadline_minutes.is_some() {
                config.run.deadline_minutes = *deadline_minutes;
            }
            if budget.is_some() {
                config.run.candidate_budget = *budget;
            }
            config.validate()?;
            cmd_run(&cli, &config)
        }
        Command::Refresh => cmd_refresh(&cli, &config),
        Command::Reclassify => cmd_reclassify(&config),
        Command::Report { output } => cmd_report(&config, output.as_deref()),
        Command::ExportDb => cmd_export_db(&config),
        Command::Check { gauge_id, value } => cmd_check(&config, gauge_id, *value),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_run(cli: &Cli, config: &DiscoveryConfig) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let cache = Arc::new(open_cache(config)?);
    let stations = load_stations(config)?;
    let assessor = Arc::new(Assessor::from_config(config, Arc::clone(&stations)));
    let executor = Arc::new(build_executor(cli, config)?);

    let runner = DiscoveryRunner::new(
        executor,
        Arc::clone(&store),
        assessor,
        Arc::clone(&cache),
    )
    .with_workers(config.run.workers)
    .with_queue_capacity(config.run.queue_capacity)
    .with_transient_ttl(config.retry.transient_ttl())
    .with_checkpoint(config.run.checkpoint_path.clone(), config.run.checkpoint_every);

    let mut generator = CandidateGenerator::from_config(&config.generator, Arc::clone(&store));
    let budget = RunBudget::new(config.run.candidate_budget, config.run.deadline());

    let run_report = runner
        .run(&mut generator, &budget, &CancelToken::new())
        .context("Discovery run failed")?;
    cache.save(&config.run.threshold_cache_path)?;

    let registry = report::build_registry(&store, &stations, chrono::Utc::now());
    report::write_json(&registry, &config.run.registry_path)
        .with_context(|| format!("Failed to write {}", config.run.registry_path.display()))?;

    report::log_run_report(&run_report);
    report::print_run_report(&run_report);
    report::print_registry_summary(&registry);
    Ok(())
}

fn cmd_refresh(cli: &Cli, config: &DiscoveryConfig) -> Result<()> {
    let store = open_store(config)?;
    let cache = open_cache(config)?;
    let executor = build_executor(cli, config)?;

    let summary = runner::refresh_thresholds(&executor, &store, &cache);
    store.save(&config.run.checkpoint_path)?;
    cache.save(&config.run.threshold_cache_path)?;

    println!(
        "Refreshed {} gauges: {} changed, {} unchanged, {} without model, {} failed",
        summary.checked, summary.changed, summary.unchanged, summary.without_model, summary.failed
    );
    report_stale(config, &cache);
    Ok(())
}

fn cmd_reclassify(config: &DiscoveryConfig) -> Result<()> {
    let store = open_store(config)?;
    let stations = load_stations(config)?;
    let assessor = Assessor::from_config(config, stations);

    let summary = runner::reclassify_all(&store, &assessor);
    store.save(&config.run.checkpoint_path)?;
    println!(
        "Reclassified {} gauges, {} changed tier or evidence",
        summary.assessed, summary.changed
    );
    Ok(())
}

fn cmd_report(config: &DiscoveryConfig, output: Option<&Path>) -> Result<()> {
    let store = open_store(config)?;
    let stations = load_stations(config)?;
    let path = output.unwrap_or(config.run.registry_path.as_path());

    let registry = report::build_registry(&store, &stations, chrono::Utc::now());
    report::write_json(&registry, path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    report::print_registry_summary(&registry);
    println!("Registry written to {}", path.display());

    report_stale(config, &open_cache(config)?);
    Ok(())
}

fn cmd_export_db(config: &DiscoveryConfig) -> Result<()> {
    let store = open_store(config)?;
    let stations = load_stations(config)?;
    let cache = open_cache(config)?;
    let registry = report::build_registry(&store, &stations, chrono::Utc::now());

    let mut client = db::connect_and_verify(&[db::DISCOVERY_SCHEMA])?;
    let gauges = db::upsert_registry(&mut client, &registry)?;
    let thresholds = db::upsert_thresholds(&mut client, &cache)?;
    println!("Exported {} gauges and {} threshold sets", gauges, thresholds);
    for (tier, count) in db::tier_counts(&mut client)? {
        println!("  {:<18} {:>6}", tier, count);
    }
    Ok(())
}

fn cmd_check(config: &DiscoveryConfig, gauge_id: &str, value: f64) -> Result<()> {
    let store = open_store(config)?;
    let cache = open_cache(config)?;
    if cache.get(gauge_id).is_none() {
        bail!("No cached thresholds for {}", gauge_id);
    }

    let tier = store
        .gauge(gauge_id)
        .and_then(|g| g.assessment)
        .map(|a| a.tier);
    match cache.check(gauge_id, value, tier) {
        Some(alert) => println!("{}", alert.message),
        None => println!("{}: {:.1} is below the warning level", gauge_id, value),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn parse_log_level(level: &str) -> Result<LogLevel> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warning),
        "error" => Ok(LogLevel::Error),
        other => bail!("Unknown log level '{}'", other),
    }
}

fn load_config(path: &Path) -> Result<DiscoveryConfig> {
    if path.exists() {
        return Ok(DiscoveryConfig::load(path)?);
    }
    logging::warn(
        LogSource::System,
        None,
        &format!("{} not found, using built-in defaults", path.display()),
    );
    Ok(DiscoveryConfig::default())
}

fn load_stations(config: &DiscoveryConfig) -> Result<Arc<ReferenceRegistry>> {
    let registry = match &config.run.reference_stations_path {
        Some(path) => ReferenceRegistry::load(path)?,
        None => ReferenceRegistry::builtin(),
    };
    logging::info(
        LogSource::System,
        None,
        &format!("{} reference stations loaded", registry.len()),
    );
    Ok(Arc::new(registry))
}

fn open_store(config: &DiscoveryConfig) -> Result<DiscoveryStore> {
    DiscoveryStore::open(&config.run.checkpoint_path).with_context(|| {
        format!(
            "Cannot resume from {}; move it aside to start a fresh run",
            config.run.checkpoint_path.display()
        )
    })
}

fn open_cache(config: &DiscoveryConfig) -> Result<ThresholdCache> {
    Ok(ThresholdCache::load(&config.run.threshold_cache_path)?)
}

fn build_api(cli: &Cli, config: &DiscoveryConfig) -> Result<Arc<dyn LookupApi>> {
    if let Some(path) = &cli.replay {
        let replay = ReplayApi::from_file(path)
            .map_err(|e| anyhow!("Failed to load replay file {}: {}", path.display(), e))?;
        logging::info(
            LogSource::System,
            None,
            &format!("Replaying {} recorded gauges from {}", replay.known_gauges(), path.display()),
        );
        return Ok(Arc::new(replay));
    }

    let key = config::api_key_from_env()
        .context("FLOOD_HUB_API_KEY is not set (add it to .env or pass --replay)")?;
    Ok(Arc::new(FloodHubClient::new(&config.api, key)?))
}

fn build_executor(cli: &Cli, config: &DiscoveryConfig) -> Result<ProbeExecutor> {
    Ok(ProbeExecutor::new(
        build_api(cli, config)?,
        Arc::new(RateLimiter::from_config(&config.rate_limit)),
        RetryPolicy::from_config(&config.retry),
    ))
}

fn report_stale(config: &DiscoveryConfig, cache: &ThresholdCache) {
    let max_age = chrono::Duration::hours(config.run.threshold_max_age_hours as i64);
    let stale = stale_entries(cache, max_age);
    if !stale.is_empty() {
        println!(
            "{} of {} cached threshold sets are older than {}h; run `refresh`",
            stale.len(),
            cache.len(),
            config.run.threshold_max_age_hours
        );
    }
}
