use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bdbot_core::{CancelHandle, RunContext, UserSelector};
use bdbot_match::{ChatMessage, CompletionClient, LlmMatcher, OpenAiCompatClient};
use bdbot_storage::{
    connect, migrate, server_version, HttpFetcher, PgMatchStore, PgSolicitationStore,
    PgUserDirectory,
};
use bdbot_sync::{
    clear_matches, run_ingest, AppConfig, IngestSummary, MatchRunner, MatchSummary, RunError,
    ScrapeEngine, DEFAULT_CONFIG_PATH,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bdbot")]
#[command(about = "Solicitation ingest and narrative matching")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the scraper bot
    Scraper {
        #[command(subcommand)]
        command: ScraperCommand,
    },
    /// Run AI matching for a user
    Match(MatchArgs),
    /// Apply the embedded database migrations
    Migrate,
    /// Inspect configuration and connectivity
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ScraperCommand {
    /// Trigger an immediate scraper run
    RunNow {
        /// Upper bound for the whole run, overriding `scrape_timeout_secs`.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Args)]
struct MatchArgs {
    #[command(subcommand)]
    command: Option<MatchCommand>,
    /// User email
    #[arg(short, long, global = true)]
    email: Option<String>,
    /// User id
    #[arg(short, long, global = true)]
    id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum MatchCommand {
    /// Score every stored solicitation (default)
    Run,
    /// Clear all matches for a user
    Clear,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write a new configuration file
    Init {
        /// Write the defaults without asking for values
        #[arg(long)]
        silent: bool,
    },
    /// Check database and LLM connectivity
    Check {
        /// Prompt sent to the LLM
        #[arg(short, long, default_value = DEFAULT_CHECK_PROMPT)]
        prompt: String,
    },
}

const DEFAULT_CHECK_PROMPT: &str = "Reply with the single word: pong";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Config {
        command: ConfigCommand::Init { silent },
    } = &cli.command
    {
        init_tracing(None)?;
        return config_init(&cli.config, *silent);
    }

    let loaded = AppConfig::load(&cli.config);
    init_tracing(loaded.as_ref().ok())?;
    let config = loaded.with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Scraper {
            command: ScraperCommand::RunNow { timeout_secs },
        } => scraper_run_now(&config, timeout_secs).await,
        Commands::Match(args) => {
            let selector = UserSelector::from_flags(args.email, args.id);
            match args.command.unwrap_or(MatchCommand::Run) {
                MatchCommand::Run => match_run(&config, &selector).await,
                MatchCommand::Clear => match_clear(&config, &selector).await,
            }
        }
        Commands::Migrate => {
            let pool = connect(config.database_url()?).await.context("connecting to database")?;
            migrate(&pool).await.context("applying migrations")?;
            println!("Migrations applied.");
            Ok(())
        }
        Commands::Config {
            command: ConfigCommand::Check { prompt },
        } => config_check(&cli.config, &config, &prompt).await,
        Commands::Config {
            command: ConfigCommand::Init { .. },
        } => Ok(()),
    }
}

fn init_tracing(config: Option<&AppConfig>) -> Result<()> {
    let level = config.map(|c| c.log_level.as_str()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.and_then(|c| c.log_path.as_ref()) {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Cancel `handle` on Ctrl-C; the run then winds down like it hit its deadline.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });
}

async fn scraper_run_now(config: &AppConfig, timeout_secs: Option<u64>) -> Result<()> {
    let pool = connect(config.database_url()?).await.context("connecting to database")?;
    let store = PgSolicitationStore::new(pool);

    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let registry = config.load_sources()?;
    let engine = ScrapeEngine::from_registry(&registry, http)
        .map_err(RunError::from)?
        .with_concurrency(config.source_concurrency);
    if engine.is_empty() {
        warn!(registry = %config.sources_path.display(), "no enabled sources");
    }

    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.scrape_timeout());
    let (ctx, cancel) = RunContext::with_timeout(timeout);
    cancel_on_ctrl_c(cancel);

    info!(run_id = %ctx.run_id(), timeout_secs = timeout.as_secs(), "launching scraper (manual trigger)");
    let summary = run_ingest(&engine, &store, &ctx, config.persist_timeout()).await;
    print_ingest(&summary);

    match summary.aborted {
        Some(reason) => Err(RunError::Aborted(reason).into()),
        None => Ok(()),
    }
}

fn print_ingest(summary: &IngestSummary) {
    println!(
        "Scraper run complete. Found {}, Saved/Updated {}.",
        summary.found, summary.saved
    );
    if summary.failed > 0 || summary.skipped > 0 {
        println!("  failed upserts: {}, not attempted: {}", summary.failed, summary.skipped);
    }
    if summary.item_errors > 0 {
        println!("  listings skipped by sources: {}", summary.item_errors);
    }
    for failure in &summary.source_failures {
        println!("  source {} failed: {}", failure.source, failure.reason);
    }
    if let Some(reason) = &summary.aborted {
        println!("  ABORTED: {reason}");
    }
    if let Some(reason) = &summary.interrupted {
        println!("  INTERRUPTED: {reason}");
    }
}

async fn match_run(config: &AppConfig, selector: &UserSelector) -> Result<()> {
    let llm = config.llm_settings()?;
    let pool = connect(config.database_url()?).await.context("connecting to database")?;
    let client = OpenAiCompatClient::new(llm).context("building llm client")?;

    let runner = MatchRunner {
        users: Arc::new(PgUserDirectory::new(pool.clone())),
        solicitations: Arc::new(PgSolicitationStore::new(pool.clone())),
        matches: Arc::new(PgMatchStore::new(pool)),
        matcher: Arc::new(LlmMatcher::new(client, config.llm_timeout())),
        concurrency: config.match_concurrency,
    };

    let (ctx, cancel) = RunContext::with_timeout(config.match_timeout());
    cancel_on_ctrl_c(cancel);

    let summary = match runner.run(&ctx, selector).await {
        Ok(summary) => summary,
        Err(RunError::EmptyNarrative { user_id }) => {
            warn!(user_id, "user has no narrative defined");
            println!("User {user_id} has no narrative defined; nothing to match.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    print_match(&summary);

    match summary.aborted {
        Some(reason) => Err(RunError::Aborted(reason).into()),
        None => Ok(()),
    }
}

fn print_match(summary: &MatchSummary) {
    println!(
        "Matching complete for {} (ID: {}). Scored {} of {} solicitations.",
        summary.user_email, summary.user_id, summary.matched, summary.solicitations
    );
    if summary.failed() > 0 {
        println!(
            "  failures: protocol {}, transport {}, store {}",
            summary.protocol_failures, summary.transport_failures, summary.store_failures
        );
    }
    if summary.skipped > 0 {
        println!("  not evaluated: {}", summary.skipped);
    }
    if let Some(reason) = &summary.aborted {
        println!("  ABORTED: {reason}");
    }
}

async fn match_clear(config: &AppConfig, selector: &UserSelector) -> Result<()> {
    let pool = connect(config.database_url()?).await.context("connecting to database")?;
    let users = PgUserDirectory::new(pool.clone());
    let matches = PgMatchStore::new(pool);

    let cleared = clear_matches(&users, &matches, selector).await?;
    println!(
        "Cleared {} matches for user: {} (ID: {})",
        cleared.removed, cleared.user_email, cleared.user_id
    );
    Ok(())
}

fn config_init(path: &Path, silent: bool) -> Result<()> {
    let mut config = AppConfig::default();
    if !silent {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        config.database_url = ask(&mut input, "Database URL (PostgreSQL connection string)", config.database_url)?;
        config.llm_url = ask(&mut input, "LLM API URL (OpenAI-compatible endpoint)", config.llm_url)?;
        config.llm_key = ask(&mut input, "LLM API key", config.llm_key)?;
        config.llm_model = ask(&mut input, "LLM model", config.llm_model)?;
        config.log_path = ask(&mut input, "Log file path", config.log_path.map(|p| p.display().to_string()))?
            .map(PathBuf::from);
        if let Some(level) = ask(&mut input, "Log level", Some(config.log_level.clone()))? {
            config.log_level = level;
        }
        config.validate()?;
    }
    config.write_new(path)?;
    if !silent {
        println!("Configuration saved to {}", path.display());
    }
    Ok(())
}

/// One line from `input`; blank keeps `current`.
fn ask(input: &mut impl BufRead, label: &str, current: Option<String>) -> Result<Option<String>> {
    match &current {
        Some(value) => print!("{label} [{value}]: "),
        None => print!("{label}: "),
    }
    io::stdout().flush()?;
    let mut line = String::new();
    input.read_line(&mut line).context("reading answer")?;
    let answer = line.trim();
    Ok(if answer.is_empty() {
        current
    } else {
        Some(answer.to_string())
    })
}

async fn config_check(path: &Path, config: &AppConfig, prompt: &str) -> Result<()> {
    println!("Config: {}", path.display());
    println!("Sources: {}", config.sources_path.display());
    let mut healthy = true;

    match config.database_url() {
        Ok(url) => match connect(url).await {
            Ok(pool) => match server_version(&pool).await {
                Ok(version) => println!("Database: ok ({version})"),
                Err(err) => {
                    healthy = false;
                    println!("Database: FAILED ({err})");
                }
            },
            Err(err) => {
                healthy = false;
                println!("Database: FAILED ({err})");
            }
        },
        Err(err) => {
            healthy = false;
            println!("Database: FAILED ({err})");
        }
    }

    match config.llm_settings() {
        Ok(settings) => {
            let model = settings.model.clone();
            let client = OpenAiCompatClient::new(settings).context("building llm client")?;
            let (ctx, _cancel) = RunContext::with_timeout(config.llm_timeout());
            let ping = [ChatMessage::user(prompt)];
            match client.complete(&ctx, &ping).await {
                Ok(reply) => {
                    let reply = reply.trim().chars().take(80).collect::<String>();
                    println!("LLM: ok ({model} at {}: {reply})", client.endpoint());
                }
                Err(err) => {
                    healthy = false;
                    println!("LLM: FAILED ({err})");
                }
            }
        }
        Err(err) => {
            healthy = false;
            println!("LLM: FAILED ({err})");
        }
    }

    match config.load_sources() {
        Ok(registry) => {
            let enabled = registry.enabled().map(|s| s.name.as_str()).collect::<Vec<_>>();
            println!("Enabled sources: {}", enabled.join(", "));
        }
        Err(err) => {
            healthy = false;
            println!("Sources: FAILED ({err})");
        }
    }

    if healthy {
        Ok(())
    } else {
        Err(RunError::Setup("one or more connectivity checks failed".into()).into())
    }
}
