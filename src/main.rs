//! Signal mirroring engine
//!
//! Turns free-text trade alerts into risk-bounded, multi-target trades on a
//! primary terminal and replicates every trade decision to follower terminals.

mod api;
mod config;
mod db;
mod engine;
mod error;
mod models;
mod replication;
mod signal;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{
    AccountProvider, BlackoutProvider, FanoutNotifier, FixedEquity, LogNotifier, NewsCalendar,
    NoBlackout, NotificationSink, PaperVenue, WebhookNotifier,
};
use crate::config::Settings;
use crate::db::{Database, MemoryRepository, Repository, PRIMARY};
use crate::engine::{Engine, EngineDeps, FollowerRunner, Inbound};
use crate::models::{RawMessage, Tick};
use crate::signal::Interpreter;

/// Signal mirroring CLI.
#[derive(Parser)]
#[command(name = "signalmirror")]
#[command(about = "Copy free-text trade signals to a primary terminal and its followers", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./signalmirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// TOML settings file
    #[arg(short, long, env = "SIGNALMIRROR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a candidate signal from text without trading it
    Parse {
        /// Message text (read from stdin when omitted)
        text: Option<String>,
    },

    /// Run the engine against paper terminals
    Run {
        /// Starting balance of the paper terminals
        #[arg(short, long, default_value = "10000")]
        equity: Decimal,

        /// Size trades from this equity instead of the paper balance
        #[arg(long)]
        fixed_equity: Option<Decimal>,

        /// Requote paper fills further than this from the signal entry
        #[arg(long)]
        max_deviation: Option<Decimal>,

        /// JSON-lines input of messages and ticks (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Keep state in memory instead of the database
        #[arg(long)]
        memory: bool,

        /// Stop once the input is exhausted and no signal is pending
        #[arg(long)]
        exit_on_eof: bool,
    },

    /// Show the effective configuration
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Show replication offsets, intents and today's risk counters
    Status,

    /// List replication events
    Events {
        /// Only events after this id
        #[arg(short, long, default_value = "0")]
        after: u64,

        /// Maximum number of events
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::load(cli.config.as_deref())?;
    settings.validate()?;

    match cli.command {
        Commands::Parse { text } => {
            let text = match text {
                Some(text) => text,
                None => read_stdin().await?,
            };
            parse(&settings, &text);
        }

        Commands::Run {
            equity,
            fixed_equity,
            max_deviation,
            input,
            memory,
            exit_on_eof,
        } => {
            let repo: Arc<dyn Repository> = if memory {
                Arc::new(MemoryRepository::new())
            } else {
                Arc::new(Database::new(&cli.database).await?)
            };
            let paper = PaperOptions {
                equity,
                fixed_equity,
                max_deviation,
            };
            run(settings, repo, paper, input, exit_on_eof).await?;
        }

        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                println!("{}", toml::to_string_pretty(&settings)?);
            }
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            status(&settings, &db).await?;
        }

        Commands::Events { after, limit } => {
            let db = Database::new(&cli.database).await?;
            let events = db.load_events().await?;
            for event in events.iter().filter(|e| e.id > after).take(limit) {
                println!("{}", event);
            }
        }
    }

    Ok(())
}

async fn read_stdin() -> Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut text = Vec::new();
    while let Some(line) = lines.next_line().await? {
        text.push(line);
    }
    Ok(text.join("\n"))
}

fn parse(settings: &Settings, text: &str) {
    let interpreter = Interpreter::new(settings.interpreter.clone());
    let now = Utc::now();
    let message = RawMessage::new(0, 0, 0, text, now);

    let Some(candidate) = interpreter.interpret(&message, now) else {
        println!("No signal found");
        return;
    };
    let quiet = chrono::Duration::seconds(settings.interpreter.quiet_window_secs + 1);
    let outcome = interpreter.sweep(now + quiet);

    let (candidate, verdict) = if let Some(c) = outcome.completed.into_iter().next() {
        (c, "complete")
    } else if let Some(c) = outcome.discarded.into_iter().next() {
        (c, "below confidence floor")
    } else {
        (candidate, "incomplete")
    };

    println!("\n=== Candidate Signal ===\n");
    println!("Signal:      {}", candidate.summary());
    println!("Pass:        {:?}", candidate.pass);
    println!("Confidence:  {:.2}", candidate.confidence);
    if let Some(note) = &candidate.risk_note {
        println!("Risk note:   {}", note);
    }
    println!("Outcome:     {}", verdict);
}

/// How the paper terminals behave in `run`.
struct PaperOptions {
    equity: Decimal,
    fixed_equity: Option<Decimal>,
    max_deviation: Option<Decimal>,
}

impl PaperOptions {
    fn venue(&self, name: &str, settings: &Settings) -> Arc<PaperVenue> {
        let venue = PaperVenue::new(name, settings.instruments.clone()).with_balance(self.equity);
        venue.set_max_deviation(self.max_deviation);
        Arc::new(venue)
    }
}

async fn run(
    settings: Settings,
    repo: Arc<dyn Repository>,
    paper: PaperOptions,
    input: Option<PathBuf>,
    exit_on_eof: bool,
) -> Result<()> {
    let primary = paper.venue(PRIMARY, &settings);
    let account: Arc<dyn AccountProvider> = match paper.fixed_equity {
        Some(equity) => Arc::new(FixedEquity(equity)),
        None => primary.clone(),
    };

    let blackout: Arc<dyn BlackoutProvider> = match &settings.news_calendar {
        Some(path) => Arc::new(NewsCalendar::load(
            std::path::Path::new(path),
            settings.risk.blackout_pre_secs,
            settings.risk.blackout_post_secs,
        )?),
        None => Arc::new(NoBlackout),
    };

    let mut fanout = FanoutNotifier::new(vec![Arc::new(LogNotifier)]);
    if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
        fanout.push(Arc::new(WebhookNotifier::new(url)?));
    }
    let notifier: Arc<dyn NotificationSink> = Arc::new(fanout);

    let deps = EngineDeps {
        venue: primary.clone(),
        account,
        blackout,
        repo: repo.clone(),
        notifier: notifier.clone(),
    };
    let engine = Arc::new(Engine::restore(&settings, deps, Utc::now()).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut venues = vec![primary.clone()];
    let mut followers = Vec::new();
    for config in &settings.followers {
        let venue = paper.venue(&config.id, &settings);
        venues.push(venue.clone());
        let runner = FollowerRunner::restore(
            config,
            &settings,
            venue,
            repo.clone(),
            notifier.clone(),
            engine.bus().clone(),
        )
        .await?;
        followers.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    println!("\n=== Signal Mirror ===");
    println!("Equity:          {}", paper.equity);
    if let Some(fixed) = paper.fixed_equity {
        println!("Sizing equity:   {}", fixed);
    }
    println!("Followers:       {}", settings.followers.len());
    println!("Replication head: {}", engine.bus().head());
    println!("\nPress Ctrl+C to stop.\n");

    let (tx, rx) = mpsc::channel(1024);
    let feeder = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            tokio::spawn(feed(file, tx, venues))
        }
        None => tokio::spawn(feed(tokio::io::stdin(), tx, venues)),
    };

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    if let Err(e) = engine.clone().run(rx, shutdown_rx, exit_on_eof).await {
        error!(error = %e, "Engine error");
    }
    feeder.abort();

    // let followers catch up before stopping them
    let bus = engine.bus().clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while settings.followers.iter().any(|f| bus.acked(&f.id) < bus.head())
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = shutdown_tx.send(true);

    for task in followers {
        match task.await {
            Ok(follower) => println!("\n--- Follower {} ---\n{}", follower.id(), follower.stats()),
            Err(e) => error!(error = %e, "Follower task failed"),
        }
    }

    println!("\n=== Engine ===\n{}", engine.stats());
    Ok(())
}

/// Forward JSON lines to the engine. Ticks also move the paper quotes.
async fn feed<R>(reader: R, tx: mpsc::Sender<Inbound>, venues: Vec<Arc<PaperVenue>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_no = 0u64;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let item: Inbound = match serde_json::from_str(&line) {
            Ok(item) => item,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed input line");
                continue;
            }
        };
        if let Inbound::Tick { symbol, bid, ask, time } = &item {
            for venue in &venues {
                venue.set_tick(symbol, Tick::new(*bid, *ask, *time));
            }
        }
        if tx.send(item).await.is_err() {
            break;
        }
    }
    info!(lines = line_no, "Input finished");
}

async fn status(settings: &Settings, db: &Database) -> Result<()> {
    let events = db.load_events().await?;
    let head = events.last().map(|e| e.id).unwrap_or(0);

    println!("\n=== Replication ===\n");
    println!("Head:            {}", head);
    for (follower, acked) in db.load_offsets().await? {
        println!("  {:<20} acked {:>6} (behind {})", follower, acked, head.saturating_sub(acked));
    }

    let rows = db.intent_rows().await?;
    let mut owners = vec![PRIMARY.to_string()];
    owners.extend(settings.followers.iter().map(|f| f.id.clone()));
    for row in &rows {
        if !owners.contains(&row.owner) {
            owners.push(row.owner.clone());
        }
    }
    for owner in owners {
        let owned: Vec<_> = rows.iter().filter(|r| r.owner == owner).collect();
        println!("\n=== Intents: {} ({}) ===\n", owner, owned.len());
        for row in owned {
            println!("  {:<38} {:<8} {:<10} {}", row.id, row.symbol, row.status, row.updated_at);
        }
    }

    println!("\n=== Daily Risk ===\n");
    match db.load_daily_risk(Utc::now().date_naive()).await? {
        Some(daily) => {
            println!("Date:               {}", daily.date);
            println!("Realized loss:      {}", daily.realized_loss);
            println!("Consecutive losses: {}", daily.consecutive_losses);
            println!("Trades opened:      {}", daily.trade_count);
            if let Some(until) = daily.cooldown_until {
                println!("Cooldown until:     {}", until);
            }
        }
        None => println!("No trades today"),
    }
    Ok(())
}
