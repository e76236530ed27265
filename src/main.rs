//! # AgentDeck Scheduler host
//!
//! Runs the cron trigger scheduler against the local SQLite store and offers
//! a few operator commands for inspecting and managing triggers.
//!
//! Usage:
//!   agentdeck-scheduler run                          # Tick until Ctrl-C
//!   agentdeck-scheduler tick                         # One evaluation pass
//!   agentdeck-scheduler check "*/5 * * * *"          # Does it match now?
//!   agentdeck-scheduler add-trigger --agent a1 --workspace ws1 \
//!       --cron "0 9 * * 1-5" --title "Standup {{date}}"
//!   agentdeck-scheduler history <trigger-id>

use std::path::PathBuf;
use std::sync::Arc;

use agentdeck_core::DeckConfig;
use agentdeck_scheduler::{
    Clock, SqliteStore, SystemClock, TickOutcome, Trigger, TriggerScheduler, cron_matches_date,
    spawn_scheduler, validate_expression,
};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "agentdeck-scheduler",
    version,
    about = "AgentDeck trigger scheduler"
)]
struct Cli {
    /// Config file (default: ~/.agentdeck/scheduler.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides [store] db_path
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate triggers on every tick until interrupted
    Run,
    /// Run a single evaluation pass and print the summary
    Tick,
    /// Check whether a cron expression matches a time
    Check {
        expression: String,
        /// RFC 3339 timestamp (default: now, local time)
        #[arg(long)]
        at: Option<String>,
    },
    /// Create an enabled cron trigger
    AddTrigger {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List all triggers
    List,
    /// Enable a trigger
    Enable { trigger_id: String },
    /// Disable a trigger
    Disable { trigger_id: String },
    /// Delete a trigger (its work items and history are kept)
    Delete { trigger_id: String },
    /// Show recent firings of a trigger, newest first
    History {
        trigger_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent work items of a workspace
    WorkItems {
        workspace: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<DeckConfig> {
    let mut config = match &cli.config {
        Some(path) => DeckConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DeckConfig::load().context("loading default config")?,
    };
    if let Some(db_path) = &cli.db_path {
        config.store.db_path = db_path.clone();
    }
    if cli.verbose {
        config.log.verbose = true;
    }
    Ok(config)
}

fn open_store(config: &DeckConfig) -> Result<Arc<SqliteStore>> {
    let path = config.store.resolved_db_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening trigger store at {}", path.display()))?;
    tracing::debug!("Trigger store: {}", path.display());
    Ok(Arc::new(store))
}

fn scheduler_for(config: &DeckConfig, store: Arc<SqliteStore>) -> TriggerScheduler {
    TriggerScheduler::new(store).with_store_timeout(config.scheduler.store_timeout())
}

fn parse_at(at: Option<&str>) -> Result<DateTime<FixedOffset>> {
    match at {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("'{s}' is not an RFC 3339 timestamp")),
        None => Ok(SystemClock.now()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.filter_directive())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::Run => {
            let store = open_store(&config)?;
            let scheduler = Arc::new(scheduler_for(&config, store));
            let every = config.scheduler.tick_interval();
            spawn_scheduler(scheduler, every, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {e}");
                }
            })
            .await;
            tracing::info!("👋 Scheduler stopped");
        }
        Command::Tick => {
            let store = open_store(&config)?;
            match scheduler_for(&config, store).evaluate_triggers().await {
                TickOutcome::Completed(summary) => println!(
                    "candidates={} due={} fired={} failed={}",
                    summary.candidates, summary.due, summary.fired, summary.failed
                ),
                TickOutcome::FetchFailed => anyhow::bail!("could not fetch triggers"),
                TickOutcome::Busy => println!("evaluation already in progress"),
            }
        }
        Command::Check { expression, at } => {
            validate_expression(&expression)?;
            let at = parse_at(at.as_deref())?;
            let verdict = if cron_matches_date(&expression, &at) {
                "matches"
            } else {
                "does not match"
            };
            println!("'{expression}' {verdict} {}", at.to_rfc3339());
        }
        Command::AddTrigger {
            agent,
            workspace,
            cron,
            title,
            description,
        } => {
            validate_expression(&cron)?;
            let store = open_store(&config)?;
            let trigger = Trigger::cron(&agent, &workspace, &cron, &title, &description);
            store.create_trigger(&trigger)?;
            tracing::info!(trigger_id = %trigger.id, "Trigger created");
            println!("{}", trigger.id);
        }
        Command::List => {
            let store = open_store(&config)?;
            for t in store.list_triggers()? {
                println!(
                    "{}  {:<7} {:<8} {:<16} agent={} workspace={} last_fired={}",
                    t.id,
                    t.trigger_type.as_str(),
                    if t.enabled { "enabled" } else { "disabled" },
                    t.cron_expression.as_deref().unwrap_or("-"),
                    t.agent_id,
                    t.workspace_id,
                    t.last_fired_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                );
            }
        }
        Command::Enable { trigger_id } => {
            open_store(&config)?.set_trigger_enabled(&trigger_id, true)?;
            println!("enabled {trigger_id}");
        }
        Command::Disable { trigger_id } => {
            open_store(&config)?.set_trigger_enabled(&trigger_id, false)?;
            println!("disabled {trigger_id}");
        }
        Command::Delete { trigger_id } => {
            open_store(&config)?.delete_trigger(&trigger_id)?;
            tracing::info!(trigger_id = %trigger_id, "Trigger deleted");
            println!("deleted {trigger_id}");
        }
        Command::History {
            trigger_id,
            limit,
            json,
        } => {
            let store = open_store(&config)?;
            let entries = store.recent_firings(&trigger_id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in entries {
                    println!(
                        "{}  {:<6} {}",
                        e.created_at.to_rfc3339(),
                        e.status.as_str(),
                        e.work_item_id.or(e.error).unwrap_or_default(),
                    );
                }
            }
        }
        Command::WorkItems { workspace, limit } => {
            let store = open_store(&config)?;
            for w in store.list_work_items(&workspace, limit)? {
                println!(
                    "{}  {:<11} {}  {}",
                    w.id,
                    w.status.as_str(),
                    w.scheduled_at.to_rfc3339(),
                    w.title
                );
            }
        }
    }

    Ok(())
}
