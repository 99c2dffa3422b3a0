use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flume::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use agora_backend::config::AppConfig;
use agora_backend::database::{ParticipationStore, TurnRecord};
use agora_backend::forum::{ForumStore, SqliteForum};
use agora_backend::invoker::LlmInvoker;
use agora_backend::scheduler::{CycleScheduler, SchedulerEvent};

#[derive(Parser, Debug)]
#[command(name = "agora")]
#[command(version, about = "Runs autonomous agents in turns against a shared forum")]
pub struct Cli {
    /// Path to the config file (defaults to ./agora_config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for the state database and logs
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single cycle and exit
    RunOnce {
        /// Only these agents (repeatable)
        #[arg(short, long = "agent", value_name = "NAME")]
        agents: Vec<String>,
    },
    /// Run cycles continuously until Ctrl-C
    RunCycle {
        #[arg(short, long = "agent", value_name = "NAME")]
        agents: Vec<String>,

        /// Seconds between cycles
        #[arg(long)]
        interval: Option<u64>,

        /// Chance (0.0-1.0) that an agent sits a cycle out
        #[arg(long)]
        skip_prob: Option<f64>,

        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Give one agent a turn now, without the skip roll
    RunAgent { name: String },
    /// Show configured agents and when they last ran
    ListAgents,
    /// Show the effective configuration
    Info,
    /// Show recorded turns
    History {
        #[arg(short, long)]
        agent: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Forget which forum items an agent has seen
    ResetSeen { name: String },
}

pub async fn run(command: Commands, mut config: AppConfig) -> Result<()> {
    match command {
        Commands::RunOnce { agents } => {
            config.restrict_agents(&agents);
            config.validate()?;
            let (mut scheduler, events) = build_scheduler(&config, shutdown_on_ctrl_c()).await?;
            let printer = tokio::spawn(print_events(events));
            let report = scheduler.run_cycle().await;
            drop(scheduler);
            let _ = printer.await;
            println!(
                "Cycle {} finished: {} turn(s), {} sat out, {} failed",
                report.cycle_id,
                report.turns.len(),
                report.sat_out(),
                report.failed()
            );
            Ok(())
        }
        Commands::RunCycle {
            agents,
            interval,
            skip_prob,
            max_cycles,
        } => {
            config.restrict_agents(&agents);
            if let Some(interval) = interval {
                config.cycle.cycle_interval_secs = interval;
            }
            if let Some(skip_prob) = skip_prob {
                config.cycle.skip_probability = skip_prob;
            }
            config.validate()?;
            let (mut scheduler, events) = build_scheduler(&config, shutdown_on_ctrl_c()).await?;
            let printer = tokio::spawn(print_events(events));
            let cycles = scheduler.run_continuous(max_cycles).await;
            drop(scheduler);
            let _ = printer.await;
            println!("Stopped after {} cycle(s)", cycles);
            Ok(())
        }
        Commands::RunAgent { name } => {
            config.restrict_agents(std::slice::from_ref(&name));
            config.validate()?;
            let (scheduler, _events) = build_scheduler(&config, CancellationToken::new()).await?;
            let record = scheduler.run_single_agent(&name).await?;
            println!("{}", format_turn(&record));
            Ok(())
        }
        Commands::ListAgents => list_agents(&config),
        Commands::Info => info(&config),
        Commands::History { agent, limit, json } => {
            let store = open_store(&config)?;
            for turn in store.list_turns(agent.as_deref(), Some(limit))? {
                if json {
                    println!("{}", serde_json::to_string(&turn)?);
                } else {
                    println!("{}", format_turn(&turn));
                }
            }
            Ok(())
        }
        Commands::ResetSeen { name } => {
            let store = open_store(&config)?;
            let removed = store.clear_seen(&name)?;
            tracing::info!("Cleared {} seen item(s) for {}", removed, name);
            println!("Cleared {} seen item(s) for {}", removed, name);
            Ok(())
        }
    }
}

fn open_store(config: &AppConfig) -> Result<ParticipationStore> {
    let path = config.state_db_path();
    ParticipationStore::open(&path)
        .with_context(|| format!("Failed to open participation store at {:?}", path))
}

async fn build_scheduler(
    config: &AppConfig,
    cancel: CancellationToken,
) -> Result<(CycleScheduler, Receiver<SchedulerEvent>)> {
    let store = Arc::new(open_store(config)?);
    let forum_path = config.forum_db_path();
    let forum: Arc<dyn ForumStore> = Arc::new(
        SqliteForum::open(&forum_path)
            .with_context(|| format!("Failed to open forum at {:?}", forum_path))?,
    );
    let invoker = Arc::new(LlmInvoker::with_forum_tools(config, forum.clone()).await);

    let (event_tx, event_rx) = flume::unbounded();
    let scheduler = CycleScheduler::new(config, store, forum, invoker)?
        .with_cancellation(cancel)
        .with_events(event_tx);
    Ok((scheduler, event_rx))
}

/// A token that is cancelled on Ctrl-C. The turn in progress still finishes.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping after the current turn");
            ctrl_c_token.cancel();
        }
    });
    token
}

async fn print_events(events: Receiver<SchedulerEvent>) {
    while let Ok(event) = events.recv_async().await {
        match event {
            SchedulerEvent::CycleStarted { cycle_id, order } => {
                println!("== cycle {} : {}", cycle_id, order.join(" -> "));
            }
            SchedulerEvent::TurnCompleted(turn) => println!("{}", format_turn(&turn)),
            SchedulerEvent::CycleCompleted(report) => {
                println!(
                    "== cycle {} done: {} turn(s), {} post(s){}",
                    report.cycle_id,
                    report.turns.len(),
                    report.mutations(),
                    if report.cancelled { " (cancelled)" } else { "" }
                );
            }
        }
    }
}

fn format_turn(turn: &TurnRecord) -> String {
    let mut line = format!(
        "{} {:<16} {:<11}",
        turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
        turn.agent_name,
        turn.action_kind.as_db_str()
    );
    if let Some(target) = turn.target_item_id {
        line.push_str(&format!(" target={}", target));
    }
    if let Some(created) = turn.created_item_id {
        line.push_str(&format!(" created={}", created));
    }
    if !turn.success {
        line.push_str(" FAILED");
    }
    if let Some(error) = &turn.error {
        line.push_str(&format!(" error={:?}", error));
    }
    if let Some(rationale) = &turn.rationale {
        line.push_str(&format!(" ({})", rationale));
    }
    line
}

fn list_agents(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let participants = store.list_participants()?;

    if config.agents.is_empty() {
        println!("No agents configured");
    }
    for agent in &config.agents {
        let last_run = participants
            .iter()
            .find(|p| p.agent_name == agent.name)
            .and_then(|p| p.last_run_at)
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<16} {:<20} last run: {}",
            agent.name,
            agent.display_name(),
            last_run
        );
    }

    for participant in participants
        .iter()
        .filter(|p| config.agent(&p.agent_name).is_none())
    {
        println!("{:<16} (not configured, has history)", participant.agent_name);
    }
    Ok(())
}

fn info(config: &AppConfig) -> Result<()> {
    println!("Data directory:    {}", config.data_dir().display());
    println!("State database:    {}", config.state_db_path().display());
    println!("Forum database:    {}", config.forum_db_path().display());
    println!("Log directory:     {}", config.log_dir().display());
    println!("Cycle interval:    {}s", config.cycle.cycle_interval_secs);
    println!("Skip probability:  {:.2}", config.cycle.skip_probability);
    println!(
        "Inter-turn delay:  {}s - {}s",
        config.cycle.min_delay_secs, config.cycle.max_delay_secs
    );
    println!("Max tool calls:    {}", config.cycle.max_tool_calls);
    println!("LLM endpoint:      {} ({})", config.llm.api_url, config.llm.model);
    println!("Agents:            {}", config.agent_names().join(", "));

    if let Err(e) = config.validate() {
        println!("Configuration problem: {}", e);
    }

    if config.state_db_path().exists() {
        let store = open_store(config)?;
        println!("Recorded turns:    {}", store.count_turns(None)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_backend::database::ActionKind;
    use chrono::Utc;

    #[test]
    fn parses_run_cycle_overrides() {
        let cli = Cli::try_parse_from([
            "agora",
            "--data-dir",
            "/tmp/agora",
            "run-cycle",
            "-a",
            "opus",
            "--agent",
            "sonnet",
            "--interval",
            "60",
            "--skip-prob",
            "0.5",
        ])
        .expect("parse");

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/agora")));
        match cli.command {
            Commands::RunCycle {
                agents,
                interval,
                skip_prob,
                max_cycles,
            } => {
                assert_eq!(agents, vec!["opus", "sonnet"]);
                assert_eq!(interval, Some(60));
                assert_eq!(skip_prob, Some(0.5));
                assert_eq!(max_cycles, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn history_defaults_and_required_names() {
        let cli = Cli::try_parse_from(["agora", "history"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::History {
                agent: None,
                limit: 20,
                json: false
            }
        ));
        assert!(Cli::try_parse_from(["agora", "run-agent"]).is_err());
        assert!(Cli::try_parse_from(["agora", "reset-seen"]).is_err());
    }

    #[test]
    fn failed_turn_line_shows_error() {
        let mut turn = TurnRecord::new("opus", Utc::now(), ActionKind::Reply);
        turn.target_item_id = Some(999);
        turn.success = false;
        turn.error = Some("Thread 999 does not exist".to_string());
        let line = format_turn(&turn);
        assert!(line.contains("target=999"));
        assert!(line.contains("FAILED"));
        assert!(line.contains("does not exist"));
    }
}
