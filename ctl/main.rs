#![forbid(unsafe_code)]

//! `session-monitor-ctl`: operator CLI for `session-monitor`.
//!
//! Talks to the daemon's HTTP API. Every command prints JSON except
//! `watch`, which renders a live session table until interrupted.

use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};

use session_monitor::client::view::SessionView;
use session_monitor::client::{HttpApi, MonitorApi};
use session_monitor::config::MonitoringConfigPatch;
use session_monitor::models::control::SessionControlRequest;
use session_monitor::models::session::ControlAction;
use session_monitor::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "session-monitor-ctl",
    about = "Operator CLI for the session-monitor daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the daemon's HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show whether a project is monitored.
    Status {
        /// Project ID.
        project: String,
    },

    /// Print a project's latest snapshot.
    Show {
        /// Project ID.
        project: String,
    },

    /// Print the latest update for one session.
    Session {
        /// Project ID.
        project: String,
        /// Session ID.
        session: String,
    },

    /// Start monitoring a project.
    Start {
        /// Project ID.
        project: String,
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Stop monitoring a project.
    Stop {
        /// Project ID.
        project: String,
    },

    /// Update a running monitor's config.
    Config {
        /// Project ID.
        project: String,
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Pause, resume, terminate or restart a session.
    Control {
        /// Project ID.
        project: String,
        /// Session ID.
        session: String,
        /// Action: pause, resume, terminate or restart.
        action: String,
        /// Operator note recorded with the action.
        #[arg(long)]
        reason: Option<String>,
        /// Skip graceful negotiation on terminate.
        #[arg(long)]
        force: bool,
    },

    /// Follow a project's sessions, refreshing every `interval` seconds.
    Watch {
        /// Project ID.
        project: String,
        /// Refresh period in seconds.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

/// Monitoring config overrides shared by `start` and `config`.
#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// Poll interval in milliseconds (minimum 1000).
    #[arg(long)]
    poll_interval: Option<u64>,
    /// Session re-enumeration interval in milliseconds.
    #[arg(long)]
    health_check_interval: Option<u64>,
    /// Inactivity in milliseconds before a session counts as stalled.
    #[arg(long)]
    stale_threshold: Option<u64>,
    /// Concurrent per-session fetches.
    #[arg(long)]
    max_sessions: Option<u32>,
    /// Nudge sessions that become stalled or fail.
    #[arg(long)]
    auto_recovery: Option<bool>,
    /// Publish monitor events.
    #[arg(long)]
    notifications: Option<bool>,
}

impl ConfigArgs {
    fn into_patch(self) -> MonitoringConfigPatch {
        MonitoringConfigPatch {
            poll_interval: self.poll_interval,
            health_check_interval: self.health_check_interval,
            stale_threshold: self.stale_threshold,
            max_sessions: self.max_sessions,
            enable_auto_recovery: self.auto_recovery,
            enable_notifications: self.notifications,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Cli::parse();
    let api = HttpApi::new(args.url.clone());

    if let Err(err) = run(&api, args.command).await {
        eprintln!("Error: {err}");
        if matches!(err, AppError::Io(_)) {
            eprintln!("Is session-monitor running at {}?", args.url);
        }
        std::process::exit(1);
    }
}

async fn run(api: &HttpApi, command: Command) -> Result<()> {
    match command {
        Command::Status { project } => print_json(&api.status(&project).await?),
        Command::Show { project } => match api.snapshot(&project).await? {
            Some(data) => print_json(&data),
            None => Err(AppError::NotFound(format!(
                "no monitoring data for project {project}"
            ))),
        },
        Command::Session { project, session } => {
            match api.session_update(&project, &session).await? {
                Some(update) => print_json(&update),
                None => Err(AppError::NotFound(format!(
                    "session {session} not found in project {project}"
                ))),
            }
        }
        Command::Start { project, config } => {
            let patch = config.into_patch();
            print_json(&api.start(&project, Some(&patch)).await?)
        }
        Command::Stop { project } => print_json(&api.stop(&project).await?),
        Command::Config { project, config } => {
            print_json(&api.update_config(&project, &config.into_patch()).await?)
        }
        Command::Control {
            project,
            session,
            action,
            reason,
            force,
        } => {
            let request = SessionControlRequest {
                project_id: project,
                session_id: session,
                action: ControlAction::parse(&action)?,
                reason,
                force: force.then_some(true),
            };
            let result = api.control(&request).await?;
            print_json(&result)?;
            if result.success {
                Ok(())
            } else {
                Err(AppError::InvalidTransition(
                    result.message.unwrap_or_else(|| "action rejected".into()),
                ))
            }
        }
        Command::Watch { project, interval } => watch(api, &project, interval).await,
    }
}

async fn watch(api: &HttpApi, project: &str, interval: u64) -> Result<()> {
    let mut view = SessionView::new(project);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {}
        }
        view.refresh(api).await?;
        render(&view);
    }
}

fn render(view: &SessionView) {
    let now = Utc::now();
    println!();
    match view.data() {
        None => {
            println!("{}: not monitored", view.project_id());
            return;
        }
        Some(data) => {
            let age = view.staleness(now).map_or(0, |age| age.as_secs());
            let flag = if view.is_degraded() { " [detection limited]" } else { "" };
            println!(
                "{}: {}/{} active, updated {age}s ago{flag}",
                view.project_id(),
                data.stats.active_count,
                data.stats.total_count,
            );
        }
    }
    let selected = view.selected().map(|s| s.session_id.as_str());
    for session in view.sessions() {
        let marker = if Some(session.session_id.as_str()) == selected { ">" } else { " " };
        println!(
            "{marker} {:<40} {:<10} tokens={:<8} msgs={:<5} {}",
            session.session_id,
            session.state.as_str(),
            session.progress.token_usage.total,
            session.progress.message_count,
            session.progress.current_activity.as_deref().unwrap_or("-"),
        );
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Internal(format!("failed to render response: {err}")))?;
    println!("{text}");
    Ok(())
}
