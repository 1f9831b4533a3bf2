#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::too_many_lines)]

use anyhow::{Context, Result};
use browser_pilot::observability::{LogObserver, MultiObserver, Observer, PrometheusObserver};
use browser_pilot::{Config, Orchestrator, Plan, RunOptions, RunStatus};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BROWSER_PILOT_GIT_SHA"),
    ", built ",
    env!("BROWSER_PILOT_BUILD_TIME"),
    ")"
);

/// Exit status for a run stopped with Ctrl-C.
const EXIT_ABORTED: i32 = 130;

/// `browser-pilot` - execute browser-automation plans with triple-verified clicks.
#[derive(Parser, Debug)]
#[command(name = "browser-pilot")]
#[command(author = "theonlyhennygod")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Execute structured browser-automation plans step by step.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.browser-pilot/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of config
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a plan against the remote browser service
    Run {
        /// Plan JSON file
        #[arg(short, long, value_name = "FILE")]
        plan: PathBuf,

        /// Open this URL first (in the reused session when --session-id is given)
        #[arg(long)]
        start_url: Option<String>,

        /// Continue an existing remote session
        #[arg(long)]
        session_id: Option<String>,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,

        /// Leave the remote session open after the run
        #[arg(long)]
        keep_session: bool,

        /// Print Prometheus counters after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Parse and summarise a plan without executing it
    Validate {
        /// Plan JSON file
        #[arg(short, long, value_name = "FILE")]
        plan: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.log_level.parse::<Level>().unwrap_or(Level::INFO)
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))?;

    match cli.command {
        Commands::Run {
            plan,
            start_url,
            session_id,
            json,
            keep_session,
            metrics,
        } => {
            let options = RunOptions {
                session_id,
                start_url,
            };
            run(&config, &plan, options, json, keep_session, metrics).await
        }
        Commands::Validate { plan } => validate(&plan).await,
        Commands::Config => show_config(&config),
    }
}

async fn load_plan(path: &Path) -> Result<Plan> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    Plan::from_json(&raw).with_context(|| format!("Invalid plan {}", path.display()))
}

async fn run(
    config: &Config,
    plan_path: &Path,
    options: RunOptions,
    json: bool,
    keep_session: bool,
    metrics: bool,
) -> Result<()> {
    let plan = load_plan(plan_path).await?;
    let reused_session = options.session_id.is_some();

    let prometheus = Arc::new(PrometheusObserver::new()?);
    let observer: Arc<dyn Observer> = Arc::new(
        MultiObserver::default()
            .with(Arc::new(LogObserver))
            .with(prometheus.clone()),
    );
    let mut orchestrator = Orchestrator::from_config(config)?.with_observer(observer);

    if !orchestrator.health_check().await {
        warn!(
            endpoint = %config.browser.endpoint,
            "Browser automation service failed its health check"
        );
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting after the current call");
            token.cancel();
        }
    });

    info!(plan = %plan_path.display(), steps = plan.steps.len(), "Starting run");
    let state = orchestrator.execute_plan(plan, options).await;

    if keep_session || reused_session {
        if let Some(id) = orchestrator.session_id() {
            info!(session_id = id, "Session left open");
        }
    } else if let Err(e) = orchestrator.reset_session().await {
        warn!("Failed to close browser session: {e:#}");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("Run {}: {}", state.run_id, state.status);
        for execution in &state.executed_steps {
            let mark = if execution.success { "ok" } else { "FAILED" };
            let mut notes = Vec::new();
            if execution.retries > 0 {
                notes.push(format!("{} retries", execution.retries));
            }
            if execution.used_fallback {
                notes.push("fallback".to_string());
            }
            if execution.used_cache {
                notes.push("cached".to_string());
            }
            if let Some(v) = &execution.verification {
                notes.push(format!("{} {:.2}", v.pattern, v.confidence));
            }
            println!(
                "  [{mark}] step {} {} '{}' ({}ms{}{})",
                execution.step.index,
                execution.step.action,
                execution.step.target_description,
                execution.duration_ms,
                if notes.is_empty() { "" } else { ", " },
                notes.join(", ")
            );
        }
        if let Some(error) = &state.error {
            println!("  error: {error}");
        }
        if let Some(id) = &state.session_id {
            println!("  session: {id}");
        }
    }

    if metrics {
        print!("{}", prometheus.encode()?);
    }

    match state.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Aborted => std::process::exit(EXIT_ABORTED),
        status => anyhow::bail!(
            "Run ended {status}: {}",
            state.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn validate(plan_path: &Path) -> Result<()> {
    let plan = load_plan(plan_path).await?;
    println!("Goal: {}", plan.goal);
    if !plan.success_criteria.is_empty() {
        println!("Success criteria: {}", plan.success_criteria);
    }
    println!("{} steps:", plan.steps.len());
    for step in &plan.steps {
        let mut line = format!(
            "  {:>3}. {:<8} {}",
            step.index, step.action, step.target_description
        );
        if let Some(input) = &step.input_value {
            line.push_str(&format!(" = {input:?}"));
        }
        if let Some(fallback) = &step.fallback_description {
            line.push_str(&format!(" (fallback: {fallback})"));
        }
        println!("{line}");
    }
    if plan.is_navigational_only() {
        println!("Navigational only: no element locating needed.");
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    for key in [
        &mut shown.browser.api_key,
        &mut shown.vision_a.api_key,
        &mut shown.vision_b.api_key,
    ] {
        if key.is_some() {
            *key = Some("***".into());
        }
    }
    println!("# {}", config.config_path.display());
    print!(
        "{}",
        toml::to_string_pretty(&shown).context("Failed to serialize config")?
    );
    Ok(())
}
