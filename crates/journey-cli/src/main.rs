//! CLI binary for inspecting and simulating journeys.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use journey_engine::duration_serde::format_duration;
use journey_engine::{
    navigation, progress, standard_guards, Action, ActionOutcome, EngineConfig, EngineHandle,
    FileSnapshotStore, JourneyEngine, JourneySnapshot, LogSink, StepCatalog, TransitionValidator,
};
use journey_types::JourneyState;

#[derive(Parser)]
#[command(
    name = "journey",
    version,
    about = "Inspector and simulator for the journey workflow engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the standard step catalog and its guards
    Catalog {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Walk a session through the standard journey with sample data
    Simulate {
        /// User id for the session
        #[arg(short, long, default_value = "demo-user")]
        user: String,

        /// Stop after completing this step
        #[arg(long)]
        stop_at: Option<String>,

        /// Directory for snapshots; the final state is saved there
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Show progress and next step for a saved snapshot
    Status {
        /// Path to a snapshot .json file
        snapshot: PathBuf,
    },

    /// Check whether a saved session may move to a step
    Check {
        /// Path to a snapshot .json file
        snapshot: PathBuf,

        /// Target step id
        #[arg(long)]
        to: String,

        /// Source step id (default: the snapshot's current step)
        #[arg(long)]
        from: Option<String>,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Catalog { json } => cmd_catalog(json)?,
        Commands::Simulate { user, stop_at, store } => {
            cmd_simulate(config, &user, stop_at.as_deref(), store.as_deref()).await?;
        }
        Commands::Status { snapshot } => cmd_status(&snapshot).await?,
        Commands::Check { snapshot, to, from } => cmd_check(&snapshot, &to, from.as_deref()).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

fn standard_validator() -> anyhow::Result<(Arc<StepCatalog>, TransitionValidator)> {
    let catalog = Arc::new(StepCatalog::standard()?);
    let guards = Arc::new(standard_guards(&catalog)?);
    let validator = TransitionValidator::new(catalog.clone(), guards);
    Ok((catalog, validator))
}

fn cmd_catalog(as_json: bool) -> anyhow::Result<()> {
    let (catalog, validator) = standard_validator()?;

    if as_json {
        let steps: Vec<Value> = catalog
            .steps()
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "title": s.title,
                    "phase": s.phase,
                    "weight": s.weight,
                    "can_skip": s.can_skip,
                    "dependencies": s.dependencies,
                    "required_data": s.required_data,
                    "estimated_duration": format_duration(&s.estimated_duration),
                })
            })
            .collect();
        let guards: Vec<Value> = validator
            .guards()
            .iter()
            .map(|g| {
                json!({
                    "name": g.name,
                    "from": g.from,
                    "to": g.to,
                    "condition": g.condition.to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "steps": steps, "guards": guards }))?);
        return Ok(());
    }

    println!("Steps: {} (total weight {})", catalog.len(), catalog.total_weight());
    for (i, step) in catalog.steps().iter().enumerate() {
        let skip = if step.can_skip { " [skippable]" } else { "" };
        println!(
            "  {:>2}. {:<20} {:<14} w={:<2} {}{}",
            i + 1,
            step.id,
            step.phase.as_str(),
            step.weight,
            step.title,
            skip
        );
        if !step.dependencies.is_empty() {
            println!("      after: {}", step.dependencies.join(", "));
        }
    }

    println!("\nGuards:");
    for guard in validator.guards().iter() {
        println!("  {}: {} -> {} when {}", guard.name, guard.from, guard.to, guard.condition);
    }
    Ok(())
}

/// Data a user would enter before moving to `step`.
fn sample_data(step: &str) -> Value {
    match step {
        "auth_profile" => json!({"auth": {"display_name": "Demo User"}}),
        "scenario_intent" => json!({
            "scenario": {"genre": "documentary", "intent": "A day in the life of a harbour"}
        }),
        "scenario_structure" => json!({
            "scenario": {"structure": ["dawn", "work", "storm", "dusk"]}
        }),
        "scenario_draft" => json!({
            "scenario": {
                "draft": "Fishing boats leave before dawn while the harbour master watches the sky."
            }
        }),
        "scenario_review" => json!({"scenario": {"draft_saved": true, "approved": true}}),
        "story_outline" => json!({"scenario": {"outline": "Departure, labour, weather, return"}}),
        "story_characters" => json!({"scenario": {"characters": ["harbour master", "crew"]}}),
        "planning_shots" => {
            let shots: Vec<String> = (1..=12).map(|n| format!("shot-{n:02}")).collect();
            json!({"planning": {"shots": shots}})
        }
        "planning_storyboard" => json!({"planning": {"storyboard": "storyboard-v1"}}),
        "planning_contis" => json!({"planning": {"contis": ["conti-01"]}}),
        "planning_schedule" => json!({"planning": {"schedule": "two days"}}),
        "planning_review" => json!({"planning": {"locked": true}}),
        "video_prompt" => json!({
            "video": {"prompt": "Handheld documentary footage of a small harbour at dawn"}
        }),
        "video_settings" => json!({"video": {"resolution": "1080p", "duration_secs": 60}}),
        "video_generate" => json!({"video": {"job_id": "sim-job"}}),
        "video_review" => json!({
            "video": {
                "status": "completed",
                "url": "https://example.com/sim.mp4",
                "approved": true
            }
        }),
        "feedback_share" => json!({"feedback": {"recipients": ["editor@example.com"]}}),
        "feedback_collect" => json!({"feedback": {"comments": ["Tighten the storm sequence"]}}),
        "feedback_revise" => json!({"feedback": {"revision_pending": false}}),
        "project_export" => json!({"project": {"export_format": "mp4"}}),
        "project_complete" => json!({
            "project": {"export_url": "https://example.com/export/sim.mp4"}
        }),
        _ => Value::Null,
    }
}

async fn dispatch(handle: &EngineHandle, action: Action) -> anyhow::Result<()> {
    let name = action.name();
    let out = handle.dispatch(action).await?;
    if let ActionOutcome::Rejected(rejection) = out.outcome {
        anyhow::bail!("{name} rejected: {rejection}");
    }
    Ok(())
}

fn print_progress(handle: &EngineHandle, state: &JourneyState) {
    let report = handle.progress(state);
    println!(
        "[{:>3}%] {:<20} weighted {:>3}%  eta {}",
        report.simple,
        state.current_step,
        report.weighted,
        format_duration(&report.eta_remaining)
    );
}

async fn cmd_simulate(
    config: EngineConfig,
    user: &str,
    stop_at: Option<&str>,
    store: Option<&Path>,
) -> anyhow::Result<()> {
    let mut builder = JourneyEngine::builder().config(config).sink(Arc::new(LogSink));
    if let Some(dir) = store {
        builder = builder.store(Arc::new(FileSnapshotStore::new(dir)));
    }
    let handle = builder.spawn()?;
    tracing::info!(user, stop_at = ?stop_at, "Simulating standard journey");

    dispatch(&handle, Action::start(user)).await?;
    let first = handle.state().current_step.clone();
    dispatch(&handle, Action::complete_with(first, json!({"token": "simulated-token"}))).await?;
    print_progress(&handle, &handle.state());

    loop {
        let state = handle.state();
        if stop_at == Some(state.current_step.as_str()) {
            break;
        }
        let upcoming = handle.catalog().after(&state.current_step).map(|s| s.id.clone());
        let Some(upcoming) = upcoming else {
            break;
        };
        if let Value::Object(areas) = sample_data(&upcoming) {
            for (area, value) in areas {
                dispatch(&handle, Action::persist(area, value)).await?;
            }
        }

        let state = handle.state();
        let Some(next) = handle.next_allowed_step(&state) else {
            let result = handle.validate(&state.current_step, &upcoming, &state);
            println!("Blocked before '{upcoming}'");
            if let Some(hint) = result.recommended_action {
                println!("  {hint}");
            }
            break;
        };
        dispatch(&handle, Action::navigate(next.clone())).await?;
        dispatch(&handle, Action::complete(next)).await?;
        print_progress(&handle, &handle.state());
    }

    let state = handle.state();
    println!("\nSession: {}", state.session_id());
    println!("Completed: {}/{}", state.completed_steps.len(), handle.catalog().len());
    if let Some(dir) = store {
        let snapshot = handle.save_snapshot().await?;
        println!(
            "Snapshot: {}",
            FileSnapshotStore::new(dir).path_for(snapshot.session_id()).display()
        );
    }
    handle.flush_telemetry().await?;
    handle.shutdown().await?;
    Ok(())
}

async fn load_snapshot(path: &Path, catalog: &StepCatalog) -> anyhow::Result<JourneySnapshot> {
    let snapshot = FileSnapshotStore::read_path(path).await?;
    snapshot.validate_against(catalog)?;
    tracing::debug!(path = %path.display(), session = snapshot.session_id(), "Loaded snapshot");
    Ok(snapshot)
}

async fn cmd_status(path: &Path) -> anyhow::Result<()> {
    let (catalog, validator) = standard_validator()?;
    let snapshot = load_snapshot(path, &catalog).await?;
    let state = &snapshot.state;
    let report = progress::calculate(&catalog, state);

    println!("Session: {}", state.session_id());
    println!("Saved: {}", snapshot.saved_at.to_rfc3339_opts(SecondsFormat::Secs, true));
    if let Some(user) = &state.session.user_id {
        println!("User: {user}");
    }
    println!("Current step: {}", state.current_step);
    println!("Progress: {}% (weighted {}%)", report.simple, report.weighted);
    for phase in &report.per_phase {
        println!(
            "  {:<14} {:>3}%  {}/{}",
            phase.phase.as_str(),
            phase.percent,
            phase.completed,
            phase.total
        );
    }
    println!(
        "Remaining: {}",
        format_duration(&report.eta_remaining)
    );
    match navigation::next_allowed_step(&validator, &state.current_step, state) {
        Some(next) => println!("Next step: {next}"),
        None => println!("Next step: (none available)"),
    }
    if !state.errors.is_empty() {
        println!("Errors:");
        for error in &state.errors {
            println!(
                "  [{:?}] {} at {}: {}",
                error.severity, error.code, error.step, error.message
            );
        }
    }
    Ok(())
}

async fn cmd_check(path: &Path, to: &str, from: Option<&str>) -> anyhow::Result<()> {
    let (catalog, validator) = standard_validator()?;
    let state = load_snapshot(path, &catalog).await?.state;
    let from = from.unwrap_or(&state.current_step);
    let result = validator.validate(from, to, &state);

    println!("{from} -> {to}: {}", if result.can_proceed { "allowed" } else { "blocked" });
    for path in &result.missing_data {
        println!("  [MISSING] {path}");
    }
    for issue in &result.errors {
        println!("  [{:?}] {}", issue.kind, issue.message);
    }
    for warning in &result.warnings {
        println!("  [WARN] {warning}");
    }
    if let Some(hint) = &result.recommended_action {
        println!("Hint: {hint}");
    }
    if !result.can_proceed {
        std::process::exit(1);
    }
    Ok(())
}
