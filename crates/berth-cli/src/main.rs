//! CLI binary for running Berth containerization pipelines.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tokio_stream::StreamExt;

use berth_llm::{AnthropicResponder, Responder, ScriptedResponder};
use berth_pipeline::{
    register_default_pipelines, BackoffPolicy, PipelineEngine, PipelineEvent, PipelineRequest,
    PipelineResponse, RetryPolicy, RunStatus,
};
use berth_session::{
    SessionConfig, SessionFilter, SessionManager, SessionState, SqliteSessionStore,
};
use berth_tools::{
    register_containerization_tools, register_workspace_tools, CommandRunner, DockerCli,
    KubectlCli, ToolRegistry,
};
use berth_types::CancellationToken;

use crate::config::{BerthConfig, ResponderKind};

#[derive(Parser)]
#[command(name = "berth", version, about = "AI-assisted containerization pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to berth.toml
    #[arg(short, long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "BERTH_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline (containerize, build, deploy)
    Run {
        /// Pipeline name
        operation: String,

        /// Repository to containerize (sets input.repo_path)
        #[arg(short, long)]
        repo: Option<PathBuf>,

        /// Pipeline input as a JSON object
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read pipeline input from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Extra input fields, KEY=VALUE (VALUE parsed as JSON when possible)
        #[arg(long = "set", value_parser = parse_key_value)]
        set: Vec<(String, String)>,

        /// Run inside an existing session. Without one, a new session is
        /// created that expires after 24 hours unless sessions.ttl_secs is set
        #[arg(short, long, env = "BERTH_SESSION")]
        session: Option<String>,

        /// Per-stage timeout for this run, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Describe side effects instead of performing them
        #[arg(long)]
        dry_run: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Invoke a single tool inside a session workspace
    Invoke {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Session to run in (a new one is created if omitted)
        #[arg(short, long, env = "BERTH_SESSION")]
        session: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// List registered tools
    Tools {
        /// Print full definitions including schemas
        #[arg(long)]
        schema: bool,
    },

    /// List registered pipelines
    Pipelines,

    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Remove expired sessions and orphaned workspaces
    Gc,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions
    List {
        /// Only sessions carrying KEY=VALUE
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,

        /// Only sessions in this state
        #[arg(long)]
        state: Option<SessionState>,

        #[arg(long)]
        json: bool,
    },
    /// Show one session with its checkpoints
    Show { id: String },
    /// Create an empty session
    Create {
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,

        /// Idle lifetime in seconds (0 disables expiry)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Delete a session and its workspace
    Delete { id: String },
    /// Snapshot a session workspace
    Checkpoint {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Restore a session workspace from a checkpoint
    Restore { id: String, checkpoint: String },
    /// Set a label
    Label { id: String, key: String, value: String },
    /// Remove a label
    Unlabel { id: String, key: String },
    /// Session counts and disk usage
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            operation,
            repo,
            input,
            input_file,
            set,
            session,
            timeout_secs,
            dry_run,
            json,
        } => {
            let input = build_input(input.as_deref(), input_file.as_deref(), repo.as_deref(), set)?;
            let mut request = PipelineRequest::new(operation, input).dry_run(dry_run);
            if let Some(id) = session {
                request = request.in_session(id);
            }
            if let Some(secs) = timeout_secs {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            let engine = build_engine(&config).await?;
            cmd_run(&engine, request, json).await?;
        }
        Commands::Invoke {
            tool,
            args,
            session,
            dry_run,
        } => {
            let args: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            let engine = build_engine(&config).await?;
            cmd_invoke(&engine, &tool, args, session, dry_run).await?;
        }
        Commands::Tools { schema } => {
            cmd_tools(&build_registry(&config)?, &config, schema)?;
        }
        Commands::Pipelines => {
            let engine = build_engine(&config).await?;
            for pipeline in engine.pipelines() {
                println!("{:<14} {}", pipeline.name, pipeline.description);
                println!("{:<14} stages: {}", "", pipeline.stages.join(" -> "));
            }
        }
        Commands::Sessions { command } => {
            let sessions = open_sessions(&config).await?;
            cmd_sessions(&sessions, command).await?;
        }
        Commands::Gc => {
            let sessions = open_sessions(&config).await?;
            let report = sessions.garbage_collect().await?;
            if report.is_empty() {
                println!("Nothing to clean up");
            }
            for id in &report.expired_sessions {
                println!("Deleted expired session {id}");
            }
            for path in &report.orphaned_workspaces {
                println!("Removed orphaned workspace {}", path.display());
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Merge `--input`/`--input-file`, `--repo` and `--set` into one object.
fn build_input(
    inline: Option<&str>,
    file: Option<&Path>,
    repo: Option<&Path>,
    set: Vec<(String, String)>,
) -> anyhow::Result<Value> {
    let base = match (inline, file) {
        (Some(raw), _) => serde_json::from_str(raw).context("--input must be valid JSON")?,
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        }
        (None, None) => Value::Object(Map::new()),
    };
    let Value::Object(mut input) = base else {
        bail!("pipeline input must be a JSON object");
    };

    if let Some(repo) = repo {
        let abs = std::fs::canonicalize(repo)
            .with_context(|| format!("repository {} not found", repo.display()))?;
        input.insert(
            "repo_path".into(),
            Value::String(abs.to_string_lossy().into_owned()),
        );
    }
    for (key, raw) in set {
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        input.insert(key, value);
    }
    Ok(Value::Object(input))
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_registry(config: &BerthConfig) -> anyhow::Result<ToolRegistry> {
    let registry = ToolRegistry::new();
    register_workspace_tools(&registry)?;

    let runner = CommandRunner::new(config.command_timeout());
    register_containerization_tools(
        &registry,
        Arc::new(DockerCli::new(&config.runtime.container_cli, runner.clone())),
        Arc::new(KubectlCli::new(&config.runtime.cluster_cli, runner)),
        config.command_timeout().as_millis() as u64,
    )?;
    Ok(registry)
}

async fn open_sessions(config: &BerthConfig) -> anyhow::Result<Arc<SessionManager>> {
    let store = SqliteSessionStore::open(&config.sessions.database)
        .await
        .with_context(|| format!("open {}", config.sessions.database.display()))?;
    let manager = SessionManager::open(config.session_manager(), Arc::new(store)).await?;
    Ok(Arc::new(manager))
}

fn build_responder(config: &BerthConfig) -> anyhow::Result<Option<Arc<dyn Responder>>> {
    let settings = &config.responder;
    match settings.kind {
        ResponderKind::None => Ok(None),
        ResponderKind::Scripted => {
            let Some(path) = &settings.script else {
                bail!("responder.script is required for the scripted responder");
            };
            let responder: Arc<dyn Responder> = Arc::new(
                ScriptedResponder::from_file(path)
                    .with_context(|| format!("load responder script {}", path.display()))?,
            );
            Ok(Some(responder))
        }
        ResponderKind::Anthropic => match AnthropicResponder::from_env_var(&settings.api_key_env) {
            Ok(mut responder) => {
                if let Some(url) = &settings.base_url {
                    responder = responder.with_base_url(url.clone());
                }
                if let Some(model) = &settings.model {
                    responder = responder.with_model(model.clone());
                }
                let responder: Arc<dyn Responder> =
                    Arc::new(responder.with_max_tokens(settings.max_tokens));
                Ok(Some(responder))
            }
            Err(_) => {
                tracing::warn!(
                    env = %settings.api_key_env,
                    "No API key found, repair stages will retry without AI fixes"
                );
                Ok(None)
            }
        },
    }
}

async fn build_engine(config: &BerthConfig) -> anyhow::Result<PipelineEngine> {
    let registry = Arc::new(build_registry(config)?);
    let sessions = open_sessions(config).await?;

    let mut engine = PipelineEngine::new(registry, sessions).with_contention(config.pipeline.contention);
    if let Some(timeout) = config.stage_timeout() {
        engine = engine.with_timeout(timeout);
    }
    if config.pipeline.retry_attempts > 1 {
        engine = engine.with_retry(RetryPolicy::new(
            config.pipeline.retry_attempts,
            BackoffPolicy::default(),
        ));
    }
    if let Some(responder) = build_responder(config)? {
        engine = engine.with_responder(responder);
    }
    register_default_pipelines(&engine, &config.pipeline_settings())?;
    Ok(engine)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling...");
            token.cancel();
        }
    });
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(engine: &PipelineEngine, request: PipelineRequest, json: bool) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let events = engine.events().stream();
    let printer = tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    if !json {
        println!("Running pipeline: {}", request.operation);
        if request.options.dry_run {
            println!("(dry run mode -- no builds or deployments)");
        }
    }
    let response = engine.execute(&cancel, request).await;
    printer.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_summary(&response);
    }
    if response.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage, tool, .. } => eprintln!("[{stage}] started ({tool})"),
        PipelineEvent::Progress(p) if !p.terminal && p.percent > 0 => {
            eprintln!("[{}] {} ({}%)", p.stage, p.message, p.percent)
        }
        PipelineEvent::StageRetrying {
            stage,
            attempt,
            delay_ms,
            ..
        } => eprintln!("[{stage}] retrying (attempt {attempt}) in {delay_ms}ms"),
        PipelineEvent::CheckpointCreated { checkpoint_id, .. } => {
            eprintln!("checkpoint {checkpoint_id} created")
        }
        PipelineEvent::StageCompleted {
            stage,
            attempts,
            duration_ms,
            ..
        } => eprintln!("[{stage}] completed in {duration_ms}ms ({attempts} attempt(s))"),
        PipelineEvent::StageFailed { stage, error, .. } => eprintln!("[{stage}] failed: {error}"),
        _ => {}
    }
}

fn print_summary(response: &PipelineResponse) {
    match response.status {
        RunStatus::Completed => println!("\nPipeline completed in {}ms", response.duration_ms),
        RunStatus::Failed => println!("\nPipeline failed after {}ms", response.duration_ms),
    }
    if let Some(session) = &response.session_id {
        println!("Session: {session}");
    }
    for stage in &response.stages {
        println!(
            "  {:<12} {:?} attempts={} {}ms",
            stage.name, stage.status, stage.attempts, stage.duration_ms
        );
        for attempt in &stage.repair_history {
            let first_line = attempt.error.lines().next().unwrap_or_default();
            println!("      attempt {}: {first_line}", attempt.attempt);
        }
    }
    if let Some(error) = &response.error {
        let stage = response.failed_stage.as_deref().unwrap_or("-");
        println!("Error [{}] at {stage}: {}", error.kind, error.message);
    }
    if let Some(image) = response.output.pointer("/build/image").and_then(Value::as_str) {
        println!("Image: {image}");
    }
}

async fn cmd_invoke(
    engine: &PipelineEngine,
    tool: &str,
    args: Value,
    session: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let session_id = match session {
        Some(id) => id,
        None => {
            let session = engine
                .sessions()
                .create(SessionConfig::default().with_label("tool", tool))
                .await?;
            eprintln!("Created session {}", session.id);
            session.id
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let output = engine
        .invoke_tool(&cancel, &session_id, tool, args, dry_run)
        .await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_tools(registry: &ToolRegistry, config: &BerthConfig, schema: bool) -> anyhow::Result<()> {
    if schema {
        println!("{}", serde_json::to_string_pretty(&registry.definitions())?);
        return Ok(());
    }
    for tool in registry.list() {
        println!("{:<20} {:<8} {}", tool.name, tool.version, tool.description);
    }
    println!();
    for binary in [&config.runtime.container_cli, &config.runtime.cluster_cli] {
        match berth_tools::command::which(binary) {
            Some(path) => println!("{binary}: {}", path.display()),
            None => println!("{binary}: not found on PATH"),
        }
    }
    Ok(())
}

async fn cmd_sessions(sessions: &SessionManager, command: SessionCommands) -> anyhow::Result<()> {
    match command {
        SessionCommands::List { labels, state, json } => {
            let mut filter = SessionFilter::default();
            for (key, value) in labels {
                filter = filter.with_label(key, value);
            }
            if let Some(state) = state {
                filter = filter.with_state(state);
            }
            let listing = sessions.list(&filter);
            if json {
                let items: Vec<_> = listing.iter().collect();
                println!("{}", serde_json::to_string_pretty(&items)?);
                return Ok(());
            }
            if listing.is_empty() {
                println!("No sessions");
            }
            for s in &listing {
                let labels: Vec<String> = s.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!(
                    "{}  {:<12} {}  checkpoints={} stage={} {}",
                    s.id,
                    s.state,
                    s.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    s.checkpoint_count,
                    s.last_completed_stage.as_deref().unwrap_or("-"),
                    labels.join(",")
                );
            }
        }
        SessionCommands::Show { id } => {
            let session = sessions.get(&id)?;
            let usage = sessions.disk_usage(&id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            println!("Disk usage: {usage} bytes");
        }
        SessionCommands::Create { labels, ttl_secs } => {
            let mut config = SessionConfig::default();
            for (key, value) in labels {
                config = config.with_label(key, value);
            }
            if let Some(secs) = ttl_secs {
                config = config.with_ttl(Duration::from_secs(secs));
            }
            let session = sessions.create(config).await?;
            println!("{}", session.id);
            println!("Workspace: {}", session.workspace.display());
        }
        SessionCommands::Delete { id } => {
            sessions.delete(&id).await?;
            println!("Deleted session {id}");
        }
        SessionCommands::Checkpoint { id, note } => {
            let checkpoint = sessions.checkpoint(&id, note).await?;
            println!(
                "{}  files={} bytes={}",
                checkpoint.id, checkpoint.file_count, checkpoint.byte_size
            );
        }
        SessionCommands::Restore { id, checkpoint } => {
            let restored = sessions.restore(&id, &checkpoint).await?;
            println!("Restored session {id} to checkpoint {}", restored.id);
        }
        SessionCommands::Label { id, key, value } => {
            let session = sessions.add_label(&id, &key, &value).await?;
            println!("{}: {} label(s)", session.id, session.labels.len());
        }
        SessionCommands::Unlabel { id, key } => {
            let session = sessions.remove_label(&id, &key).await?;
            println!("{}: {} label(s)", session.id, session.labels.len());
        }
        SessionCommands::Stats => {
            let stats = sessions.stats().await?;
            println!("Sessions: {}", stats.total);
            for (state, count) in &stats.by_state {
                println!("  {state}: {count}");
            }
            println!("Checkpoints: {}", stats.checkpoints);
            println!("Disk usage: {} bytes", stats.disk_usage_bytes);
        }
    }
    Ok(())
}
