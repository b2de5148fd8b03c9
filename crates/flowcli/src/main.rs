// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    Execution, ExecutionEvent, ExecutionId, ExecutionStatus, ExpressionContext, ExpressionEngine,
    FlowError, NodeEvent, NodeSpec, Value, Workflow,
};
use flowruntime::{
    ExecutionHandle, ExecutionOptions, FileCheckpointStore, FlowRuntime,
    InMemoryCheckpointStore, RuntimeConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for execution checkpoints
    #[arg(long, global = true, default_value = ".flow/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger payload as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Maximum nodes running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Do not write checkpoints
        #[arg(long)]
        no_checkpoint: bool,

        /// Extra $env value, as KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },

    /// Resume an interrupted execution from its latest checkpoint
    Resume {
        /// Path to the workflow JSON file the execution was started from
        #[arg(short, long)]
        file: PathBuf,

        /// Execution to resume
        #[arg(short = 'x', long)]
        execution_id: ExecutionId,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Evaluate a template expression against a JSON item
    Eval {
        /// Template, e.g. "{{ $json.a + 1 }}"
        template: String,

        /// Value of $json
        #[arg(short, long)]
        json: Option<String>,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            input,
            max_parallel,
            no_checkpoint,
            env,
        } => {
            let mut options = ExecutionOptions::default();
            if let Some(n) = max_parallel {
                options = options.with_max_parallel(n);
            }
            if no_checkpoint {
                options = options.without_checkpointing();
            }
            for (key, value) in env {
                options = options.with_env(key, value);
            }
            run_workflow(&file, input, options, config, &cli.checkpoint_dir).await?;
        }

        Commands::Resume { file, execution_id } => {
            resume_workflow(&file, execution_id, config, &cli.checkpoint_dir).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file, config)?;
        }

        Commands::Eval { template, json } => {
            evaluate(&template, json, &config)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: RuntimeConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?config, "Loaded runtime config");
    Ok(config)
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    serde_json::from_str(&workflow_json)
        .with_context(|| format!("parsing workflow {}", file.display()))
}

async fn build_runtime(config: RuntimeConfig, checkpoint_dir: &Path) -> Result<FlowRuntime> {
    let store = FileCheckpointStore::open(checkpoint_dir)
        .await
        .with_context(|| format!("opening checkpoint directory {}", checkpoint_dir.display()))?;
    Ok(FlowRuntime::new(
        Arc::new(flownodes::standard_registry()),
        Arc::new(store),
        config,
    ))
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    options: ExecutionOptions,
    config: RuntimeConfig,
    checkpoint_dir: &Path,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let payload: Value = match input {
        Some(input_str) => serde_json::from_str(&input_str).context("parsing --input")?,
        None => Value::Object(Default::default()),
    };

    let runtime = build_runtime(config, checkpoint_dir).await?;
    let events = runtime.subscribe_events();
    let handle = runtime.start(&workflow, payload, options)?;
    watch(&runtime, events, handle).await
}

async fn resume_workflow(
    file: &Path,
    execution_id: ExecutionId,
    config: RuntimeConfig,
    checkpoint_dir: &Path,
) -> Result<()> {
    let workflow = load_workflow(file)?;
    let runtime = build_runtime(config, checkpoint_dir).await?;
    println!("🔁 Resuming execution {}", execution_id);
    let events = runtime.subscribe_events();
    let handle = runtime
        .resume(&workflow, execution_id, ExecutionOptions::default())
        .await?;
    watch(&runtime, events, handle).await
}

/// Print events until the execution finishes, then the summary.
async fn watch(
    runtime: &FlowRuntime,
    mut events: broadcast::Receiver<ExecutionEvent>,
    handle: ExecutionHandle,
) -> Result<()> {
    let execution_id = handle.execution_id();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.execution_id() != execution_id {
                continue;
            }
            let finished = matches!(event, ExecutionEvent::ExecutionFinished { .. });
            print_event(event);
            if finished {
                break;
            }
        }
    });

    let interrupt = execution_id;
    let execution = tokio::select! {
        execution = handle.wait() => execution?,
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Cancelling execution {}", interrupt);
            runtime.cancel(interrupt);
            bail!("execution {} interrupted; resume it with `flow resume -x {}`", interrupt, interrupt);
        }
    };
    let _ = event_task.await;

    print_summary(&execution);
    if execution.status != ExecutionStatus::Completed {
        bail!("execution ended with status {:?}", execution.status);
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted { resumed, .. } => {
            if resumed {
                println!("▶️  Execution resumed");
            } else {
                println!("▶️  Execution started");
            }
        }
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            attempt,
            ..
        } => {
            println!("  ⚡ Starting node: {} ({}) attempt {}", node_id, node_type, attempt);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            branch,
            ..
        } => match branch {
            Some(branch) => println!("  ✅ Node {} completed in {}ms, branch {}", node_id, duration_ms, branch),
            None => println!("  ✅ Node {} completed in {}ms", node_id, duration_ms),
        },
        ExecutionEvent::NodeFailed {
            node_id,
            error,
            will_retry,
            ..
        } => {
            let suffix = if will_retry { ", retrying" } else { "" };
            println!("  ❌ Node {} failed: {}{}", node_id, error.message, suffix);
        }
        ExecutionEvent::NodeSkipped { node_id, .. } => {
            println!("  ⏭️  Node {} skipped", node_id);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
        },
        ExecutionEvent::CheckpointSaved { .. } => {}
        ExecutionEvent::ExecutionFinished {
            status,
            duration_ms,
            ..
        } => {
            if status == ExecutionStatus::Completed {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow ended {:?} after {}ms", status, duration_ms);
            }
        }
    }
}

fn print_summary(execution: &Execution) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {:?}", execution.status);
    if let Some(error) = &execution.error {
        let node = error.node_id.as_deref().unwrap_or("-");
        println!("   Error: {:?} at {}: {}", error.kind, node, error.message);
    }

    println!();
    println!("📤 Outputs:");
    for (node_id, attempts) in &execution.results {
        let Some(record) = attempts.last() else {
            continue;
        };
        match &record.output {
            Some(output) => println!("   {} [{:?}]: {}", node_id, record.status, output),
            None => println!("   {} [{:?}]", node_id, record.status),
        }
    }
}

fn validate_workflow(file: &Path, config: RuntimeConfig) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(file)?;

    let runtime = FlowRuntime::new(
        Arc::new(flownodes::standard_registry()),
        Arc::new(InMemoryCheckpointStore::new()),
        config,
    );
    match runtime.validate(&workflow) {
        Ok(()) => {}
        Err(FlowError::Validation(errors)) => {
            println!("❌ Workflow is invalid:");
            for issue in errors.issues() {
                println!("   • {}", issue);
            }
            bail!("{} validation issue(s)", errors.issues().len());
        }
        Err(e) => return Err(e.into()),
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    Ok(())
}

fn evaluate(template: &str, json: Option<String>, config: &RuntimeConfig) -> Result<()> {
    let item: Value = match json {
        Some(text) => serde_json::from_str(&text).context("parsing --json")?,
        None => Value::Null,
    };
    let engine = ExpressionEngine::new(config.expression_limits.clone());
    let value = engine.evaluate(template, &ExpressionContext::new(item))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = flownodes::standard_registry();
    for metadata in registry.list_metadata() {
        let branching = if metadata.branching { " [branching]" } else { "" };
        println!("  • {}{}", metadata.node_type, branching);
        if !metadata.description.is_empty() {
            println!("    {}", metadata.description);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example HTTP Workflow");
    workflow.description = Some("Fetches data from an API and logs the result".to_string());

    workflow.add_node(
        NodeSpec::new("fetch", "http.request")
            .with_name("Fetch Data")
            .with_config("method", "GET")
            .with_config("url", "{{ $json.url }}")
            .with_retry(3, 500)
            .with_timeout_ms(10_000),
    );
    workflow.add_node(
        NodeSpec::new("log", "debug.log")
            .with_name("Log Response")
            .with_config("message", "status {{ $json.status }}"),
    );
    workflow.add_node(
        NodeSpec::new("report", "debug.log")
            .with_name("Report Failure")
            .with_config("message", "request failed: {{ $json.error.message }}"),
    );
    workflow.connect("fetch", "log");
    workflow.connect_error("fetch", "report");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}
