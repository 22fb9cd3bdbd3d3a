use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use larkspur_capability::{CapabilityRegistry, EchoCapability};
use larkspur_config::{Release, WorkflowDef};
use larkspur_engine::RunExecutor;
use larkspur_store::{NewRun, SqliteStore, Store};
use larkspur_worker::{QueueWorker, WorkerConfig};

/// Larkspur - a durable node/edge workflow execution engine
#[derive(Parser)]
#[command(name = "larkspur")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.larkspur)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Enqueue a workflow run and execute it in-process
  Run {
    /// Path to the workflow definition (JSON)
    workflow_file: PathBuf,

    /// Run input as inline JSON; reads stdin when absent
    #[arg(long)]
    input: Option<String>,
  },

  /// Enqueue a workflow run for a worker to pick up
  Enqueue {
    /// Path to the workflow definition (JSON)
    workflow_file: PathBuf,

    /// Run input as inline JSON; reads stdin when absent
    #[arg(long)]
    input: Option<String>,
  },

  /// Run a queue worker until interrupted
  Worker {
    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Stale-run timeout in seconds
    #[arg(long, default_value_t = 300)]
    stale_secs: u64,
  },

  /// Print the status and node tasks of a run
  Status { run_id: String },

  /// Print the logs of a run
  Logs {
    run_id: String,

    /// Only logs with seq greater than this
    #[arg(long, default_value_t = 0)]
    after: i64,
  },

  /// Cancel a queued or running run
  Cancel { run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "larkspur=info".into()),
    )
    .init();

  let cli = Cli::parse();
  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".larkspur")
  });

  let Some(command) = cli.command else {
    println!("larkspur - use --help to see available commands");
    return Ok(());
  };

  std::fs::create_dir_all(&data_dir)
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  let db_url = format!("sqlite://{}", data_dir.join("larkspur.db").display());
  let store = SqliteStore::connect(&db_url)
    .await
    .with_context(|| format!("failed to open database: {db_url}"))?;
  store.migrate().await.context("failed to run migrations")?;

  match command {
    Commands::Run { workflow_file, input } => {
      let run_id = enqueue_run(&store, &workflow_file, input).await?;
      let run = store.get_run(&run_id).await?;
      let claimed = store
        .claim_next_run()
        .await?
        .filter(|r| r.id == run.id)
        .context("run was claimed by another worker")?;

      let executor = RunExecutor::new(store.clone(), default_registry());
      let status = executor.execute(&claimed, &CancellationToken::new()).await?;
      let finished = store.get_run(&run_id).await?;
      eprintln!("run {} finished: {:?}", run_id, status);
      if let Some(output) = finished.output {
        println!("{}", serde_json::to_string_pretty(&output.0)?);
      }
      if let Some(error) = finished.error {
        println!("{}", serde_json::to_string_pretty(&error.0)?);
      }
    }

    Commands::Enqueue { workflow_file, input } => {
      let run_id = enqueue_run(&store, &workflow_file, input).await?;
      println!("{run_id}");
    }

    Commands::Worker { poll_ms, heartbeat_secs, stale_secs } => {
      let config = WorkerConfig {
        poll_interval: Duration::from_millis(poll_ms),
        heartbeat_interval: Duration::from_secs(heartbeat_secs),
        stale_timeout: Duration::from_secs(stale_secs),
        ..WorkerConfig::default()
      };
      let worker = QueueWorker::new(store, default_registry(), config);
      let cancel = CancellationToken::new();
      let signal_cancel = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          signal_cancel.cancel();
        }
      });
      worker.run(cancel).await;
    }

    Commands::Status { run_id } => {
      let run = store.get_run(&run_id).await?;
      println!("run {}: {:?}", run.id, run.status);
      for task in store.list_node_tasks(&run_id).await? {
        let iteration = task
          .iteration
          .map(|i| format!(" (iteration {i})"))
          .unwrap_or_default();
        println!("  [{:>3}] {}{}: {:?}", task.run_seq, task.node_id, iteration, task.status);
      }
    }

    Commands::Logs { run_id, after } => {
      for log in store.get_logs(&run_id, after, 1000).await? {
        let payload = log
          .payload
          .map(|p| serde_json::to_string(&p.0).unwrap_or_default())
          .unwrap_or_default();
        println!("{:>5} {:?} {} {}", log.seq, log.level, log.event, payload);
      }
    }

    Commands::Cancel { run_id } => {
      if store.cancel_run(&run_id).await? {
        println!("run {run_id} cancelled");
      } else {
        bail!("run {run_id} is not queued or running");
      }
    }
  }

  Ok(())
}

/// The built-in registry: just the echo capability. Real deployments
/// register their model/tool capabilities here.
fn default_registry() -> Arc<CapabilityRegistry> {
  let mut registry = CapabilityRegistry::new();
  registry.register("echo", Arc::new(EchoCapability));
  Arc::new(registry)
}

async fn enqueue_run(
  store: &SqliteStore,
  workflow_file: &PathBuf,
  input: Option<String>,
) -> Result<String> {
  let content = tokio::fs::read_to_string(workflow_file)
    .await
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;
  let def = WorkflowDef::from_json(&content)
    .with_context(|| format!("failed to parse workflow file: {}", workflow_file.display()))?;

  // Reject graphs that cannot execute before creating any run state.
  larkspur_engine::compile(&def, &default_registry())
    .context("workflow failed to compile")?;

  let input = match input {
    Some(text) => serde_json::from_str(&text).context("failed to parse --input JSON")?,
    None => {
      let mut buffer = String::new();
      io::stdin().read_to_string(&mut buffer).context("failed to read stdin")?;
      if buffer.trim().is_empty() {
        serde_json::Value::Null
      } else {
        serde_json::from_str(&buffer).context("failed to parse stdin JSON")?
      }
    }
  };

  let release = Release::from_def("default", 1, &def)?;
  store.create_release(&release).await?;
  let run = store
    .create_run(&NewRun {
      workflow_id: release.workflow_id.clone(),
      release_id: release.id,
      input: Some(input),
      created_by: None,
    })
    .await?;
  Ok(run.id)
}
