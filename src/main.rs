use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fanout_config::{Settings, TlsSettings};
use fanout_pool::{BlockingPool, FatalSink};
use fanout_runtime::{
  Diagnostics, InvocationOptions, Orchestrator, OrchestratorConfig, Submission, Transport, Worker,
  WorkerError, WorkerReport,
};
use fanout_workflow::TaskInput;

/// Fanout - recursive fan-out task orchestration harness
#[derive(Parser)]
#[command(name = "fanout")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Settings file (default: ~/.fanout/config.json, when present)
  #[arg(long, global = true, env = "FANOUT_CONFIG")]
  config: Option<PathBuf>,

  #[command(flatten)]
  transport: TransportArgs,

  #[command(subcommand)]
  command: Option<Commands>,
}

/// Overrides for the transport section of the settings file.
#[derive(Args)]
struct TransportArgs {
  #[arg(long, global = true, env = "FANOUT_URI")]
  uri: Option<String>,

  #[arg(long, global = true, env = "FANOUT_NAMESPACE")]
  namespace: Option<String>,

  #[arg(long, global = true, env = "FANOUT_QUEUE_NAME")]
  queue_name: Option<String>,

  #[arg(long, global = true, env = "FANOUT_TASK_PREFIX")]
  task_prefix: Option<String>,

  /// Client certificate (PEM)
  #[arg(long, global = true, env = "FANOUT_TLS_CERT_PATH")]
  tls_cert_path: Option<PathBuf>,

  /// Client private key (PEM)
  #[arg(long, global = true, env = "FANOUT_TLS_KEY_PATH")]
  tls_key_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
  /// Submit one invocation and print its result
  Trigger {
    /// Delay in seconds, slept by the task and by each activity
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Number of child tasks
    #[arg(long, default_value_t = 0)]
    sub_workflows: u32,

    /// Number of leaf activities
    #[arg(long, default_value_t = 1)]
    sub_activities: u32,

    #[arg(long, default_value = "hello world")]
    text: String,
  },

  /// Serve invocations read as JSON lines from stdin until a fatal error
  Worker {
    /// Execution slots for leaf activities
    #[arg(long, env = "FANOUT_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Log runtime diagnostics every N seconds
    #[arg(long, env = "FANOUT_DIAGNOSTICS_INTERVAL")]
    diagnostics_interval: Option<u64>,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing();

  let Some(command) = cli.command else {
    println!("fanout - use --help to see available commands");
    return Ok(());
  };

  let mut settings = load_settings(cli.config.as_deref(), &cli.transport)?;

  let rt = tokio::runtime::Runtime::new()?;
  match command {
    Commands::Trigger {
      timeout,
      sub_workflows,
      sub_activities,
      text,
    } => {
      let input = TaskInput::new(text, timeout, sub_workflows, sub_activities)
        .context("invalid trigger arguments")?;
      rt.block_on(trigger(&settings, input))
    }
    Commands::Worker {
      pool_size,
      diagnostics_interval,
    } => {
      if let Some(pool_size) = pool_size {
        settings.worker.pool_size = pool_size;
      }
      if diagnostics_interval.is_some() {
        settings.worker.diagnostics_interval_secs = diagnostics_interval;
      }
      settings.validate().context("invalid worker settings")?;
      rt.block_on(worker(&settings))
    }
  }
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fanout=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

/// File (explicit or default), then flag and environment overrides, then
/// validation. Nothing is submitted unless this succeeds.
fn load_settings(config: Option<&Path>, overrides: &TransportArgs) -> Result<Settings> {
  let path = config.map(Path::to_path_buf).or_else(default_config_path);
  let mut settings = match path {
    Some(path) => Settings::from_file(&path)
      .with_context(|| format!("failed to load settings from {}", path.display()))?,
    None => Settings::default(),
  };

  let transport = &mut settings.transport;
  if let Some(uri) = &overrides.uri {
    transport.uri = uri.clone();
  }
  if let Some(namespace) = &overrides.namespace {
    transport.namespace = namespace.clone();
  }
  if let Some(queue_name) = &overrides.queue_name {
    transport.queue_name = queue_name.clone();
  }
  if let Some(task_prefix) = &overrides.task_prefix {
    transport.task_prefix = task_prefix.clone();
  }
  if let Some(tls) = TlsSettings::from_parts(
    overrides.tls_cert_path.clone(),
    overrides.tls_key_path.clone(),
  )? {
    transport.tls = Some(tls);
  }

  settings.validate().context("invalid settings")?;

  if !settings.transport.uri.starts_with("memory://") {
    bail!(
      "unsupported transport uri '{}': only memory:// is built in",
      settings.transport.uri
    );
  }
  // Only the in-process transport exists, so the TLS files are read to
  // validate them and then dropped.
  if let Some(tls) = &settings.transport.tls {
    tls.load().context("failed to load TLS material")?;
  }

  Ok(settings)
}

fn default_config_path() -> Option<PathBuf> {
  dirs::home_dir()
    .map(|home| home.join(".fanout").join("config.json"))
    .filter(|path| path.exists())
}

fn build_orchestrator(settings: &Settings) -> Orchestrator {
  let config = OrchestratorConfig {
    task_prefix: settings.transport.task_prefix.clone(),
    task_queue: settings.transport.queue_name.clone(),
    ..OrchestratorConfig::default()
  };
  let pool = BlockingPool::new(settings.worker.pool_size, FatalSink::new());
  Orchestrator::new(config, Arc::new(pool))
}

async fn trigger(settings: &Settings, input: TaskInput) -> Result<()> {
  let orchestrator = build_orchestrator(settings);
  let transport: &dyn Transport = &orchestrator;

  let submission = Submission::new(input).with_options(InvocationOptions::default());
  let id = transport
    .submit(submission)
    .await
    .context("failed to submit invocation")?;
  info!(
    invocation_id = %id,
    namespace = %settings.transport.namespace,
    queue = %settings.transport.queue_name,
    "invocation submitted"
  );

  let output = transport
    .await_result(&id)
    .await
    .with_context(|| format!("invocation {id} failed"))?;

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn worker(settings: &Settings) -> Result<()> {
  let orchestrator = build_orchestrator(settings);
  let diagnostics = settings
    .worker
    .diagnostics_interval_secs
    .map(|secs| Diagnostics::start(orchestrator.clone(), Duration::from_secs(secs)));

  let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
  let worker = Worker::new(orchestrator).with_reports(reports_tx);
  let cancel = CancellationToken::new();

  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, stopping worker");
        cancel.cancel();
      }
    });
  }

  let printer = tokio::spawn(async move {
    while let Some(report) = reports_rx.recv().await {
      print_report(report);
    }
  });

  let result = serve(worker, tokio::io::stdin(), cancel).await;

  if let Some(diagnostics) = diagnostics {
    diagnostics.stop().await;
  }
  join_printer(printer).await;

  result.context("worker stopped")
}

/// Wait for the report printer. A panic there is logged, not propagated.
async fn join_printer(printer: JoinHandle<()>) {
  if let Err(err) = printer.await {
    warn!(error = %err, "report printer ended abnormally");
  }
}

/// Feed newline-delimited `TaskInput`s from `input` to the worker.
///
/// End of input does not stop serving: a sender is held until the worker
/// returns, so only cancellation or a pool fault ends the loop.
async fn serve<R>(worker: Worker, input: R, cancel: CancellationToken) -> Result<(), WorkerError>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  let sender = worker.sender();
  let reader = tokio::spawn(read_submissions(input, sender.clone()));

  let result = worker.start(cancel).await;

  drop(sender);
  reader.abort();
  result
}

async fn read_submissions<R>(input: R, sender: mpsc::Sender<Submission>)
where
  R: AsyncRead + Unpin,
{
  let mut lines = BufReader::new(input).lines();
  loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => {
        info!("end of input, still serving");
        break;
      }
      Err(e) => {
        warn!(error = %e, "failed to read stdin");
        break;
      }
    };
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<TaskInput>(&line) {
      Ok(input) => {
        if sender.send(Submission::new(input)).await.is_err() {
          break;
        }
      }
      Err(e) => warn!(error = %e, "skipping malformed task input"),
    }
  }
}

fn print_report(report: WorkerReport) {
  let line = match report.result {
    Ok(output) => serde_json::json!({ "id": report.id, "output": output }),
    Err(err) => serde_json::json!({ "id": report.id, "error": err.chain() }),
  };
  println!("{line}");
}
