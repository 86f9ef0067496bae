use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_engine::{Engine, EngineConfig, Role, StorageConfig};
use weft_plugin::PluginRegistry;

/// Weft - a distributed workflow orchestration engine
#[derive(Parser)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.weft)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine config file (default: <data-dir>/config.toml when present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Emit logs as JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the configured roles until interrupted
  Serve {
    /// Directory of flow documents to deploy (overrides `flows_dir`)
    #[arg(long)]
    flows: Option<PathBuf>,
  },

  /// Run one flow to completion and print the execution as JSON.
  /// Inputs are read as a JSON object from stdin.
  Run {
    /// Path to the flow file (YAML or JSON)
    flow_file: PathBuf,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
  },

  /// Check a flow document without running it
  Validate {
    /// Path to the flow file (YAML or JSON)
    flow_file: PathBuf,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.json);

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".weft"),
  };

  let Some(command) = cli.command else {
    println!("weft - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let config = load_config(cli.config.as_deref(), &data_dir).await?;
    match command {
      Commands::Serve { flows } => serve(config, flows, data_dir).await,
      Commands::Run { flow_file, timeout } => run_flow(config, &flow_file, timeout).await,
      Commands::Validate { flow_file } => validate(config, &flow_file).await,
    }
  })
}

fn init_tracing(json: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(io::stderr);
  if json {
    builder.json().init();
  } else {
    builder.init();
  }
}

async fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<EngineConfig> {
  let default_path = data_dir.join("config.toml");
  let path = match path {
    Some(path) => path.to_path_buf(),
    None if tokio::fs::try_exists(&default_path).await.unwrap_or(false) => default_path,
    None => return Ok(EngineConfig::default()),
  };

  let text = tokio::fs::read_to_string(&path)
    .await
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  toml::from_str(&text).with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn registry() -> Result<PluginRegistry> {
  let mut registry = PluginRegistry::new();
  weft_core_plugins::register_all(&mut registry).context("failed to register core plugins")?;
  Ok(registry)
}

async fn serve(mut config: EngineConfig, flows: Option<PathBuf>, data_dir: PathBuf) -> Result<()> {
  if flows.is_some() {
    config.flows_dir = flows;
  }
  if config.blobs_dir.is_none() {
    config.blobs_dir = Some(data_dir.join("blobs"));
  }

  let engine = Engine::builder(config, registry()?)
    .build()
    .await
    .context("failed to start engine")?;
  let engine = Arc::new(engine);

  let cancel = CancellationToken::new();
  let shutdown = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("shutdown requested");
    }
    shutdown.cancel();
  });

  engine.start(cancel).await.context("engine failed")
}

async fn run_flow(mut config: EngineConfig, flow_file: &Path, timeout: u64) -> Result<()> {
  let text = tokio::fs::read_to_string(flow_file)
    .await
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  let inputs = match read_payload_from_stdin()? {
    serde_json::Value::Object(map) => map,
    serde_json::Value::Null => serde_json::Map::new(),
    other => anyhow::bail!("inputs must be a JSON object, got {other}"),
  };

  // A one-off run executes in this process; triggers are not evaluated.
  config.flows_dir = None;
  config.roles = vec![Role::Executor, Role::Worker];
  let engine = Engine::builder(config, registry()?)
    .build()
    .await
    .context("failed to start engine")?;
  let flow = engine
    .deploy_str(&text)
    .await
    .with_context(|| format!("invalid flow: {}", flow_file.display()))?;
  eprintln!("Loaded flow: {}.{}", flow.namespace, flow.id);

  let engine = Arc::new(engine);
  let cancel = CancellationToken::new();
  let roles = tokio::spawn(engine.clone().start(cancel.clone()));

  let result = async {
    let id = engine.submit(&flow.namespace, &flow.id, inputs).await?;
    eprintln!("Execution: {id}");
    engine.wait_for(&id, Duration::from_secs(timeout)).await
  }
  .await;

  cancel.cancel();
  roles.await.context("engine task failed")??;

  let execution = result.context("execution failed")?;
  eprintln!("Execution ended: {}", execution.state);
  println!("{}", serde_json::to_string_pretty(&execution)?);
  Ok(())
}

async fn validate(config: EngineConfig, flow_file: &Path) -> Result<()> {
  let text = tokio::fs::read_to_string(flow_file)
    .await
    .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
  let config = EngineConfig {
    flows_dir: None,
    storage: StorageConfig::Memory,
    ..config
  };
  let engine = Engine::builder(config, registry()?)
    .build()
    .await
    .context("failed to start engine")?;
  let flow = engine
    .deploy_str(&text)
    .await
    .with_context(|| format!("invalid flow: {}", flow_file.display()))?;
  println!(
    "{}.{}: {} tasks, {} triggers",
    flow.namespace,
    flow.id,
    flow.tasks.len(),
    flow.triggers.len()
  );
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(serde_json::Value::Null);
  }
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read inputs from stdin")?;
  if input.trim().is_empty() {
    Ok(serde_json::Value::Null)
  } else {
    serde_json::from_str(&input).context("failed to parse inputs JSON from stdin")
  }
}
