use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use deploy_relay::api::{self, ApiState};
use deploy_relay::cipher::Cipher;
use deploy_relay::config::{RegistryConfig, RuntimeConfig, ServiceConfig};
use deploy_relay::dispatch::Dispatcher;
use deploy_relay::registry::WorkerRegistry;
use deploy_relay::runtime::{ContainerFilter, DockerCli, WorkerLister, WorkerSnapshot};
use deploy_relay::shutdown::install_shutdown_handler;
use deploy_relay::store::{MemoryStore, Stores};

#[derive(Parser, Debug)]
#[command(name = "deploy-relay")]
#[command(version)]
#[command(about = "Dispatch stored scripts to remote hosts through sandboxed workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API
    Serve(ServeArgs),

    /// Print a fresh hex-encoded nonce
    Nonce,

    /// Print a fresh hex-encoded 32-byte encryption key
    Keygen,

    /// Encrypt a value for storage
    Encrypt(CryptArgs),

    /// Decrypt a stored value
    Decrypt(CryptArgs),

    /// List worker containers known to the runtime
    Workers(WorkersArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct KeyArgs {
    /// Hex-encoded 32-byte AES key
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: String,
}

#[derive(Parser, Debug)]
struct RuntimeArgs {
    /// Container name marker identifying workers
    #[arg(long, env = "WORKER_NAME", default_value = "deployment-worker")]
    worker_name: String,

    /// Docker binary to invoke
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Timeout for a single runtime call, in seconds
    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value = "600")]
    exec_timeout_secs: u64,

    /// Also consider stopped containers
    #[arg(long)]
    include_stopped: bool,
}

impl RuntimeArgs {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            docker_bin: self.docker_bin.clone(),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
        }
    }
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address for the HTTP API
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    #[command(flatten)]
    key: KeyArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,

    /// How long a worker listing stays fresh, in seconds
    #[arg(long, env = "WORKER_CACHE_TTL_SECS", default_value = "60")]
    cache_ttl_secs: u64,

    /// Period of the background worker refresh, in seconds
    #[arg(long, env = "WORKER_REFRESH_INTERVAL_SECS", default_value = "30")]
    refresh_interval_secs: u64,

    /// JSON file with encrypted scripts, servers and secrets
    #[arg(long, env = "RECORDS_FILE")]
    records: Option<PathBuf>,

    /// Maximum number of executions kept for status polling
    #[arg(long, env = "EXECUTION_LOG_CAPACITY", default_value = "10000")]
    execution_log_capacity: usize,

    /// Verify target host keys instead of accepting them
    #[arg(long)]
    strict_host_key_checking: bool,
}

#[derive(Parser, Debug)]
struct CryptArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Hex-encoded 12-byte nonce
    #[arg(long)]
    nonce: String,

    /// Value to encrypt or decrypt
    value: String,
}

#[derive(Parser, Debug)]
struct WorkersArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct WorkerListOutput {
    workers: Vec<WorkerSnapshot>,
    total_count: usize,
}

// =============================================================================
// Commands
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let registry_config = RegistryConfig {
        include_stopped: args.runtime.include_stopped,
        ..RegistryConfig::default()
    }
    .with_marker(args.runtime.worker_name.clone())
    .with_ttl(Duration::from_secs(args.cache_ttl_secs))
    .with_refresh_interval(Duration::from_secs(args.refresh_interval_secs));

    let mut config = ServiceConfig::new(args.listen, SecretString::from(args.key.encryption_key))
        .with_registry(registry_config)
        .with_runtime(args.runtime.runtime_config());
    config.ssh.strict_host_key_checking = args.strict_host_key_checking;
    config.executions.capacity = args.execution_log_capacity;

    let cipher = Arc::new(Cipher::new(config.encryption_key.clone()));
    cipher.validate()?;

    let store = match &args.records {
        Some(path) => MemoryStore::load(cipher.clone(), path).await?,
        None => {
            tracing::warn!("No records file given, starting with an empty store");
            MemoryStore::new(cipher.clone())
        }
    };

    let runtime = Arc::new(DockerCli::new(config.runtime.clone()));
    let registry = Arc::new(WorkerRegistry::new(runtime.clone(), &config.registry));

    match registry.refresh().await {
        Ok(workers) => {
            tracing::info!(count = workers.len(), "Initial worker discovery complete");
            for worker in &workers {
                tracing::info!(worker_id = %worker.id, name = %worker.name, status = %worker.status, "Found worker");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Initial worker discovery failed, relying on auto-refresh");
        }
    }

    let shutdown = install_shutdown_handler();
    let refresh_task = registry
        .clone()
        .run_auto_refresh(shutdown.clone(), config.registry.refresh_interval);

    let dispatcher = Dispatcher::new(Stores::shared(Arc::new(store)), registry, runtime)
        .with_ssh_options(config.ssh.clone())
        .with_execution_capacity(config.executions.capacity);

    tracing::info!(
        execution_log_capacity = dispatcher.execution_capacity(),
        "Dispatcher ready"
    );

    let state = ApiState {
        dispatcher: Arc::new(dispatcher),
    };

    let result = api::run_server(config.listen_addr, state, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = refresh_task.await {
        tracing::warn!(error = %e, "Auto-refresh task ended abnormally");
    }

    result?;
    Ok(())
}

fn run_crypt(args: CryptArgs, encrypt: bool) -> Result<(), Box<dyn std::error::Error>> {
    let cipher = Cipher::new(SecretString::from(args.key.encryption_key));
    let output = if encrypt {
        cipher.encrypt(&args.value, &args.nonce)?
    } else {
        cipher.decrypt(&args.value, &args.nonce)?
    };
    println!("{}", output);
    Ok(())
}

async fn run_workers(args: WorkersArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cli = DockerCli::new(args.runtime.runtime_config());
    let mut filter = ContainerFilter::new(args.runtime.worker_name.clone());
    filter.include_stopped = args.runtime.include_stopped;

    let workers: Vec<WorkerSnapshot> = cli
        .list(&filter)
        .await?
        .into_iter()
        .filter(|w| filter.matches(&w.name))
        .collect();

    match args.output {
        OutputFormat::Json => {
            let output = WorkerListOutput {
                total_count: workers.len(),
                workers,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers found.");
            } else {
                println!("{:<14} {:<32} {:<22} CREATED", "ID", "NAME", "STATUS");
                println!("{}", "-".repeat(90));
                for worker in &workers {
                    let created = worker
                        .created_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<14} {:<32} {:<22} {}",
                        worker.id, worker.name, worker.status, created
                    );
                }
                println!();
                println!("{} worker(s)", workers.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so command output stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Nonce => println!("{}", Cipher::new_nonce()),
        Commands::Keygen => println!("{}", Cipher::new_key()),
        Commands::Encrypt(crypt_args) => run_crypt(crypt_args, true)?,
        Commands::Decrypt(crypt_args) => run_crypt(crypt_args, false)?,
        Commands::Workers(workers_args) => run_workers(workers_args).await?,
    }

    Ok(())
}
