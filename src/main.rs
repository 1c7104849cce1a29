use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use multigrain::config::{
    CycleTimings, DiscoveryConfig, DispatcherConfig, NatsConfig, QueueBackend, QueueConfig,
    WorkerConfig, DEFAULT_INGRESS_TOPIC, DEFAULT_NAMESPACE,
};
use multigrain::directory::ServiceInstance;
use multigrain::dispatcher::api::{
    DeregisterResponse, Listing, RegisterRequest, RegisterResponse, JOBS_PATH, RESULTS_PATH,
    SERVICES_PATH,
};
use multigrain::dispatcher::JobResult;
use multigrain::error::ErrorResponse;
use multigrain::node::{DispatcherNode, WorkerNode};
use multigrain::shutdown::install_shutdown_handler;
use multigrain::worker::{DeviceSettings, SchemaVersion};

#[derive(Parser, Debug)]
#[command(name = "multigrain")]
#[command(version)]
#[command(about = "Dispatcher and worker runtime for cook-cycle devices")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher (directory, job queue, dispatch loop)
    Dispatcher(DispatcherArgs),

    /// Run a worker device
    Worker(WorkerArgs),

    /// Job commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Service directory commands
    Service {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ServiceCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DispatcherArgs {
    /// Port to listen on
    #[arg(long, default_value = "3010")]
    port: u16,

    /// Namespace workers are discovered in
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Topic jobs are published to
    #[arg(long, default_value = DEFAULT_INGRESS_TOPIC)]
    topic: String,

    /// Queue backend holding submitted jobs
    #[arg(long, default_value = "memory")]
    queue: QueueKind,

    /// Partitions per topic (memory queue)
    #[arg(long, default_value = "1")]
    partitions: usize,

    /// Records kept per partition once consumed; 0 keeps everything
    #[arg(long, default_value = "10000")]
    max_retained: usize,

    /// NATS server URL (nats queue)
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// JetStream stream name (nats queue)
    #[arg(long, default_value = "MULTIGRAIN")]
    nats_stream: String,

    /// Settings schema version pushed to workers (0.0.1 or 0.0.2)
    #[arg(long, default_value = "0.0.2")]
    schema_version: SchemaVersion,

    /// Passes over the directory before a job is dropped
    #[arg(long, default_value = "5")]
    max_cycles: u32,

    /// Base backoff between passes, in milliseconds
    #[arg(long, default_value = "500")]
    backoff_ms: u64,

    /// Status probe timeout, in milliseconds
    #[arg(long, default_value = "2000")]
    probe_timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QueueKind {
    Memory,
    Nats,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Device name, unique within its namespace
    #[arg(long, default_value = "toaster-1")]
    name: String,

    /// Port to listen on
    #[arg(long, default_value = "3020")]
    port: u16,

    /// Host the dispatcher should use to reach this worker
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Namespace to register under
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Dispatcher to register with (e.g. http://127.0.0.1:3010)
    #[arg(long)]
    dispatcher: Option<String>,

    /// Schema version of the factory settings
    #[arg(long, default_value = "0.0.1")]
    schema_version: SchemaVersion,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dispatcher address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:3010")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Cooking mode
        #[arg(long, default_value = "bagel")]
        mode: String,

        /// Cook level
        #[arg(long, default_value = "1")]
        level: u32,

        /// Raw preferences JSON; overrides --mode and --level
        #[arg(long)]
        preferences: Option<String>,
    },
    /// List completed jobs
    Results,
}

#[derive(clap::Subcommand, Debug)]
enum ServiceCommands {
    /// Register a worker
    Register {
        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        name: String,
    },
    /// Remove a worker by urn (urn:<namespace>:<name>)
    Deregister { urn: String },
    /// List workers in a namespace
    List {
        #[arg(default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_dispatcher(args: DispatcherArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = DispatcherConfig {
        listen_addr,
        namespace: args.namespace,
        ingress_topic: args.topic,
        schema_version: args.schema_version,
        discovery: DiscoveryConfig {
            max_cycles: args.max_cycles,
            base_delay: Duration::from_millis(args.backoff_ms),
            probe_timeout: Duration::from_millis(args.probe_timeout_ms),
        },
        queue: QueueConfig {
            partitions: args.partitions,
            max_retained: (args.max_retained > 0).then_some(args.max_retained),
            backend: match args.queue {
                QueueKind::Memory => QueueBackend::Memory,
                QueueKind::Nats => {
                    QueueBackend::Nats(NatsConfig::new(args.nats_url).with_stream(args.nats_stream))
                }
            },
        },
        ..DispatcherConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        namespace = %config.namespace,
        schema_version = %config.schema_version,
        max_cycles = config.discovery.max_cycles,
        queue = ?args.queue,
        "Starting multigrain dispatcher"
    );

    let shutdown = install_shutdown_handler()?;
    DispatcherNode::new(config, shutdown).run().await
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = WorkerConfig {
        name: args.name,
        listen_addr,
        advertise_host: args.advertise_host,
        namespace: args.namespace,
        dispatcher_url: args.dispatcher,
        timings: CycleTimings::default(),
        initial_settings: DeviceSettings::preset(args.schema_version),
    };

    tracing::info!(
        worker = %config.name,
        listen_addr = %config.listen_addr,
        dispatcher = ?config.dispatcher_url,
        "Starting multigrain worker"
    );

    let shutdown = install_shutdown_handler()?;
    WorkerNode::new(config, shutdown).run().await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => Err(format!("{} ({})", body.error, status).into()),
        Err(_) => Err(format!("request failed ({})", status).into()),
    }
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    mode: String,
    level: u32,
    preferences: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let body: Value = match preferences {
        Some(raw) => serde_json::from_str(&raw)?,
        None => json!({ "mode": mode, "level": level }),
    };

    let response = http
        .post(format!("{}{}", client.addr, JOBS_PATH))
        .json(&body)
        .send()
        .await?;
    let accepted: Value = read_json(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&accepted)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:  {}", accepted["id"].as_str().unwrap_or("-"));
            println!("URN:     {}", accepted["urn"].as_str().unwrap_or("-"));
            println!();
            println!("Completion is reported asynchronously; check `multigrain job results`.");
        }
    }
    Ok(())
}

async fn handle_job_results(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}{}", client.addr, RESULTS_PATH))
        .send()
        .await?;
    let listing: Listing<JobResult> = read_json(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
        OutputFormat::Table => {
            println!("{:<38} {:<16} {:<25}", "JOB ID", "DEVICE", "COMPLETED");
            println!("{}", "-".repeat(80));
            for result in &listing.entries {
                println!(
                    "{:<38} {:<16} {:<25}",
                    result.id,
                    result.device_name,
                    result.timestamp.to_rfc3339()
                );
            }
            println!("\nTotal: {} results", listing.count);
        }
    }
    Ok(())
}

async fn handle_service_command(
    http: &reqwest::Client,
    client: &ClientArgs,
    command: ServiceCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ServiceCommands::Register {
            namespace,
            host,
            port,
            name,
        } => {
            let request = RegisterRequest {
                namespace,
                host,
                port,
                name,
            };
            let response = http
                .post(format!("{}{}", client.addr, SERVICES_PATH))
                .json(&request)
                .send()
                .await?;
            let registered: RegisterResponse = read_json(response).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&registered)?),
                OutputFormat::Table => println!("Registered {}", registered.instance_id),
            }
        }
        ServiceCommands::Deregister { urn } => {
            let response = http
                .delete(format!("{}{}/{}", client.addr, SERVICES_PATH, urn))
                .send()
                .await?;
            let deregistered: DeregisterResponse = read_json(response).await?;
            match client.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&deregistered)?)
                }
                OutputFormat::Table => {
                    for instance in &deregistered.removed {
                        println!("Removed {} ({}:{})", instance.name, instance.host, instance.port);
                    }
                }
            }
        }
        ServiceCommands::List { namespace } => {
            let response = http
                .get(format!("{}{}/{}", client.addr, SERVICES_PATH, namespace))
                .send()
                .await?;
            let listing: Listing<ServiceInstance> = read_json(response).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
                OutputFormat::Table => {
                    println!("{:<16} {:<22} {:<25}", "NAME", "ADDRESS", "REGISTERED");
                    println!("{}", "-".repeat(64));
                    for instance in &listing.entries {
                        println!(
                            "{:<16} {:<22} {:<25}",
                            instance.name,
                            format!("{}:{}", instance.host, instance.port),
                            instance.registered_at.to_rfc3339()
                        );
                    }
                    println!("\nTotal: {} services", listing.count);
                }
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

    match args.command {
        Commands::Dispatcher(dispatcher_args) => {
            run_dispatcher(dispatcher_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit {
                    mode,
                    level,
                    preferences,
                } => {
                    handle_job_submit(&http, &client, mode, level, preferences).await?;
                }
                JobCommands::Results => {
                    handle_job_results(&http, &client).await?;
                }
            }
        }
        Commands::Service { client, command } => {
            let http = reqwest::Client::new();
            handle_service_command(&http, &client, command).await?;
        }
    }

    Ok(())
}
