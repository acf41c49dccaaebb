use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use taskgrid::agent::{self, Agent, ShellExecutor};
use taskgrid::config::{ports, AgentConfig, CoordinatorConfig, DispatcherConfig};
use taskgrid::coordinator::Coordinator;
use taskgrid::dispatcher::{self, Dispatcher, JobStats, QueueTaskProvider};
use taskgrid::grpc::{self, CoordinatorConnection, GrpcAgentConnector};
use taskgrid::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "taskgrid")]
#[command(version)]
#[command(about = "Fair-share task distribution across a pool of remote agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator that assigns agents to dispatchers
    Coordinator(CoordinatorArgs),

    /// Run an agent that executes shell tasks
    Agent(AgentArgs),

    /// Submit a job of shell commands and drive it to completion
    Dispatch(DispatchArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = ports::COORDINATOR)]
    port: u16,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value_t = ports::AGENT)]
    port: u16,

    /// Coordinator address
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    coordinator: String,

    /// Tasks run concurrently on this agent
    #[arg(long, default_value = "1")]
    capacity: u32,

    /// Agent name (generated when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Host advertised to dispatchers
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,
}

#[derive(Parser, Debug)]
struct DispatchArgs {
    /// Coordinator address
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    coordinator: String,

    /// Job priority; higher wins agents first
    #[arg(long, default_value = "0")]
    priority: i32,

    /// Job configuration handed to every agent (JSON object)
    #[arg(long)]
    config: Option<String>,

    /// File with one shell command per line (stdin when omitted)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Host advertised to the coordinator
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

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
struct JobSummaryOutput {
    job_id: String,
    priority: i32,
    completed: bool,
    started_at: String,
    finished_at: String,
    elapsed_ms: i64,
    stats: JobStats,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Roles
// =============================================================================

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = CoordinatorConfig::new(listen_addr);
    let token = install_shutdown_handler();

    let (coordinator, outbox) = Coordinator::new(&config);
    tokio::spawn(coordinator.clone().run_outbox(outbox, token.clone()));

    let listener = grpc::bind(config.listen_addr).await?;
    grpc::serve_coordinator(listener, coordinator, token).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = AgentConfig::new(listen_addr)
        .with_capacity(args.capacity)
        .with_coordinator(args.coordinator);
    config.advertise_host = args.advertise_host;
    let token = install_shutdown_handler();

    let info = agent::endpoint_info(&config, args.name);
    tracing::info!(
        agent = %info.name,
        listen_addr = %config.listen_addr,
        rpc_url = %info.rpc_url,
        capacity = config.capacity,
        "Starting agent"
    );

    let executor = Arc::new(ShellExecutor::new(config.capacity));
    let agent = Agent::new(info.clone(), config.capacity, executor);

    // the server outlives the signal so the going-away notice can be sent
    let server_token = CancellationToken::new();
    let listener = grpc::bind(config.listen_addr).await?;
    let server = tokio::spawn(grpc::serve_agent(
        listener,
        agent.clone(),
        server_token.clone(),
    ));

    grpc::register_agent(
        &config.coordinator_url,
        info,
        &config.connection,
        token.clone(),
    )?;

    token.cancelled().await;
    agent.shutdown();
    server_token.cancel();
    server.await??;
    Ok(())
}

async fn run_dispatch(args: DispatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let job_config: Value = match &args.config {
        Some(text) => serde_json::from_str(text)?,
        None => Value::Null,
    };
    let provider = match &args.file {
        Some(path) => QueueTaskProvider::from_lines(
            job_config,
            BufReader::new(std::fs::File::open(path)?),
        )?,
        None => QueueTaskProvider::from_lines(job_config, std::io::stdin().lock())?,
    };

    let config = DispatcherConfig::default()
        .with_coordinator(args.coordinator)
        .with_advertise_host(args.advertise_host);
    let token = install_shutdown_handler();
    let info = dispatcher::endpoint_info(&config);

    let (coordinator, pushes) = CoordinatorConnection::open(
        &config.coordinator_url,
        info.clone(),
        &config.connection,
        token.child_token(),
    )?;
    let connector = Arc::new(GrpcAgentConnector::new(
        config.connection.clone(),
        token.child_token(),
    ));
    let (dispatcher, job_events) =
        Dispatcher::new(info, Arc::new(coordinator), connector, &config.connection);

    let run_token = token.child_token();
    let runner = tokio::spawn(dispatcher.clone().run(job_events, pushes, run_token.clone()));

    let started_at = chrono::Utc::now();
    let job = dispatcher.submit(Box::new(provider), args.priority)?;
    tracing::info!(job = %job.name(), tasks = job.task_count(), "Dispatching");

    tokio::select! {
        _ = job.wait_completed() => {}
        _ = token.cancelled() => tracing::warn!(job = %job.name(), "Interrupted before completion"),
    }
    run_token.cancel();
    runner.await?;
    token.cancel();

    let finished_at = chrono::Utc::now();
    let summary = JobSummaryOutput {
        job_id: job.name().to_string(),
        priority: job.priority(),
        completed: job.is_completed(),
        started_at: started_at.to_rfc3339(),
        finished_at: finished_at.to_rfc3339(),
        elapsed_ms: (finished_at - started_at).num_milliseconds(),
        stats: job.stats(),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("Job Summary");
            println!("{}", "=".repeat(40));
            println!("Job ID:    {}", summary.job_id);
            println!("Priority:  {}", summary.priority);
            println!("Completed: {}", summary.completed);
            println!("Elapsed:   {} ms", summary.elapsed_ms);
            println!();
            println!("{:<12} {:<12} {:<12} {:<12}", "SUCCEEDED", "FAILED", "RUNNING", "PENDING");
            println!("{}", "-".repeat(48));
            println!(
                "{:<12} {:<12} {:<12} {:<12}",
                summary.stats.succeeded,
                summary.stats.failed,
                summary.stats.running,
                summary.stats.pending
            );
        }
    }

    if !summary.completed || summary.stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Coordinator(coordinator_args) => run_coordinator(coordinator_args).await?,
        Commands::Agent(agent_args) => run_agent(agent_args).await?,
        Commands::Dispatch(dispatch_args) => run_dispatch(dispatch_args).await?,
    }

    Ok(())
}
