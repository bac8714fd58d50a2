use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rpa_dispatch::client::ApiClient;
use rpa_dispatch::config::{AgentConfig, OrchestratorConfig};
use rpa_dispatch::fleet::{AffinityMode, LoadBalancingStrategy};
use rpa_dispatch::orchestrator::Orchestrator;
use rpa_dispatch::robot::{ProcessRunner, RobotAgent};
use rpa_dispatch::scheduler::{Job, JobSpec, JobStatus};
use rpa_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "rpa-dispatch")]
#[command(version)]
#[command(about = "Job queue and robot-fleet dispatch for RPA orchestration")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator (queue, dispatcher, lease monitor, HTTP API)
    Server(ServerArgs),

    /// Run a robot agent against an orchestrator
    Robot(RobotArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Fleet inspection commands
    Fleet {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: FleetCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Robot selection strategy
    #[arg(long, value_enum, default_value = "least-loaded")]
    strategy: LoadBalancingStrategy,

    /// How strictly routing rules bind jobs to robots
    #[arg(long, value_enum, default_value = "soft")]
    affinity_mode: AffinityMode,

    /// Dispatcher tick interval
    #[arg(long, default_value = "1000")]
    dispatch_interval_ms: u64,

    /// Pending jobs considered per dispatcher tick
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Default lease length for claimed jobs
    #[arg(long, default_value = "300")]
    visibility_timeout_secs: u64,

    /// How often expired leases are reaped (must be shorter than the lease)
    #[arg(long, default_value = "30000")]
    timeout_check_interval_ms: u64,

    /// How long finished jobs are kept before being purged
    #[arg(long, default_value = "86400")]
    finished_retention_secs: u64,

    /// Heartbeat age after which a robot is considered disconnected
    #[arg(long, default_value = "90000")]
    liveness_timeout_ms: u64,

    /// Maximum number of jobs held in the queue
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Pre-provisioned robot key, format "robot_id=crpa_<64 hex>" (repeatable)
    #[arg(long = "robot-key")]
    robot_keys: Vec<String>,
}

// =============================================================================
// Robot Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RobotArgs {
    /// Orchestrator base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// API key issued for this robot
    #[arg(long)]
    api_key: String,

    /// Robot ID the key was issued for
    #[arg(long)]
    robot_id: String,

    /// Display name (defaults to the robot ID)
    #[arg(long)]
    name: Option<String>,

    /// Capability tag (repeatable)
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    #[arg(long, default_value = "default")]
    environment: String,

    #[arg(long)]
    tenant: Option<String>,

    #[arg(long, default_value = "1")]
    max_concurrent_jobs: u32,

    #[arg(long, default_value = "2000")]
    poll_interval_ms: u64,

    #[arg(long, default_value = "15000")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "300")]
    visibility_timeout_secs: u64,

    /// Program that executes a workflow; job variables arrive on stdin
    #[arg(long)]
    program: String,

    /// Argument passed to the program (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    program_args: Vec<String>,

    /// Kill the workflow after this many seconds
    #[arg(long)]
    job_timeout_secs: Option<u64>,
}

// =============================================================================
// Client Arguments (shared by job and fleet commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Orchestrator base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
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
    /// Submit a workflow run
    Submit {
        workflow_id: String,
        workflow_name: String,

        #[arg(long, default_value = "0")]
        priority: i32,

        #[arg(long, default_value = "default")]
        environment: String,

        #[arg(long)]
        tenant: Option<String>,

        /// Required robot capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Workflow node, for node-level routing overrides
        #[arg(long)]
        node: Option<String>,

        /// Input variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List jobs
    List {
        /// Only jobs in this status (pending, running, completed, dead_letter)
        #[arg(long)]
        status: Option<JobStatus>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum FleetCommands {
    /// List registered robots
    List,
}

// =============================================================================
// Server / Robot
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = OrchestratorConfig::new(args.listen)
        .with_strategy(args.strategy)
        .with_affinity_mode(args.affinity_mode);
    config.dispatch.interval_ms = args.dispatch_interval_ms;
    config.dispatch.batch_size = args.batch_size;
    config.lease.visibility_timeout_secs = args.visibility_timeout_secs;
    config.lease.timeout_check_interval_ms = args.timeout_check_interval_ms;
    config.lease.finished_retention_secs = args.finished_retention_secs;
    config.fleet.liveness_timeout_ms = args.liveness_timeout_ms;
    config.max_jobs = args.max_jobs;

    let orchestrator = Orchestrator::new(config)?;
    for entry in &args.robot_keys {
        let (robot_id, raw_key) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid --robot-key '{entry}', expected robot_id=key"))?;
        orchestrator.authenticator.import_key(robot_id, raw_key).await?;
    }

    let shutdown = install_shutdown_handler();
    orchestrator.run(shutdown).await?;
    Ok(())
}

async fn run_robot(args: RobotArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = AgentConfig::new(args.server, args.api_key, args.robot_id);
    if let Some(name) = args.name {
        config.name = name;
    }
    config.capabilities = args.capabilities.into_iter().collect();
    config.environment = args.environment;
    config.tenant_id = args.tenant;
    config.max_concurrent_jobs = args.max_concurrent_jobs;
    config.poll_interval_ms = args.poll_interval_ms;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.visibility_timeout_secs = args.visibility_timeout_secs;

    let mut runner = ProcessRunner::new(args.program).with_args(args.program_args);
    if let Some(secs) = args.job_timeout_secs {
        runner = runner.with_timeout(Duration::from_secs(secs));
    }

    tracing::info!(
        robot_id = %config.robot_id,
        server = %config.server_url,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Starting robot agent"
    );

    let agent = RobotAgent::new(config, Arc::new(runner))?;
    agent.run(install_shutdown_handler()).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn display_opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn print_job(job: &Job) {
    println!("Job ID:        {}", job.id);
    println!("Workflow:      {} ({})", job.workflow_name, job.workflow_id);
    println!("Status:        {}", job.status);
    println!("Priority:      {}", job.priority);
    println!("Environment:   {}", job.environment);
    println!("Robot:         {}", display_opt(job.robot_id.as_deref()));
    println!("Retries:       {}/{}", job.retry_count, job.max_retries);
    println!("Created:       {}", job.created_at);
    if let Some(lease) = job.lease_expires_at {
        println!("Lease Expires: {}", lease);
    }
    if let Some(done) = job.completed_at {
        println!("Completed:     {}", done);
    }
    if let Some(error) = &job.last_error {
        println!("Last Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
    if let Some(result) = &job.result {
        println!("Result:        {}", result);
    }
}

async fn handle_job(
    client: &ApiClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            workflow_id,
            workflow_name,
            priority,
            environment,
            tenant,
            capabilities,
            node,
            variables,
            max_retries,
        } => {
            let mut spec = JobSpec::new(workflow_id, workflow_name)
                .with_priority(priority)
                .with_environment(environment);
            if let Some(tenant) = tenant {
                spec = spec.with_tenant(tenant);
            }
            for capability in capabilities {
                spec = spec.with_capability(capability);
            }
            if let Some(node) = node {
                spec = spec.with_node(node);
            }
            if let Some(variables) = variables {
                spec = spec.with_variables(serde_json::from_str(&variables)?);
            }
            if let Some(max_retries) = max_retries {
                spec = spec.with_max_retries(max_retries);
            }

            let job_id = client.submit_job(&spec).await?;
            match output {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({ "job_id": job_id }))?
                    );
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = client.get_job(job_id).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List { status } => {
            let jobs = client.list_jobs(status).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                        return Ok(());
                    }
                    println!(
                        "{:<38} {:<12} {:<4} {:<16} WORKFLOW",
                        "JOB ID", "STATUS", "PRI", "ROBOT"
                    );
                    println!("{}", "-".repeat(90));
                    for job in &jobs {
                        println!(
                            "{:<38} {:<12} {:<4} {:<16} {}",
                            job.id,
                            job.status.to_string(),
                            job.priority,
                            display_opt(job.robot_id.as_deref()),
                            job.workflow_name
                        );
                    }
                    println!();
                    println!("{} jobs", jobs.len());
                }
            }
        }
    }
    Ok(())
}

async fn handle_fleet(
    client: &ApiClient,
    command: FleetCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        FleetCommands::List => {
            let robots = client.list_robots().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&robots)?),
                OutputFormat::Table => {
                    if robots.is_empty() {
                        println!("No robots registered.");
                        return Ok(());
                    }
                    println!(
                        "{:<20} {:<14} {:<8} {:<12} LAST HEARTBEAT",
                        "ROBOT ID", "STATUS", "LOAD", "ENVIRONMENT"
                    );
                    println!("{}", "-".repeat(80));
                    for robot in &robots {
                        println!(
                            "{:<20} {:<14} {:<8} {:<12} {}",
                            robot.id,
                            robot.status.to_string(),
                            format!("{}/{}", robot.current_load, robot.max_concurrent_jobs),
                            robot.environment,
                            robot.last_heartbeat
                        );
                    }
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
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Robot(robot_args) => run_robot(robot_args).await?,
        Commands::Job { client, command } => {
            let api = ApiClient::new(client.addr)?;
            handle_job(&api, command, &client.output).await?;
        }
        Commands::Fleet { client, command } => {
            let api = ApiClient::new(client.addr)?;
            handle_fleet(&api, command, &client.output).await?;
        }
    }

    Ok(())
}
