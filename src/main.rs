use clap::{Parser, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use slurm_dash::config::ClientConfig;
use slurm_dash::connection::transport::run_transport;
use slurm_dash::events;
use slurm_dash::pages::{Page, PageKind, PageOutcome, PageUpdate};
use slurm_dash::requests::{self, JobOptions, SubmitJob, TimeLimit};
use slurm_dash::shutdown::install_shutdown_handler;
use slurm_dash::{Connection, Session, Visibility};

#[derive(Parser, Debug)]
#[command(name = "slurm-dash")]
#[command(version)]
#[command(about = "Live Slurm dashboard client over Socket.IO")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Open a dashboard page and print its live updates
    Watch {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        page: WatchPage,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster information commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Historical metrics commands
    Metrics {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: MetricsCommands,
    },
}

// =============================================================================
// Client Arguments (shared by every command)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dashboard server URL (http, https, ws or wss)
    #[arg(long, short = 'u', default_value = "http://127.0.0.1:5000")]
    url: String,

    /// Socket.IO namespace
    #[arg(long, default_value = "/")]
    namespace: String,

    /// Seconds to wait for a response
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl ClientArgs {
    fn config(&self) -> ClientConfig {
        ClientConfig::new(self.url.clone())
            .with_namespace(self.namespace.clone())
            .with_request_timeout_ms(self.timeout_secs.saturating_mul(1000))
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WatchPage {
    /// Cluster stats, recent jobs and live metrics
    Dashboard,
    /// Job list, refreshed every three minutes
    Jobs,
    /// Partition and node resources
    Resources,
    /// Job state change notifications
    Notifications,
    /// One job's details and output
    Job {
        /// The Slurm job ID
        job_id: String,
    },
}

impl WatchPage {
    fn kind(&self) -> PageKind {
        match self {
            WatchPage::Dashboard => PageKind::Dashboard,
            WatchPage::Jobs => PageKind::Jobs,
            WatchPage::Resources => PageKind::Resources,
            WatchPage::Notifications => PageKind::Notifications,
            WatchPage::Job { job_id } => PageKind::JobDetails {
                job_id: job_id.clone(),
            },
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a batch script
    Submit {
        /// Job name
        #[arg(long)]
        name: String,
        /// Path to the batch script
        #[arg(long)]
        script: PathBuf,
        /// Submit as this user (defaults to the logged-in user)
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        partition: Option<String>,
        #[arg(long)]
        qos: Option<String>,
        /// Time limit in minutes
        #[arg(long, visible_alias = "time")]
        time_limit: Option<u64>,
        #[arg(long)]
        nodes: Option<u32>,
        #[arg(long)]
        ntasks: Option<u32>,
        #[arg(long)]
        cpus_per_task: Option<u32>,
        /// Memory per node, e.g. 4G
        #[arg(long)]
        memory: Option<String>,
    },
    /// Show one job
    Status { job_id: String },
    /// List jobs from the last 24 hours
    List {
        /// Only jobs of this user
        #[arg(long)]
        user: Option<String>,
    },
    /// Cancel a job
    Cancel { job_id: String },
    /// Print the tail of a job's output file
    Output {
        job_id: String,
        /// Number of trailing lines
        #[arg(long)]
        tail: Option<u64>,
    },
    /// Print a job's batch script
    Script { job_id: String },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List partitions
    Partitions,
    /// List QOS levels
    Qos,
    /// Show cluster statistics
    Stats,
}

#[derive(clap::Subcommand, Debug)]
enum MetricsCommands {
    /// Downsampled metrics history
    History {
        #[arg(long, default_value = "24")]
        hours: u32,
        #[arg(long, default_value = "5")]
        downsample: u32,
    },
    /// Aggregated metrics statistics
    Stats {
        #[arg(long, default_value = "24")]
        hours: u32,
    },
}

// =============================================================================
// Realtime client
// =============================================================================

/// The shared connection plus the transport task driving it.
struct Client {
    conn: Connection,
    config: ClientConfig,
    shutdown: CancellationToken,
    transport: JoinHandle<()>,
}

impl Client {
    fn start(args: &ClientArgs) -> Self {
        let config = args.config();
        let (conn, outbound_rx) = Connection::new();
        let shutdown = install_shutdown_handler();

        let transport = tokio::spawn(run_transport(
            conn.clone(),
            outbound_rx,
            config.clone(),
            shutdown.clone(),
        ));

        Self {
            conn,
            config,
            shutdown,
            transport,
        }
    }

    /// Send `event` and wait for its response, failing on `success: false`.
    async fn call(&self, event: &str, payload: Value) -> Result<Value, Box<dyn std::error::Error>> {
        let response_event = events::response_for(event)
            .ok_or_else(|| format!("no response event known for {}", event))?;
        let session = Session::new("cli", self.conn.clone(), Visibility::default());

        let response = tokio::select! {
            _ = self.shutdown.cancelled() => return Err("interrupted".into()),
            response = session.request(event, payload, response_event, self.config.request_timeout()) => response?,
        };
        events::check_response(&response)?;
        Ok(response)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.transport.await {
            tracing::warn!(error = %e, "Transport task ended abnormally");
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_watch(
    client: &Client,
    page: WatchPage,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let kind = page.kind();
    let (page, mut updates) = Page::activate(
        kind,
        client.conn.clone(),
        Visibility::default(),
        &client.config,
    )?;

    loop {
        tokio::select! {
            _ = client.shutdown.cancelled() => break,
            update = updates.recv() => {
                let Some(update) = update else { break };
                print_update(&update, output_format)?;
            }
        }
    }

    drop(page);
    Ok(())
}

async fn handle_job(
    client: &Client,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            name,
            script,
            username,
            account,
            partition,
            qos,
            time_limit,
            nodes,
            ntasks,
            cpus_per_task,
            memory,
        } => {
            let script = tokio::fs::read_to_string(&script).await?;
            let mut request = SubmitJob::new(name, script).with_options(JobOptions {
                account,
                partition,
                qos,
                time_limit: time_limit.map(TimeLimit::minutes),
                nodes,
                ntasks,
                cpus_per_task,
                memory,
                current_working_directory: None,
            });
            if let Some(username) = username {
                request = request.with_username(username);
            }

            let response = client
                .call(events::SUBMIT_JOB, serde_json::to_value(&request)?)
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", text(&response["job_id"]));
                    if let Some(message) = response["message"].as_str() {
                        println!("{}", message);
                    }
                }
            }
        }
        JobCommands::Status { job_id } => {
            let response = client.call(events::GET_JOB, requests::job_id(&job_id)).await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => print_job(&response["job"]),
            }
        }
        JobCommands::List { user } => {
            let response = client
                .call(events::GET_JOBS, requests::jobs_for_user(user.as_deref()))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => print_jobs_table(&response),
            }
        }
        JobCommands::Cancel { job_id } => {
            let response = client
                .call(events::CANCEL_JOB, requests::job_id(&job_id))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("Job {} cancelled", job_id),
            }
        }
        JobCommands::Output { job_id, tail } => {
            let response = client
                .call(events::GET_JOB_OUTPUT, requests::job_output(&job_id, tail))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("{}", text(&response["output"])),
            }
        }
        JobCommands::Script { job_id } => {
            let response = client
                .call(events::GET_JOB_SCRIPT, requests::job_id(&job_id))
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&response)?,
                OutputFormat::Table => println!("{}", text(&response["script"])),
            }
        }
    }
    Ok(())
}

async fn handle_cluster(
    client: &Client,
    command: ClusterCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (event, key) = match command {
        ClusterCommands::Partitions => (events::GET_PARTITIONS, "partitions"),
        ClusterCommands::Qos => (events::GET_QOS, "qos"),
        ClusterCommands::Stats => (events::GET_STATS, "stats"),
    };
    let response = client.call(event, Value::Null).await?;

    match output_format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match &response[key] {
            Value::Array(items) => {
                for item in items {
                    match item.get("name") {
                        Some(name) => println!("{}", text(name)),
                        None => println!("{}", item),
                    }
                }
            }
            Value::Object(map) => {
                for (field, value) in map {
                    println!("{:<24} {}", field, text(value));
                }
            }
            other => println!("{}", text(other)),
        },
    }
    Ok(())
}

async fn handle_metrics(
    client: &Client,
    command: MetricsCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match command {
        MetricsCommands::History { hours, downsample } => {
            client
                .call(
                    events::GET_METRICS_HISTORY,
                    requests::metrics_history(hours, downsample),
                )
                .await?
        }
        MetricsCommands::Stats { hours } => {
            client
                .call(
                    events::GET_METRICS_STATISTICS,
                    requests::metrics_statistics(hours),
                )
                .await?
        }
    };

    match output_format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if let Some(points) = response["data"].as_array() {
                println!("{} data points over {} hours", points.len(), text(&response["hours"]));
            } else if let Some(stats) = response["statistics"].as_object() {
                for (field, value) in stats {
                    println!("{:<24} {}", field, value);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Output Helpers
// =============================================================================

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_job(job: &Value) {
    for field in [
        "job_id",
        "name",
        "state",
        "user",
        "partition",
        "qos",
        "nodes",
        "time_limit",
        "submit_time",
        "start_time",
        "end_time",
        "exit_code",
        "reason",
    ] {
        println!("{:<16} {}", format!("{}:", field), text(&job[field]));
    }
}

fn print_jobs_table(response: &Value) {
    let jobs = response["jobs"].as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<10} {:<24} {:<12} {:<12} PARTITION",
        "JOB ID", "NAME", "STATE", "USER"
    );
    println!("{}", "-".repeat(72));
    for job in &jobs {
        let name = text(&job["name"]);
        // Truncate name if too long
        let name_display = if name.chars().count() > 24 {
            format!("{}...", name.chars().take(21).collect::<String>())
        } else {
            name
        };
        println!(
            "{:<10} {:<24} {:<12} {:<12} {}",
            text(&job["job_id"]),
            name_display,
            text(&job["state"]),
            text(&job["user"]),
            text(&job["partition"]),
        );
    }
    println!();
    println!("{} jobs", jobs.len());
}

fn print_update(
    update: &PageUpdate,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string(update)?),
        OutputFormat::Table => {
            let stamp = update.received_at.format("%H:%M:%S");
            match &update.outcome {
                PageOutcome::Data(payload) if update.event == events::JOBS_LIST => {
                    println!("[{}] {}", stamp, update.event);
                    print_jobs_table(payload);
                }
                PageOutcome::Data(payload) => {
                    println!("[{}] {} {}", stamp, update.event, payload);
                }
                PageOutcome::Failed(message) => {
                    println!("[{}] {} failed: {}", stamp, update.event, message);
                }
                PageOutcome::ConnectionLost(reason) => {
                    println!("[{}] connection: {} ({})", stamp, update.event, reason);
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
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slurm_dash=info")),
        )
        .init();

    let args = Args::parse();

    let (running, result) = match args.command {
        Commands::Watch { client, page } => {
            let running = Client::start(&client);
            let result = handle_watch(&running, page, &client.output).await;
            (running, result)
        }
        Commands::Job { client, command } => {
            let running = Client::start(&client);
            let result = handle_job(&running, command, &client.output).await;
            (running, result)
        }
        Commands::Cluster { client, command } => {
            let running = Client::start(&client);
            let result = handle_cluster(&running, command, &client.output).await;
            (running, result)
        }
        Commands::Metrics { client, command } => {
            let running = Client::start(&client);
            let result = handle_metrics(&running, command, &client.output).await;
            (running, result)
        }
    };

    running.stop().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
