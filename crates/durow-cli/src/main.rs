//! Durow CLI — command-line interface for the durable task engine.
//!
//! Reuses the same core domain logic (durow-core) and server bootstrap
//! (durow-server) that back the HTTP API.

mod commands;

use clap::{Parser, Subcommand};

/// Durow CLI — durable task-execution engine
#[derive(Parser)]
#[command(name = "durow", version, about = "Durow CLI — durable task-execution engine")]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "DUROW_DB_PATH", default_value = "data/durow.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Durow HTTP backend server
    Server {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, env = "DUROW_PORT", default_value_t = 3200)]
        port: u16,
    },

    /// Start and inspect workflow runs
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Administer cron schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Run code in the sandbox directly
    Exec {
        /// Sub-agent kind (e.g. "shell", "python")
        #[arg(long, default_value = "shell")]
        kind: String,
        /// Code to run (mutually exclusive with --file)
        #[arg(long)]
        code: Option<String>,
        /// Read the code from a file
        #[arg(long)]
        file: Option<String>,
        /// Tenant the execution is attributed to
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
        /// Wall-clock timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Start a workflow from a YAML definition file
    Run {
        /// Path to the workflow YAML file
        #[arg(long)]
        file: String,
        /// Start input as a JSON string
        #[arg(long, default_value = "null")]
        input: String,
        /// Tenant the run belongs to
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
        /// Dedupe key: at most one active run per (workflow, key)
        #[arg(long)]
        dedupe_key: Option<String>,
        /// Wait for the run to reach a terminal status
        #[arg(long)]
        wait: bool,
    },
    /// Show a run's status
    Status {
        /// Run ID
        #[arg(long)]
        id: String,
    },
    /// Cancel a run
    Cancel {
        /// Run ID
        #[arg(long)]
        id: String,
    },
    /// Show a run's audit trail
    Audit {
        /// Run ID
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Create a schedule (idempotent)
    Create {
        /// Schedule ID, unique per tenant
        #[arg(long)]
        id: String,
        /// Registered workflow to start on each fire
        #[arg(long)]
        workflow: String,
        /// Cron expression (5- or 6-field)
        #[arg(long)]
        cron: String,
        /// Tenant the schedule belongs to
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
        /// Task queue
        #[arg(long, default_value = "default")]
        queue: String,
        /// Create in paused state
        #[arg(long)]
        paused: bool,
    },
    /// List schedules for a tenant
    List {
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
    },
    /// Pause a schedule
    Pause {
        #[arg(long)]
        id: String,
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
    },
    /// Unpause a schedule
    Unpause {
        #[arg(long)]
        id: String,
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
    },
    /// Fire a schedule immediately
    Trigger {
        #[arg(long)]
        id: String,
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
    },
    /// Delete a schedule (idempotent)
    Delete {
        #[arg(long)]
        id: String,
        #[arg(long, env = "DUROW_DEFAULT_TENANT", default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durow=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server { host, port } => commands::server::run(host, port, cli.db).await,
        Commands::Workflow { action } => match action {
            WorkflowAction::Run {
                file,
                input,
                tenant,
                dedupe_key,
                wait,
            } => commands::workflow::run(&cli.db, &file, &input, &tenant, dedupe_key, wait).await,
            WorkflowAction::Status { id } => commands::workflow::status(&cli.db, &id).await,
            WorkflowAction::Cancel { id } => commands::workflow::cancel(&cli.db, &id).await,
            WorkflowAction::Audit { id } => commands::workflow::audit(&cli.db, &id).await,
        },
        Commands::Schedule { action } => match action {
            ScheduleAction::Create {
                id,
                workflow,
                cron,
                tenant,
                queue,
                paused,
            } => commands::schedule::create(&cli.db, id, workflow, cron, tenant, queue, !paused).await,
            ScheduleAction::List { tenant } => commands::schedule::list(&cli.db, &tenant).await,
            ScheduleAction::Pause { id, tenant } => {
                commands::schedule::set_enabled(&cli.db, &tenant, &id, false).await
            }
            ScheduleAction::Unpause { id, tenant } => {
                commands::schedule::set_enabled(&cli.db, &tenant, &id, true).await
            }
            ScheduleAction::Trigger { id, tenant } => {
                commands::schedule::trigger(&cli.db, &tenant, &id).await
            }
            ScheduleAction::Delete { id, tenant } => {
                commands::schedule::delete(&cli.db, &tenant, &id).await
            }
        },
        Commands::Exec {
            kind,
            code,
            file,
            tenant,
            timeout_ms,
        } => commands::exec::run(&cli.db, &kind, code, file, &tenant, timeout_ms).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
