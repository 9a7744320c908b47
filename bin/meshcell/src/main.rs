mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshcell")]
#[command(about = "Agent coordination over a pub/sub bus", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.meshcell/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Onboard {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Status,

    /// Run the WebSocket bus hub
    Hub {
        /// Host to bind to (overrides config hub.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config hub.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run an agent
    Agent {
        /// Agent id (overrides config agent.id)
        #[arg(long)]
        id: Option<String>,

        /// Display name (overrides config agent.displayName)
        #[arg(long)]
        name: Option<String>,

        /// Advertised capability; repeat to add several (replaces config list)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Built-in task type to handle; repeat to add several (replaces config list)
        #[arg(long = "task-type")]
        task_types: Vec<String>,
    },

    /// Run the agent directory and capability broker
    Directory {
        /// Run without the capability broker
        #[arg(long)]
        no_broker: bool,
    },

    /// Query the agent directory
    Agents {
        #[command(subcommand)]
        command: AgentsCommands,
    },

    /// Publish tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Request a capability through the broker
    Capability {
        /// Capability name
        name: String,

        /// JSON parameters
        #[arg(default_value = "{}")]
        params: String,

        /// How long to wait for a responder
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Send a message envelope to one agent, or to `all`
    Send {
        /// Recipient agent id or `all`
        to: String,

        /// Message content (JSON, or plain text)
        content: String,

        #[arg(long, value_enum, default_value_t = KindArg::Text)]
        kind: KindArg,
    },

    /// Send an event to one agent (shutdown, restart, status, ping, ...)
    Event {
        agent_id: String,

        event_type: String,

        /// Event data (JSON)
        #[arg(default_value = "null")]
        data: String,

        /// Wait for a reply (status, ping)
        #[arg(long)]
        wait: bool,
    },

    /// Broadcast to every agent (shutdown, announce, ...)
    Broadcast {
        message_type: String,

        /// Message body (JSON)
        #[arg(default_value = "null")]
        message: String,
    },

    /// Print bus traffic matching a topic pattern
    Watch {
        #[arg(default_value = ">")]
        pattern: String,
    },
}

#[derive(Subcommand)]
enum AgentsCommands {
    /// List agents known to the directory
    List {
        /// all, online or offline
        #[arg(long, default_value = "all")]
        filter: String,
    },
    /// Show one agent record
    Get { id: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Publish a task and collect its results
    Publish {
        /// Task type (routes to tasks.<type>)
        task_type: String,

        /// Task payload (JSON, or plain text)
        #[arg(default_value = "{}")]
        payload: String,

        /// Task id (generated when absent)
        #[arg(long)]
        id: Option<String>,

        /// Per-task handler timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Stop after this many results (0 = wait the full window)
        #[arg(long, default_value_t = 0)]
        expect: usize,

        /// How long to collect results; 0 publishes without waiting
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Text,
    Command,
    Query,
    Response,
}

impl From<KindArg> for meshcell_core::MessageKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => Self::Text,
            KindArg::Command => Self::Command,
            KindArg::Query => Self::Query,
            KindArg::Response => Self::Response,
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let config_path = cli.config;

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(config_path, force).await?;
        }
        Commands::Status => {
            commands::status::run(config_path).await?;
        }
        Commands::Hub { host, port } => {
            commands::hub::run(config_path, host, port).await?;
        }
        Commands::Agent {
            id,
            name,
            capabilities,
            task_types,
        } => {
            commands::agent::run(
                config_path,
                commands::agent::Overrides {
                    id,
                    name,
                    capabilities,
                    task_types,
                },
            )
            .await?;
        }
        Commands::Directory { no_broker } => {
            commands::directory::run(config_path, !no_broker).await?;
        }
        Commands::Agents { command } => match command {
            AgentsCommands::List { filter } => {
                commands::agents::list(config_path, &filter).await?;
            }
            AgentsCommands::Get { id } => {
                commands::agents::get(config_path, &id).await?;
            }
        },
        Commands::Task { command } => match command {
            TaskCommands::Publish {
                task_type,
                payload,
                id,
                timeout_ms,
                expect,
                wait_ms,
            } => {
                commands::task::publish(
                    config_path,
                    commands::task::PublishArgs {
                        task_type,
                        payload,
                        id,
                        timeout_ms,
                        expect,
                        wait_ms,
                    },
                )
                .await?;
            }
        },
        Commands::Capability {
            name,
            params,
            timeout_ms,
        } => {
            commands::capability::run(config_path, &name, &params, timeout_ms).await?;
        }
        Commands::Send { to, content, kind } => {
            commands::message::send(config_path, &to, &content, kind.into()).await?;
        }
        Commands::Event {
            agent_id,
            event_type,
            data,
            wait,
        } => {
            commands::message::event(config_path, &agent_id, &event_type, &data, wait).await?;
        }
        Commands::Broadcast {
            message_type,
            message,
        } => {
            commands::message::broadcast(config_path, &message_type, &message).await?;
        }
        Commands::Watch { pattern } => {
            commands::watch::run(config_path, &pattern).await?;
        }
    }

    Ok(())
}
