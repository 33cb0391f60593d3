use anyhow::Result;
use clap::{Parser, Subcommand};

use autocode::config::Config;
use autocode::db::TicketStore;
use autocode::server;

#[derive(Parser)]
#[command(name = "autocode")]
#[command(version, about = "Ticket dispatch backend for AI coding agents")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server plus in-process queue workers
    Serve {
        /// Override AUTOCODE_API_PORT
        #[arg(long)]
        port: Option<u16>,
        /// Override AUTOCODE_API_HOST
        #[arg(long)]
        host: Option<String>,
        /// Permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
    /// Run a standalone queue worker for one agent
    Worker {
        /// Execution strategy to run: claude or opencode
        #[arg(long, default_value = "claude")]
        agent: String,
    },
    /// Initialize the database and exit
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::from_env();

    match cli.command {
        Commands::Serve { port, host, dev } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            if let Some(host) = host {
                config.api_host = host;
            }
            server::start_server(config, dev).await
        }
        Commands::Worker { agent } => server::run_worker(config, &agent).await,
        Commands::Init => {
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            TicketStore::new(&config.db_path)?;
            println!("Database initialized at {}", config.db_path.display());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "autocode=debug" } else { "autocode=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
