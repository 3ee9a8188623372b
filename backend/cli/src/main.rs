mod api;
mod collab;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowline_cron::{check_schedules, fire_campaign_events, run_cron, CAMPAIGNS_LOCK, SCHEDULES_LOCK};
use flowline_queue::Queue;
use flowline_store::Store;
use flowline_tasks::{default_registry, TaskContext};
use flowline_worker::WorkerPool;

use api::AppState;
use collab::{LocalResolver, LoggingEngine, LoggingSender};
use config::Config;

#[derive(Parser)]
#[command(name = "flowline")]
#[command(about = "Flowline — messaging flow-start orchestration backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration server: HTTP API, cron drivers and workers
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show current runtime status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = Config {
                port: port.unwrap_or(config.port),
                ..config
            };
            run_server(config).await?;
        }
        Commands::Status => {
            let client = reqwest::Client::new();
            match client
                .get(format!("http://localhost:{}/api/health", config.port))
                .send()
                .await
            {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                Err(_) => {
                    println!("flowline is not running on port {}", config.port);
                }
            }
        }
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        port = config.port,
        bind = %config.bind_address,
        db = %config.db_path,
        workers = config.workers,
        "starting flowline"
    );

    let store = Store::open(&config.db_path)?;
    let queue = Queue::open(&config.db_path)?;

    let ctx = TaskContext {
        store: store.clone(),
        queue: queue.clone(),
        resolver: Arc::new(LocalResolver),
        engine: Arc::new(LoggingEngine),
        sender: Arc::new(LoggingSender),
    };

    // batch worker pool
    WorkerPool::new(config.workers, Arc::new(default_registry()), ctx).spawn();

    // schedule-fire cron driver
    {
        let store = store.clone();
        let cron_store = store.clone();
        let cron_queue = queue.clone();
        tokio::spawn(run_cron(
            store,
            SCHEDULES_LOCK,
            Duration::from_secs(config.schedule_interval_secs),
            move || {
                let store = cron_store.clone();
                let queue = cron_queue.clone();
                async move { check_schedules(&store, &queue, chrono::Utc::now()).await }
            },
        ));
    }

    // campaign-fire cron driver
    {
        let store = store.clone();
        let cron_store = store.clone();
        let cron_queue = queue.clone();
        tokio::spawn(run_cron(
            store,
            CAMPAIGNS_LOCK,
            Duration::from_secs(config.campaign_interval_secs),
            move || {
                let store = cron_store.clone();
                let queue = cron_queue.clone();
                async move { fire_campaign_events(&store, &queue, chrono::Utc::now()).await }
            },
        ));
    }

    info!("cron drivers and workers started");

    let state = Arc::new(AppState { store, queue });
    let app = api::build_router(state).layer(CorsLayer::permissive());
    let addr = format!("{}:{}", config.bind_address, config.port);

    info!(addr = %addr, "HTTP API listening");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
