use std::sync::Arc;

use clap::Parser;
use dopas_core::prompt::PatientProfile;
use dopas_core::{AgentPrompt, DopasConfig, OpenAiChatClient, Orchestrator, PgTurnStore, RetryPolicy};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use dopas_server::http::{self, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "dopas.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match DopasConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match dopas_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match dopas_core::db::health_check(&pool).await {
            Ok(v) => println!("PostgreSQL connected: {}", v),
            Err(e) => {
                println!("PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("Dopas DB health check passed");
        return Ok(());
    }

    // Chat model client (API key from OPENAI_API_KEY)
    let model = match OpenAiChatClient::new(&config.model, None) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to create chat model client: {}", e);
            std::process::exit(1);
        }
    };

    // Agent wiring: prompt + tools are built once here and passed in;
    // the store implements both orchestrator ports.
    let store = Arc::new(PgTurnStore::new(pool.clone()));
    let prompt = AgentPrompt::with_report(&PatientProfile::default());
    let retry = RetryPolicy::from(&config.model);
    let orchestrator = Orchestrator::new(store.clone(), store, model, prompt, retry);

    // Shutdown signal
    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let state = Arc::new(HttpState {
        pool,
        config,
        orchestrator,
    });

    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
