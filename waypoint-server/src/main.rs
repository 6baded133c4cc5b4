use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};
use waypoint_core::WaypointConfig;

use waypoint_server::app::App;
use waypoint_server::server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "waypoint.toml")]
    config: String,

    /// Check database connectivity and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets such as WAYPOINT_MODEL_API_KEY may live in .env during development
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match WaypointConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let level: tracing::Level = config.service.log_level.parse().unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    if args.health {
        return health(&config).await;
    }

    let app = Arc::new(App::build(config).await?);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if app.config.http.enabled {
        let http_app = app.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = waypoint_server::http::start_http_server(http_app, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = app.config.service.socket_path.clone();
    server::run_unix_server(&socket_path, app, tx.subscribe()).await?;

    Ok(())
}

async fn health(config: &WaypointConfig) -> anyhow::Result<()> {
    let Some(db) = &config.database else {
        println!("✅ No [database] configured, in-memory stores will be used");
        return Ok(());
    };

    let pool = match waypoint_core::db::create_pool(db).await {
        Ok(p) => p,
        Err(e) => {
            println!("❌ PostgreSQL connection failed: {}", e);
            std::process::exit(1);
        }
    };

    match waypoint_core::db::health_check(&pool).await {
        Ok(v) => println!("✅ PostgreSQL connected: {}", v),
        Err(e) => {
            println!("❌ PostgreSQL health check failed: {}", e);
            std::process::exit(1);
        }
    }

    match waypoint_core::db::check_pgvector(&pool).await {
        Ok(v) => println!("✅ pgvector version: {}", v),
        Err(e) => {
            println!("❌ pgvector check failed: {}", e);
            std::process::exit(1);
        }
    }

    println!("✅ Waypoint DB health check passed");
    Ok(())
}
