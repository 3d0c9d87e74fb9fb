//! branchchat server - HTTP API for branching conversations.
//!
//! Usage:
//!   BRANCHCHAT_DB=/path/to/chat.db BRANCHCHAT_BIND=127.0.0.1:3741 branchchat-server
//!
//! Or with args:
//!   branchchat-server --db /path/to/chat.db --bind 0.0.0.0:3741

use branchchat_lib::ai_client::GeminiClient;
use branchchat_lib::db::Database;
use branchchat_lib::server::{router, AppState};
use branchchat_lib::settings;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("branchchat-server - branching conversation HTTP API");
    println!();
    println!("Usage: branchchat-server [--db PATH] [--bind ADDR:PORT]");
    println!();
    println!("Environment variables:");
    println!("  BRANCHCHAT_DB     Database path");
    println!("  BRANCHCHAT_BIND   Bind address (default: {})", settings::DEFAULT_BIND);
    println!("  BRANCHCHAT_MODEL  Default generation model");
    println!("  GEMINI_API_KEY    Gemini API key");
    println!("  RUST_LOG          Log filter (default: info)");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse simple args
    let args: Vec<String> = std::env::args().collect();
    let mut db_arg: Option<&str> = None;
    let mut bind_arg: Option<&str> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" if i + 1 < args.len() => {
                db_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                bind_arg = Some(&args[i + 1]);
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                tracing::warn!(arg = %other, "ignoring unknown argument");
                i += 1;
            }
        }
    }

    settings::init(settings::app_data_dir());

    let bind_addr = bind_arg
        .map(|s| s.to_string())
        .unwrap_or_else(settings::get_bind_addr);
    let db_path = settings::find_database(db_arg);

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), error = %e, "failed to create database directory");
            std::process::exit(1);
        }
    }

    let db = match Database::new(&db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "failed to open database");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %db.get_path(), "database ready");

    if !settings::has_api_key() {
        tracing::warn!("GEMINI_API_KEY not set; generations will be stored with an error response");
    }

    let model = Arc::new(GeminiClient::from_settings());
    let state = AppState::new(db, model, settings::get_default_model(), settings::get_default_owner());
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %bind_addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %bind_addr, "listening");
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
