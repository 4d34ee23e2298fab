//! `foreman-host`: wires configuration, the event ledger, a git-backed
//! workspace adapter, and the Orchestrator into an HTTP server.
//!
//! Grounded on `StatusServer::start` (bind, build router, `axum::serve`
//! in a background task) and the thin `main.rs` entry point it's called
//! from, generalized here to a standalone binary rather than a Tauri
//! command since this crate has no desktop shell.

mod git;
mod http;
mod workspace_adapter;

use std::path::PathBuf;
use std::sync::Arc;

use foreman_core::config::Config;
use foreman_core::ledger::Ledger;
use foreman_core::orchestrator::Orchestrator;

use http::AppState;
use workspace_adapter::GitWorkspaceAdapter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_path = std::env::var("FOREMAN_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let repo_path = std::env::var("FOREMAN_REPO_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().expect("current dir must be readable"));

    let ledger = Arc::new(Ledger::new(config.ledger_archive_dir.clone(), config.ledger_hard_cap)?);
    let adapter = Arc::new(GitWorkspaceAdapter::new(repo_path, config.workspace_base_dir.clone()));
    let orchestrator = Arc::new(Orchestrator::new(config, ledger.clone(), adapter));

    let state = AppState { orchestrator, ledger };
    let router = http::build_router(state);

    let addr = std::env::var("FOREMAN_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:4500".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("foreman-host listening on http://{addr}");

    axum::serve(listener, router).await?;
    Ok(())
}
