use anyhow::Result;
use tracing::{info, warn};
use vm_api::{create_app, AppState, Collaborators, Config};
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};

#[tokio::main]
async fn main() -> Result<()> {
    // Flushes file logging on exit
    let _log_guard = vm_logging::init_subscriber();

    info!("Starting vm-api service...");

    // Load configuration
    let config = Config::from_env();
    info!("Configuration loaded: {:?}", config);

    if !config.ssh_key_path.exists() {
        warn!(
            "SSH key {} not found; remote commands and terminals will be rejected",
            config.ssh_key_path.display()
        );
    }

    let collaborators = Collaborators::production(&config)?;

    // Database setup
    let db_path = &config.db_path;
    info!("Database path: {}", db_path.display());

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::new(pool, &config, collaborators);

    // Polling schedules live in memory; restart them for unfinished launches
    let resumed = state.orchestrator.resume_reconciliation().await?;
    info!("Resumed reconciliation for {} instance(s)", resumed);

    let app = create_app(state.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.scheduler().cancel_all();
    info!("vm-api stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
