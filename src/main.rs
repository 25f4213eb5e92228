use std::path::PathBuf;
use std::sync::Arc;

use driftwatch::{
    adapter::HttpResourceClient,
    alerts::{AlertChannel, FanoutAlertChannel, LogAlertChannel, WebhookAlertChannel},
    audit::{AuditLog, JsonlAuditSink},
    baseline::BaselineStore,
    observability::{init_observability, log_config_info},
    secrets::SecretsVault,
    storage::{create_pool, SqliteBaselineRepository},
    AppConfig, Engine, Result, ScanScheduler, APP_NAME, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    // Config file: first argument, then DRIFTWATCH_CONFIG
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DRIFTWATCH_CONFIG").ok())
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    init_observability(&config.observability)?;
    log_config_info(&config);
    info!(app_name = APP_NAME, version = VERSION, "Starting drift reconciliation engine");

    let audit = match &config.vault.audit_log_path {
        Some(path) => AuditLog::open(Arc::new(JsonlAuditSink::new(path))).await?,
        None => {
            warn!("No audit log path configured, audit entries are kept in memory only");
            AuditLog::in_memory()
        }
    };

    let vault = Arc::new(SecretsVault::from_settings(&config.vault, audit.clone()).await?);
    let due = vault.due_for_rotation(chrono::Utc::now());
    if !due.is_empty() {
        warn!(credentials = ?due, "Credentials are due for rotation");
    }

    let pool = create_pool(&config.database).await?;
    let baselines = BaselineStore::new(Arc::new(SqliteBaselineRepository::new(pool)));

    let client = Arc::new(HttpResourceClient::new(
        config.provider.base_url.clone(),
        config.provider.credential_id.clone(),
        vault.clone(),
    ));

    let log_channel: Arc<dyn AlertChannel> = Arc::new(LogAlertChannel);
    let mut alerts = FanoutAlertChannel::new(vec![log_channel]);
    if let Some(url) = &config.remediation.webhook_url {
        alerts.push(Arc::new(WebhookAlertChannel::new(url.clone())));
    }

    let engine =
        Arc::new(Engine::from_config(&config, client, baselines, vault, audit, Arc::new(alerts))?);

    let shutdown = CancellationToken::new();
    let scheduler = ScanScheduler::new(
        engine.clone(),
        config.drift.resources.clone(),
        config.drift.scan_interval(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scan scheduler task failed");
    }

    info!("Engine stopped");
    Ok(())
}
