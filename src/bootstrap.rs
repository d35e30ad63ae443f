use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::handler::AppState;
use crate::chain::{JsonRpcLedger, KeySource, LedgerRpc, NodeKeySource};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::execution::TransferExecutor;
use crate::fees::FeeEstimator;
use crate::jobs::{JobService, JobStore, PgJobStore};
use crate::oracle::{PriceOracle, PythOracle};
use crate::worker::ExecutorLoop;

/// Everything `main` needs: HTTP state plus the executor loops to spawn
pub struct Application {
    pub state: AppState,
    pub executor_loops: Vec<Arc<ExecutorLoop>>,
}

pub async fn initialize_application(config: &AppConfig) -> AppResult<Application> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database.url, config.database.max_connections).await?;
    let store = Arc::new(PgJobStore::new(pool));
    store.migrate().await?;
    info!("✅ Database migrations applied");
    let store: Arc<dyn JobStore> = store;

    let ledger: Arc<dyn LedgerRpc> = Arc::new(JsonRpcLedger::new(config.ledger_config()));
    let oracle: Arc<dyn PriceOracle> = Arc::new(PythOracle::new(config.oracle_config()));
    let keys: Arc<dyn KeySource> = Arc::new(NodeKeySource::new(
        config.signer_rpc_url(),
        Duration::from_secs(config.ledger.request_timeout_secs),
    ));

    let estimator = Arc::new(FeeEstimator::new(config.fee_config(), ledger.clone(), oracle.clone()));
    let executor = Arc::new(TransferExecutor::new(config.transfer_config(), ledger, oracle));

    let jobs = Arc::new(JobService::new(
        store.clone(),
        estimator.clone(),
        config.job_service_config(),
    ));

    let executor_loops = (0..config.worker.instances)
        .map(|index| {
            Arc::new(ExecutorLoop::new(
                config.executor_loop_config(index),
                store.clone(),
                estimator.clone(),
                executor.clone(),
                keys.clone(),
            ))
        })
        .collect::<Vec<_>>();
    info!("⚙️  {} executor loop(s) configured", executor_loops.len());

    Ok(Application {
        state: AppState { jobs },
        executor_loops,
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| AppError::Store(e.into()))?;

    info!("✅ Database connected");
    Ok(pool)
}
