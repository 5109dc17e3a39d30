use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::{
    sqlx, ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbErr, RuntimeErr,
    TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Log every statement through sqlx
    pub sqlx_logging: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
            sqlx_logging: false,
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
            sqlx_logging: cfg.log_level.eq_ignore_ascii_case("trace"),
        }
    }
}

/// Backoff for re-running transactions aborted by lock contention
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl From<&AppConfig> for RetryConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_attempts: cfg.db_retry_attempts,
            initial_delay: Duration::from_millis(cfg.db_retry_initial_delay_ms),
            max_delay: Duration::from_millis(cfg.db_retry_max_delay_ms),
        }
    }
}

/// SQLite BUSY, LOCKED and their extended codes; Postgres
/// serialization_failure and deadlock_detected.
const CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001", "40P01"];

/// Whether the store rejected a statement because another transaction holds
/// the rows or pages it needs.
pub fn is_contention(err: &DbErr) -> bool {
    let runtime = match err {
        DbErr::Exec(e) | DbErr::Query(e) | DbErr::Conn(e) => e,
        _ => return false,
    };
    match runtime {
        RuntimeErr::SqlxError(sqlx::Error::Database(db_err)) => db_err
            .code()
            .map_or(false, |code| CONTENTION_CODES.contains(&&*code)),
        other => other.to_string().contains("database is locked"),
    }
}

/// Turns a contended database error into [`ServiceError::Contention`].
pub fn classify(err: ServiceError) -> ServiceError {
    match err {
        ServiceError::DatabaseError(e) if is_contention(&e) => ServiceError::Contention(e.to_string()),
        other => other,
    }
}

/// Runs `operation` (one whole transaction) until it succeeds, fails for a
/// reason other than contention, or runs out of attempts.
pub async fn with_retry<F, Fut, T>(
    operation_name: &'static str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempts < config.max_attempts => {
                counter!("pharma_wms_db.transaction.retried", 1, "operation" => operation_name);
                let wait = jittered(delay);
                debug!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %err,
                    "Transaction contended, retrying in {:?}",
                    wait
                );
                sleep(wait).await;
                delay = (delay * 2).min(config.max_delay);
            }
            Err(err) => {
                if err.is_retryable() {
                    counter!("pharma_wms_db.transaction.retries_exhausted", 1, "operation" => operation_name);
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "Transaction still contended after final attempt"
                    );
                }
                return Err(err);
            }
        }
    }
}

/// Spreads concurrent retries over `[delay, 2 * delay]`.
fn jittered(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    Duration::from_millis(millis + rand::thread_rng().gen_range(0..=millis))
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError::DatabaseError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(config.sqlx_logging);

    gauge!("pharma_wms_db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await.map_err(|e| {
        error!("Database connection establishment failed: {}", e);
        ServiceError::DatabaseError(e)
    })?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Runs the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Running database migrations");
    let start = Instant::now();

    let result = crate::migrator::Migrator::up(pool, None).await;

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!(
            "Database migrations completed successfully in {:?}",
            elapsed
        ),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result.map_err(ServiceError::DatabaseError)
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let start = Instant::now();
    let result = pool.ping().await;

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("pharma_wms_db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            error!(
                "Database connection check failed after {:?}: {}",
                elapsed, e
            );
            counter!("pharma_wms_db.connection_failures", 1);
        }
    }

    result.map_err(ServiceError::DatabaseError)
}

/// Opens the transaction that scopes one engine operation.
///
/// Pair with [`finish`]: the body runs against `&DatabaseTransaction` and its
/// result decides between commit and rollback. A transaction dropped without
/// reaching `finish` is rolled back by the driver.
pub async fn begin(pool: &DbPool) -> Result<DatabaseTransaction, ServiceError> {
    counter!("pharma_wms_db.transaction.started", 1);
    pool.begin().await.map_err(|e| {
        error!(error = %e, "Failed to begin transaction");
        ServiceError::DatabaseError(e)
    })
}

/// Commits on `Ok`, rolls back on `Err`, and hands the body's result back.
/// Contended database errors come back as [`ServiceError::Contention`].
pub async fn finish<T>(
    txn: DatabaseTransaction,
    result: Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    let start = Instant::now();
    match result {
        Ok(value) => {
            txn.commit().await.map_err(|e: DbErr| {
                error!(error = %e, "Transaction commit failed");
                counter!("pharma_wms_db.transaction.commit_failed", 1);
                classify(ServiceError::DatabaseError(e))
            })?;
            counter!("pharma_wms_db.transaction.committed", 1);
            histogram!(
                "pharma_wms_db.transaction.commit_duration",
                start.elapsed().as_secs_f64()
            );
            Ok(value)
        }
        Err(err) => {
            let err = classify(err);
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "Rollback reported an error");
            }
            counter!("pharma_wms_db.transaction.rolled_back", 1, "kind" => format!("{:?}", err.kind()));
            debug!(error = %err, "Transaction rolled back");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_config_follows_app_config() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "development".into());
        cfg.db_max_connections = 3;
        cfg.db_acquire_timeout_secs = 2;

        let db_cfg = DbConfig::from(&cfg);
        assert_eq!(db_cfg.url, "sqlite::memory:");
        assert_eq!(db_cfg.max_connections, 3);
        assert_eq!(db_cfg.acquire_timeout, Duration::from_secs(2));
        assert!(!db_cfg.sqlx_logging);
    }

    #[test]
    fn only_lock_errors_count_as_contention() {
        let locked = DbErr::Exec(RuntimeErr::Internal("database is locked".into()));
        assert!(is_contention(&locked));
        assert_matches::assert_matches!(
            classify(ServiceError::DatabaseError(locked)),
            ServiceError::Contention(_)
        );

        let other = DbErr::Custom("syntax error".into());
        assert!(!is_contention(&other));
        assert_matches::assert_matches!(
            classify(ServiceError::DatabaseError(other)),
            ServiceError::DatabaseError(_)
        );
    }

    #[tokio::test]
    async fn retry_reruns_contended_attempts_only() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let value = with_retry("test", &config, move || async move {
            let attempt = calls_ref.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(ServiceError::Contention("busy".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);

        calls.store(0, Ordering::SeqCst);
        let exhausted: Result<(), _> = with_retry("test", &config, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Contention("busy".into()))
        })
        .await;
        assert_matches::assert_matches!(exhausted, Err(ServiceError::Contention(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        calls.store(0, Ordering::SeqCst);
        let rejected: Result<(), _> = with_retry("test", &config, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Conflict("duplicate".into()))
        })
        .await;
        assert_matches::assert_matches!(rejected, Err(ServiceError::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn migrations_apply_to_empty_sqlite() {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();
        check_connection(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn failed_body_rolls_back() {
        use crate::entities::tender_contract;
        use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};

        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();

        let txn = begin(&pool).await.unwrap();
        let inserted = tender_contract::ActiveModel {
            contract_number: Set("TC-1".into()),
            customer_id: Set(uuid::Uuid::new_v4()),
            status: Set(tender_contract::ContractStatus::Draft),
            start_date: Set(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            end_date: Set(chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            notes: Set(None),
            created_by: Set("test".into()),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::from);
        assert!(inserted.is_ok());

        let result: Result<(), ServiceError> =
            finish(txn, Err(ServiceError::BusinessRule("abort".into()))).await;
        assert!(result.is_err());

        let count = tender_contract::Entity::find().count(&pool).await.unwrap();
        assert_eq!(count, 0);
    }
}
