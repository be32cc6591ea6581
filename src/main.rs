use std::sync::Arc;
use std::time::Duration;

use guardian::config::AppConfig;
use guardian::db::init_pool;
use guardian::engine::TripEngine;
use guardian::error::AppError;
use guardian::routes::create_router;
use guardian::scheduler::Scheduler;
use guardian::services::notify::{LogDispatcher, MatrixDispatcher, NotificationDispatcher};
use guardian::state::AppState;
use guardian::store::sqlite::SqliteTripStore;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;

    if let Err(err) = sqlx::migrate!("./migrations").run(&db).await {
        error!("migration failed: {err:?}");
        return Err(AppError::Other(err.into()));
    }

    let store = Arc::new(SqliteTripStore::new(db.clone()));
    let dispatcher: Arc<dyn NotificationDispatcher> = match config.matrix.clone() {
        Some(matrix) => Arc::new(MatrixDispatcher::new(matrix)),
        None => {
            info!("no Matrix credentials configured, notifications go to the log");
            Arc::new(LogDispatcher::new())
        }
    };

    let engine = TripEngine::new(store, dispatcher, config.escalation_contact.clone());

    Scheduler::new(
        engine.clone(),
        Duration::from_secs(config.scan_interval_secs),
    )
    .spawn();

    let state = AppState::new(config.clone(), engine);
    let app = create_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,guardian=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
