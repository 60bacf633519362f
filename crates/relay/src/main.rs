use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use docsync_relay::{
    access::AccessPolicy,
    broadcast::{MessageBus, PgBus, TopicBus},
    cache::{KeyValueStore, MemoryKv, PgKv},
    config::{LogFormat, RelayConfig},
    db::{self, pool::PoolConfig},
    lock::LockManager,
    session::SyncServices,
    store::GitStore,
    sweep::Sweeper,
    ws,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let backends = connect_backends(&config).await?;
    let store = Arc::new(GitStore::new(&config.repos_root));
    let services = SyncServices::new(
        config.tuning.clone(),
        config.autosave_author.clone(),
        backends.kv,
        backends.locks,
        store,
        backends.access,
    )
    .with_bus(backends.bus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(
        Sweeper::new(services.clone()).run_loop(config.tuning.sweep_interval, shutdown_rx),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        repos_root = %config.repos_root.display(),
        "starting relay server"
    );

    axum::serve(listener, build_router(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    let _ = shutdown_tx.send(true);
    if let Err(join_error) = sweeper.await {
        error!(?join_error, "sweep loop ended abnormally");
    }
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

struct Backends {
    kv: Arc<dyn KeyValueStore>,
    locks: LockManager,
    access: AccessPolicy,
    bus: Arc<dyn MessageBus>,
}

async fn connect_backends(config: &RelayConfig) -> anyhow::Result<Backends> {
    let poll_interval = config.tuning.lock_poll_interval;

    let Some(database_url) = config.database_url.as_deref() else {
        warn!(
            "DOCSYNC_RELAY_DATABASE_URL is not set; running single-process with an in-memory \
             cache, local locks, in-process broadcast and no membership checks"
        );
        return Ok(Backends {
            kv: Arc::new(MemoryKv::default()),
            locks: LockManager::local(poll_interval),
            access: AccessPolicy::Open,
            bus: Arc::new(TopicBus::default()),
        });
    };

    let pool = db::pool::create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to PostgreSQL")?;
    db::migrations::run_migrations(&pool).await.context("failed to run relay migrations")?;
    db::pool::check_pool_health(&pool).await.context("PostgreSQL health check failed")?;
    info!("connected to PostgreSQL");
    let bus = PgBus::connect(pool.clone()).await.context("failed to start broadcast listener")?;

    Ok(Backends {
        kv: Arc::new(PgKv::new(pool.clone())),
        locks: LockManager::advisory(pool.clone(), poll_interval),
        access: AccessPolicy::Postgres(pool),
        bus: Arc::new(bus),
    })
}

fn build_router(services: SyncServices) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(ws::router(services)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
