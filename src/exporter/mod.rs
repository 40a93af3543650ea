use crate::collector::QueryCollector;
use crate::config::Config;
use crate::db::PgConnector;
use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder as _, TextEncoder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

const INDEX_HTML: &str = r"<html>
<head><title>PostgreSQL Exporter</title></head>
<body>
<h1>PostgreSQL Exporter</h1>
<p><a href='/metrics'>Metrics</a></p>
</body>
</html>
";

/// Load the config and serve `/metrics` until SIGINT or SIGTERM.
/// SIGHUP reloads the config.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or the port cannot be bound
pub async fn new(port: u16, listen: Option<String>, config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)?;
    info!(
        path = %config_path.display(),
        targets = config.targets().len(),
        "loaded config"
    );

    let collector = Arc::new(QueryCollector::new(config, Arc::new(PgConnector)));

    let listener = bind(port, listen).await?;
    let address = listener.local_addr()?;
    info!(%address, "starting postgresql exporter");

    axum::serve(listener, router(Arc::clone(&collector)))
        .with_graceful_shutdown(signals(collector, config_path))
        .await
        .map_err(|e| anyhow!("HTTP server failed: {e}"))?;

    info!("postgresql exporter stopped");

    Ok(())
}

/// Routes served by the exporter.
#[must_use]
pub fn router(collector: Arc<QueryCollector>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(collector)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(collector): State<Arc<QueryCollector>>) -> Response {
    let families = collector.collect().await;

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        error!(error = %e, "could not encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buffer).into_response()
}

/// Bind `listen:port`; without an address, all interfaces (IPv6 dual
/// stack when available, otherwise IPv4).
async fn bind(port: u16, listen: Option<String>) -> Result<TcpListener> {
    if let Some(listen) = listen {
        let ip: IpAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen}"))?;
        return TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .with_context(|| format!("could not bind {listen}:{port}"));
    }

    match TcpListener::bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!(error = %e, "IPv6 not available, binding IPv4");
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .await
                .with_context(|| format!("could not bind 0.0.0.0:{port}"))
        }
    }
}

/// Resolves on SIGINT or SIGTERM; reloads the config on every SIGHUP.
async fn signals(collector: Arc<QueryCollector>, config_path: PathBuf) {
    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "could not install signal handlers");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "could not listen for SIGINT");
                }
                return;
            }
        };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = hangup.recv() => reload(&collector, &config_path),
        }
    }
}

/// A failed reload keeps the running config.
fn reload(collector: &QueryCollector, config_path: &Path) {
    match Config::load(config_path) {
        Ok(config) => {
            info!(
                path = %config_path.display(),
                targets = config.targets().len(),
                "reloaded config"
            );
            collector.reload(config);
        }
        Err(e) => error!("could not reload config, keeping the previous one: {e:#}"),
    }
}
