use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleetguard::http::{Body, BoxError, HttpService, empty_body, incoming_to_body, json_response};
use fleetguard::{ClientAddr, Guard, GuardConfig, RateLimitLayer};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tower::{Layer, ServiceExt};

#[derive(Parser)]
#[command(
    name = "fleetguard",
    about = "Rate limiting, circuit breaking and coordination for service replicas"
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Shared store URL (e.g. "redis://127.0.0.1:6379/0"); overrides config and environment
    #[arg(long = "store-url")]
    store_url: Option<String>,

    /// Instance id advertised to other replicas (default: random UUID)
    #[arg(long = "instance-id")]
    instance_id: Option<String>,

    /// Blocking worker pool size
    #[arg(long)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fleetguard=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let mut config = GuardConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(url) = cli.store_url {
        config.store.url = Some(url);
    }
    if let Some(id) = cli.instance_id {
        config.coordinator.instance_id = Some(id);
    }
    if let Some(workers) = cli.workers {
        config.executor.workers = Some(workers);
    }
    config.coordinator.host.get_or_insert_with(|| cli.bind.clone());
    config.coordinator.port.get_or_insert(cli.port);

    let guard = Guard::start(&config).await?;

    let listen = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(%listen, "listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let guard = guard.clone();
                tokio::spawn(serve_connection(stream, peer, guard));
            }
        }
    }

    guard.shutdown().await;
    Ok(())
}

fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    guard: Arc<Guard>,
) -> impl std::future::Future<Output = ()> + Send {
    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
        let svc = RateLimitLayer::new(guard.gate().clone()).layer(routes(guard.clone()));
        let mut req = req.map(incoming_to_body);
        req.extensions_mut().insert(ClientAddr(peer));
        svc.oneshot(req)
    });
    let conn: std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), hyper::Error>> + Send>> =
        Box::pin(hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(stream), service));
    async move {
        if let Err(e) = conn.await {
            tracing::debug!(%peer, error = %e, "connection closed with error");
        }
    }
}

fn routes(guard: Arc<Guard>) -> HttpService {
    HttpService::new(tower::service_fn(move |req: Request<Body>| {
        let guard = guard.clone();
        let (method, path) = (req.method().clone(), req.uri().path().to_string());
        async move { Ok::<_, BoxError>(respond(&guard, &method, &path).await) }
    }))
}

async fn respond(guard: &Guard, method: &Method, path: &str) -> Response<Body> {
    match (method, path) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({
                "status": if guard.store().is_degraded() { "degraded" } else { "ok" },
                "mode": guard.mode().to_string(),
            }),
        ),
        (&Method::GET, "/status") => json_response(StatusCode::OK, &guard.status().await),
        _ => {
            let mut resp = Response::new(empty_body());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}
