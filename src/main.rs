//! p2p-http node.
//!
//! Serves HTTP over the TCP stream transport with the ping service and an
//! echo route mounted, until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};

use p2p_http::auth::{Ed25519Identity, Identity, PeerIdAuth};
use p2p_http::config::watcher::ConfigWatcher;
use p2p_http::config::{load_config, NodeConfig};
use p2p_http::http::{Request, Response};
use p2p_http::lifecycle::{wait_for_signal, Shutdown};
use p2p_http::net::listener::Listener;
use p2p_http::net::TcpTransport;
use p2p_http::observability::logging::init_tracing;
use p2p_http::observability::metrics::init_metrics;
use p2p_http::routing::{AuthRequirement, HandlerError, HttpService, Registrar, RequestContext, Route};
use p2p_http::services::PingService;

const IDENTITY_KEY_ENV: &str = "P2P_HTTP_IDENTITY_KEY";
const ECHO_PROTOCOL: &str = "/echo/1";
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "p2p-http-node", version, about = "HTTP over peer streams")]
struct Args {
    /// TOML configuration file. Watched for changes.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address; overrides `listener.bind_address`.
    #[arg(long)]
    listen: Option<String>,
}

async fn echo(request: Request, ctx: RequestContext) -> Result<Response, HandlerError> {
    let content_type = request.headers.get(header::CONTENT_TYPE).cloned();
    let body = request.body.collect().await?;
    let mut response = Response::new(StatusCode::OK).with_body(body);
    if let Some(content_type) = content_type {
        response.headers.insert(header::CONTENT_TYPE, content_type);
    }
    if let Some(peer) = ctx.peer {
        if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
            response.headers.insert("x-peer-id", value);
        }
    }
    Ok(response)
}

fn load_identity() -> p2p_http::Result<Ed25519Identity> {
    match std::env::var(IDENTITY_KEY_ENV) {
        Ok(seed) => Ok(Ed25519Identity::from_hex(seed.trim())?),
        Err(_) => {
            tracing::warn!("{IDENTITY_KEY_ENV} not set, using a fresh identity");
            Ok(Ed25519Identity::generate())
        }
    }
}

#[tokio::main]
async fn main() -> p2p_http::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listener.bind_address = listen.clone();
    }

    init_tracing(&config.observability.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "p2p-http node starting");

    if config.observability.metrics_enabled {
        init_metrics(&config.observability)?;
    }

    let identity = Arc::new(load_identity()?);
    tracing::info!(peer_id = %identity.peer_id(), "Node identity loaded");

    let registrar = Arc::new(Registrar::new());
    PingService::new(Arc::clone(&registrar)).start()?;
    registrar.handle(
        ECHO_PROTOCOL,
        Route::http(echo)
            .methods([Method::GET, Method::POST])
            .auth(AuthRequirement::Optional),
    )?;

    let shutdown = Shutdown::new();
    let auth = PeerIdAuth::from_config(identity, &config.auth);
    let service = HttpService::new(registrar, Some(auth), &config).with_shutdown(shutdown.token());
    let transport = TcpTransport::new();
    service.attach(&transport);

    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let service = service.clone();
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    service.update_limits(&config);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let listener = Listener::bind(&config.listener).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        max_streams = listener.max_streams(),
        "Listening for streams"
    );

    let serve = {
        let transport = transport.clone();
        let token = shutdown.token();
        tokio::spawn(async move { transport.serve(listener, token).await })
    };

    wait_for_signal().await;
    shutdown.drain(transport.tracker(), DRAIN_DEADLINE).await;
    let _ = serve.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
