//! routecast - Real-time namespace router
//!
//! Boots a WebSocket server from a JSON configuration file. The binary
//! ships a small set of built-in services that configuration can reference:
//!
//! - `EchoController::handle` replies with the request parameters
//! - `BroadcastController::publish` emits `{event, data}` to the caller's namespace
//! - filter `require_user` halts requests from anonymous connections
//! - listener `presence` logs connects and disconnects

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use routecast::events::{CLIENT_CONNECT, CLIENT_DISCONNECT};
use routecast::hub::spawn_relay;
use routecast::protocol::error_reply;
use routecast::store::{connect_store, select_store};
use routecast::{
    Bridge, Broadcaster, Config, Container, FilterOutcome, Hub, IdentityResolver, Kernel, Route,
    Server, action_fn, filter_fn, listener_fn,
};

/// Handshake header carrying the caller's user name
const USER_HEADER: &str = "x-routecast-user";

#[derive(Parser, Debug)]
#[command(name = "routecast")]
#[command(about = "Real-time namespace router bridging WebSocket messages to controller actions")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Takes the user name from a handshake header
struct HeaderIdentity;

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HashMap<String, String>) -> Option<Value> {
        headers
            .get(USER_HEADER)
            .filter(|name| !name.is_empty())
            .map(|name| json!({ "name": name }))
    }
}

fn register_services(container: &mut Container, broadcaster: Broadcaster) {
    container.register_action(
        "EchoController",
        "handle",
        action_fn(|req, res| async move {
            res.reply(Value::Object(req.query().to_map()))?;
            Ok(())
        }),
    );

    container.register_action(
        "BroadcastController",
        "publish",
        action_fn(move |req, res| {
            let broadcaster = broadcaster.clone();
            async move {
                let event = req
                    .body()
                    .get("event")
                    .and_then(|event| event.as_str().map(str::to_string))
                    .context("missing event")?;
                let data = req.body().get("data").unwrap_or(Value::Null);

                broadcaster
                    .emit(&req.connection().namespace, &event, data)
                    .await?;
                res.reply(json!({ "delivered": true }))?;
                Ok(())
            }
        }),
    );

    container.register_filter(
        "require_user",
        filter_fn(|req, _res| async move {
            if req.user().is_some() {
                FilterOutcome::Continue
            } else {
                FilterOutcome::Halt(error_reply("unauthorized", "authentication required"))
            }
        }),
    );

    container.register_listener(
        "presence",
        listener_fn(|event| async move {
            if let Some(conn) = event.connection() {
                if event.name.ends_with(CLIENT_CONNECT) {
                    info!(conn_id = conn.id, namespace = %conn.namespace, remote = %conn.remote_addr, "presence: joined");
                } else if event.name.ends_with(CLIENT_DISCONNECT) {
                    info!(conn_id = conn.id, namespace = %conn.namespace, "presence: left");
                }
            }
            Ok(())
        }),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("routecast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if config.routes.is_empty() {
        warn!("No routes configured, serving the echo route on /");
        config.routes.push(Route::new("echo", "EchoController", "handle"));
    }

    let selection = select_store(&config.store)?;
    let store = connect_store(&selection).await?;
    let broadcaster = Broadcaster::new(store.clone());

    let mut container = Container::new();
    register_services(&mut container, broadcaster);
    container
        .load_config(&config)
        .context("failed to load configuration into the container")?;

    let kernel = Kernel::boot(&container)?;
    let hub = Arc::new(Hub::new());
    let relay = spawn_relay(hub.clone(), store, kernel.namespaces()).await?;

    let bridge = Bridge::new(kernel);
    let server = Arc::new(Server::new(&bridge, hub).with_identity(Arc::new(HeaderIdentity)));
    let (addr, server_handle) = server.bind(&config.listen).await?;

    info!(
        addr = %addr,
        store = %config.store.kind,
        reply_timeout_ms = ?config.reply_timeout_ms,
        "Starting routecast"
    );

    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                error!(error = %e, "Server task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    relay.abort();
    info!("routecast shutdown");
    Ok(())
}
