//! Process entry point: parses configuration, connects the store, and
//! serves the single daemon-facing `HostStream` RPC. The REST API that end
//! users call into (`CreateSandbox`, `RunCommand`, ...) is explicitly out
//! of scope for this crate (spec §1) — it is a separate, external service
//! that embeds `sandboxd_core::Orchestrator` against the same `Store` and
//! `Registry` this process builds.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use sandboxd_core::{HostStreamService, StreamHandler};
use sandboxd_registry::Registry;
use sandboxd_store::{PgStore, Store};
use sandboxd_wire::proto::host_stream_server::HostStreamServer;

/// Process configuration. Every value is overridable by flag or
/// environment variable, matching the teacher's `clap` usage elsewhere in
/// the workspace (`pegh`, `peoci`).
#[derive(Parser, Debug)]
#[command(version, about = "sandboxd control plane: daemon registry + dispatch", long_about = None)]
struct Args {
    /// Address the daemon-facing gRPC stream listens on.
    #[arg(long, env = "SANDBOXD_LISTEN_ADDR", default_value = "0.0.0.0:7770")]
    listen_addr: String,

    /// Postgres connection string for the durable store.
    #[arg(long, env = "SANDBOXD_DATABASE_URL")]
    database_url: String,

    /// Run pending migrations against `database_url` on startup.
    #[arg(long, env = "SANDBOXD_MIGRATE_ON_START", default_value_t = true)]
    migrate_on_start: bool,

    /// Staleness bound before a daemon is considered disconnected. The
    /// heartbeat monitor's tick interval is derived from this value
    /// (`max(timeout/3, 10s)`); it is read once at startup (spec §9).
    #[arg(long, env = "SANDBOXD_HEARTBEAT_TIMEOUT_SECS", default_value_t = 90)]
    heartbeat_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let store = PgStore::connect(&args.database_url).await?;
    if args.migrate_on_start {
        store.migrate().await?;
    }
    let store: Arc<dyn Store> = Arc::new(store);

    let registry = Arc::new(Registry::new());
    let heartbeat_timeout = Duration::from_secs(args.heartbeat_timeout_secs);
    let stream_handler = StreamHandler::new(registry, store, heartbeat_timeout);

    let addr = args.listen_addr.parse()?;
    info!("sandboxd listening on {addr}, heartbeat_timeout={heartbeat_timeout:?}");

    tonic::transport::Server::builder()
        .add_service(HostStreamServer::new(HostStreamService::new(stream_handler)))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c, shutting down");
        })
        .await?;

    Ok(())
}
