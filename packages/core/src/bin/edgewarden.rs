//! EdgeWarden server binary
//!
//! Serves the HTTP/WebSocket surface over filesystem-backed storage. The
//! data directory, bind address, and core tunables come from `EDGEWARDEN_*`
//! environment variables.

use edgewarden_core::config::CoreConfig;
use edgewarden_core::db::{FsObjectStore, KvMutationLog};
use edgewarden_core::server::run_server;
use edgewarden_core::tenant::TenantRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir =
        std::env::var("EDGEWARDEN_DATA_DIR").unwrap_or_else(|_| "./edgewarden-data".to_string());
    let addr: SocketAddr = std::env::var("EDGEWARDEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7070".to_string())
        .parse()?;
    let config = Arc::new(CoreConfig::from_env());

    info!(data_dir, %addr, "starting edgewarden");

    let object_store = Arc::new(FsObjectStore::new(format!("{data_dir}/objects")));
    let log = Arc::new(KvMutationLog::new(FsObjectStore::new(format!(
        "{data_dir}/log"
    ))));
    let registry = TenantRegistry::new(object_store, log, config);

    run_server(addr, registry).await
}
