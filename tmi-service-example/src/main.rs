//! Runnable example wiring `tmi-service` to in-memory collaborators.
//!
//! Mirrors the teacher's `oprf-service-example`: a thin binary that
//! supplies the project-specific pieces (here, a toy bearer-token
//! authenticator, an open access-control policy, and an in-memory
//! diagram store) and serves the resulting router with graceful
//! shutdown on Ctrl-C.

use std::net::SocketAddr;

use clap::Parser;
use tmi_service::TmiServiceBuilder;
use tmi_service::config::TmiServiceConfig;
use tokio_util::sync::CancellationToken;

mod in_memory_access_control;
mod in_memory_authenticator;
mod in_memory_store;

use in_memory_access_control::InMemoryAccessControl;
use in_memory_authenticator::InMemoryAuthenticator;
use in_memory_store::InMemoryDiagramStore;

/// Configuration for the example binary.
#[derive(Parser, Debug)]
struct ExampleConfig {
    /// The bind address of the axum server.
    #[clap(long, env = "TMI_EXAMPLE_BIND_ADDR", default_value = "0.0.0.0:4322")]
    bind_addr: SocketAddr,

    /// The TMI service config.
    #[clap(flatten)]
    service_config: TmiServiceConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tmi_service_example=info,tmi_service=info"))
        .init();

    let config = ExampleConfig::parse();
    tracing::info!(?config, "starting tmi-service-example");

    let authenticator = InMemoryAuthenticator::default();
    let access_control = InMemoryAccessControl::default();
    let store = InMemoryDiagramStore::default();

    let router = TmiServiceBuilder::with_defaults(config.service_config, authenticator, access_control, store).build();

    let cancellation_token = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("can bind to configured address");
    tracing::info!(addr = %config.bind_addr, "listening");

    let shutdown = cancellation_token.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            tracing::error!("axum server error: {err:?}");
        }
    });

    tokio::signal::ctrl_c().await.expect("can install ctrl-c handler");
    tracing::info!("received ctrl-c, shutting down");
    cancellation_token.cancel();

    if tokio::time::timeout(std::time::Duration::from_secs(10), server).await.is_err() {
        tracing::warn!("server did not shut down within the grace period");
    }
}
