//! laile — a durable webhook relay.
//!
//! Inbound requests land on the ingress surface, are persisted
//! transactionally with one delivery attempt per configured forwarder, and
//! are then delivered at least once by the scheduler: workers share the load
//! through a consistent-hash ring over the database, claim due attempts with
//! skip-locked row locks, and retry failures with exponential backoff over
//! HTTP or AMQP transports.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod admin;
pub mod config;
pub mod db;
pub mod errors;
pub mod forwarders;
pub mod hashing;
pub mod ingress;
pub mod listener;
pub mod membership;
pub mod scheduler;
pub mod telemetry;

pub use config::{Args, Config};
use db::Database;
use membership::Membership;
use scheduler::Scheduler;

/// Shared state for the HTTP surfaces.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
}

/// The assembled process: store, both HTTP surfaces, the notify listener,
/// and the worker loop.
pub struct Application {
    config: Arc<Config>,
    db: Database,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db = Database::connect_from_env().await?;
        db.migrate().await?;

        Ok(Self {
            config: Arc::new(config),
            db,
        })
    }

    /// Run everything until the shutdown future resolves.
    pub async fn serve(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let membership = Membership::new(Membership::generate_node_name());
        membership.register(&self.db).await?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let listener_task = tokio::spawn(listener::run_listener(
            self.db.pool().clone(),
            event_tx,
            shutdown.clone(),
        ));

        let worker = Arc::new(Scheduler::new(
            self.db.clone(),
            self.config.clone(),
            membership,
        )?);
        let scheduler_task = tokio::spawn(worker.run(event_rx, shutdown.clone()));

        let state = AppState {
            db: self.db.clone(),
            config: self.config.clone(),
        };

        let ingress_addr = SocketAddr::from(([0, 0, 0, 0], self.config.settings.listener_port));
        let admin_addr = SocketAddr::from(([0, 0, 0, 0], self.config.settings.admin_port));

        let ingress_listener = tokio::net::TcpListener::bind(ingress_addr).await?;
        let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;
        tracing::info!(%ingress_addr, %admin_addr, "Servers listening");

        let ingress_server = axum::serve(ingress_listener, ingress::router(state.clone()))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let admin_server = axum::serve(admin_listener, admin::router(state))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());

        let ingress_task = tokio::spawn(async move { ingress_server.await });
        let admin_task = tokio::spawn(async move { admin_server.await });

        shutdown_signal.await;
        tracing::info!("Shutting down");
        shutdown.cancel();

        ingress_task.await??;
        admin_task.await??;
        scheduler_task.await?;
        listener_task.await?;

        Ok(())
    }
}
