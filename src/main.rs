//! reelwire: service entrypoint.
//! Loads config, wires stores and pipeline, starts the scheduler, queue
//! workers and lease renewal, then serves the HTTP surface until Ctrl-C or
//! SIGTERM, after which the background tasks are cancelled and joined.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use reelwire::app::{shutdown_signal, wind_down};
use reelwire::{init_tracing, metrics::Metrics, AppConfig, Services};
use shuttle_axum::AxumService;
use shuttle_runtime::Service;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct ReelwireService {
    router: Router,
    services: Services,
}

#[async_trait::async_trait]
impl Service for ReelwireService {
    async fn bind(self, addr: SocketAddr) -> Result<(), shuttle_runtime::Error> {
        let shutdown = CancellationToken::new();
        let handles = self.services.spawn_background(shutdown.clone());
        tracing::info!(tasks = handles.len(), "background tasks started");

        let served = tokio::select! {
            res = AxumService(self.router).bind(addr) => res,
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
        };

        wind_down(&shutdown, handles, SHUTDOWN_GRACE).await;
        served
    }
}

#[shuttle_runtime::main]
async fn axum() -> Result<ReelwireService, shuttle_runtime::Error> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load_default()?;
    let services = Services::build(config).await?;

    let mut router = services.router();
    match Metrics::init() {
        Ok(metrics) => router = router.merge(metrics.router()),
        Err(e) => tracing::warn!(error = %e, "metrics exporter disabled"),
    }

    Ok(ReelwireService { router, services })
}
