use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::healthz;
use super::types::HealthProbe;

/// HTTP server exposing device plugin health
pub struct HealthServer {
    listen_addr: String,
    probe: Arc<dyn HealthProbe>,
}

impl HealthServer {
    pub fn new(listen_addr: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            probe,
        }
    }

    fn app(probe: Arc<dyn HealthProbe>) -> impl Endpoint {
        Route::new()
            .at("/healthz", get(healthz))
            .data(probe)
            .with(Tracing)
    }

    /// Start the health server and serve until `token` is cancelled
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting health server on {}", self.listen_addr);

        let app = Self::app(self.probe);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("health server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("health server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("health server shutdown requested");
                Ok(())
            }
        }
    }
}
