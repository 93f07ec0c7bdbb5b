//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::HeaderPolicy;
use super::routes::router;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server hosting the gated routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter shared by every request
    rate_limiter: Arc<RateLimiter>,
    /// Advisory header reporting
    headers: HeaderPolicy,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, headers: HeaderPolicy) -> Self {
        Self {
            addr,
            rate_limiter,
            headers,
        }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. An
    /// interval refill task, if configured, lives exactly as long as the server.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %self.addr,
            capacity = self.rate_limiter.capacity(),
            "Starting HTTP server with admission gate"
        );

        let refill_task = self.rate_limiter.spawn_interval_refill();
        let app = router(self.rate_limiter.clone(), self.headers);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await;

        if let Some(task) = refill_task {
            task.abort();
        }

        result.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
