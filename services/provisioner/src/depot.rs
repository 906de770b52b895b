//! Artifact depot.
//!
//! Serves a directory of build artifacts (packages, images) over plain
//! HTTP so test nodes can consume it as a package repository. The depot
//! has its own lifecycle, independent of any bring-up run.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// HTTP file server over one artifact directory.
pub struct Depot {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<io::Result<()>>,
}

impl Depot {
    /// Binds `bind` and starts serving `dir` in a background task.
    /// Port 0 picks a free port; [`Depot::addr`] reports the bound one.
    pub async fn serve(dir: &Path, bind: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .fallback_service(ServeDir::new(dir))
            .layer(TraceLayer::new_for_http());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut shutdown_rx = shutdown_rx;
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    debug!("Depot shutting down");
                })
                .await
        });

        info!(addr = %addr, directory = %dir.display(), "Artifact depot serving");
        Ok(Self {
            addr,
            shutdown,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL nodes use in their repository configuration.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Stops the server and waits for in-flight requests to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.server.await;
    }
}
