//! A real TCP server for end-to-end tests.

use crate::server::Server;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Serves a [`Server`] on an ephemeral localhost port.
pub struct HttpTestServer {
    addr: SocketAddr,
    repo_path: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl HttpTestServer {
    /// Binds `127.0.0.1:0` and starts serving in a background task.
    pub async fn start(server: Server) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let repo_path = server.repo_path();
        let (shutdown, signal) = oneshot::channel::<()>();

        let router = server.router();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        tracing::debug!(%addr, repo_path = %repo_path, "Test server started");
        Ok(Self {
            addr,
            repo_path,
            shutdown: Some(shutdown),
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://{addr}/{owner}/{repo}.git`
    pub fn url(&self) -> String {
        format!("http://{}/{}", self.addr, self.repo_path)
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn stop(mut self) -> std::io::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}
