//! Local mirror servers: one static file server per job, rooted at the
//! job's output directory so relative assets resolve against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use engine_logging::{engine_debug, engine_info, engine_warn};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;

use crate::config::PortRange;
use crate::error::ServerError;

const STOP_GRACE: Duration = Duration::from_secs(2);

struct RunningServer {
    port: u16,
    root: PathBuf,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct LocalServerRegistry {
    ports: PortRange,
    servers: Mutex<HashMap<String, RunningServer>>,
}

impl LocalServerRegistry {
    pub fn new(ports: PortRange) -> Self {
        Self {
            ports,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts serving `root` for `key` and returns the bound port. A server
    /// already registered under `key` is stopped first.
    pub async fn start(&self, key: &str, root: &Path) -> Result<u16, ServerError> {
        let mut servers = self.servers.lock().await;
        if let Some(previous) = servers.remove(key) {
            engine_debug!("Replacing local server for {key} on port {}", previous.port);
            stop_server(previous).await;
        }

        let taken: Vec<u16> = servers.values().map(|server| server.port).collect();
        let listener = self.bind_free_port(&taken).await?;
        let port = listener.local_addr()?.port();

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = Router::new().fallback_service(ServeDir::new(root));
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await;
            if let Err(err) = served {
                engine_warn!("Local server on port {port} failed: {err}");
            }
        });

        engine_info!("Serving {} on http://127.0.0.1:{port}", root.display());
        servers.insert(
            key.to_string(),
            RunningServer {
                port,
                root: root.to_path_buf(),
                shutdown,
                task,
            },
        );
        Ok(port)
    }

    /// Stops the server for `key`. Returns false when none was running.
    pub async fn stop(&self, key: &str) -> bool {
        let server = self.servers.lock().await.remove(key);
        match server {
            Some(server) => {
                engine_info!(
                    "Stopping local server for {} on port {}",
                    server.root.display(),
                    server.port
                );
                stop_server(server).await;
                true
            }
            None => false,
        }
    }

    pub async fn port(&self, key: &str) -> Option<u16> {
        self.servers.lock().await.get(key).map(|server| server.port)
    }

    pub async fn shutdown_all(&self) {
        let servers: Vec<RunningServer> = self
            .servers
            .lock()
            .await
            .drain()
            .map(|(_, server)| server)
            .collect();
        for server in servers {
            stop_server(server).await;
        }
    }

    async fn bind_free_port(&self, taken: &[u16]) -> Result<TcpListener, ServerError> {
        for port in self.ports.start..=self.ports.end {
            if taken.contains(&port) {
                continue;
            }
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(err) => engine_debug!("Port {port} unavailable: {err}"),
            }
        }
        Err(ServerError::Allocation {
            start: self.ports.start,
            end: self.ports.end,
        })
    }
}

async fn stop_server(server: RunningServer) {
    let RunningServer {
        port,
        shutdown,
        mut task,
        ..
    } = server;
    let _ = shutdown.send(());
    if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
        engine_warn!("Local server on port {port} did not stop in time, aborting");
        task.abort();
    }
}
