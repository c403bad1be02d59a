//! Minimal HTTP health endpoint for probes and humans.
//!
//! Serves lightweight JSON on:
//! - `GET /live`   — liveness: 200 while the daemon process runs
//! - `GET /ready`  — readiness: 200 when both Postgres and the pooler
//!   answer a trivial query within 500 ms, 503 otherwise
//! - `GET /status` — uptime and identity detail
//!
//! Raw TCP + tokio; a daemon this small does not need an HTTP framework.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use kestrel_common::config::KestrelConfig;
use kestrel_common::error::KestrelError;
use kestrel_postgres::client::check_db;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

struct HealthState {
    started: Instant,
    config: KestrelConfig,
}

impl HealthState {
    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Probe one database endpoint; `Ok` means it answered in time.
    async fn probe(&self, host: &str, port: u16) -> Result<(), String> {
        let user = &self.config.postgres.user;
        match tokio::time::timeout(PROBE_TIMEOUT, check_db(host, port, user, PROBE_TIMEOUT)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("probe timed out after {}ms", PROBE_TIMEOUT.as_millis())),
        }
    }
}

/// Run the health server until shutdown. A bind failure is fatal.
pub async fn run_health_server(
    config: KestrelConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KestrelError> {
    let addr = config.health.listen_addr.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|err| {
        KestrelError::Internal(format!("failed to bind health server on {addr}: {err}"))
    })?;
    tracing::info!(%addr, "Health server listening");

    let state = Arc::new(HealthState {
        started: Instant::now(),
        config,
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_request(stream, &state).await {
                                tracing::debug!(%err, "Health request error");
                            }
                        });
                    }
                    Err(err) => tracing::debug!(%err, "Health accept error"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Health server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_request(
    mut stream: tokio::net::TcpStream,
    state: &HealthState,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = respond(path, state).await;

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

async fn respond(path: &str, state: &HealthState) -> (&'static str, String) {
    match path {
        "/live" | "/healthz" => {
            let body = serde_json::json!({
                "live": true,
                "node": state.config.cluster.node_name,
                "uptime_secs": state.uptime_secs(),
            });
            ("200 OK", body.to_string())
        }
        "/ready" | "/readyz" => {
            let postgres = state
                .probe(&state.config.postgres.host, state.config.postgres.port)
                .await;
            let pooler = state
                .probe(&state.config.pooler.host, state.config.pooler.port)
                .await;

            let ready = postgres.is_ok() && pooler.is_ok();
            let body = serde_json::json!({
                "ready": ready,
                "postgres_ok": postgres.is_ok(),
                "postgres_error": postgres.err(),
                "pooler_ok": pooler.is_ok(),
                "pooler_error": pooler.err(),
            });
            if ready {
                ("200 OK", body.to_string())
            } else {
                ("503 Service Unavailable", body.to_string())
            }
        }
        "/status" => {
            let body = serde_json::json!({
                "status": "ok",
                "cluster": state.config.cluster.name,
                "node": state.config.cluster.node_name,
                "uptime_secs": state.uptime_secs(),
            });
            ("200 OK", body.to_string())
        }
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    }
}
