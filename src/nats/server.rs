//! Embedded NATS broker
//!
//! When no broker address is configured the NATS backends run a private
//! `nats-server` child process and connect to it. The process is restarted
//! if it exits, and killed when the backend stops or is dropped.

use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cache::retry::retry_forever;
use crate::types::{CacheError, Result};

/// How long one readiness check waits for the TCP port
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Probes per start attempt before the attempt counts as failed
const READY_ATTEMPTS: u32 = 10;

pub struct EmbeddedServer {
    bin: String,
    host: String,
    port: u16,
    jetstream: bool,
    child: Mutex<Option<Child>>,
}

impl EmbeddedServer {
    pub fn new(bin: &str, listen: &str, jetstream: bool) -> Result<Self> {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| CacheError::Config(format!("{} is not host:port", listen)))?;
        let port = port
            .parse()
            .map_err(|_| CacheError::Config(format!("invalid port in {}", listen)))?;
        Ok(Self {
            bin: bin.to_string(),
            host: host.to_string(),
            port,
            jetstream,
            child: Mutex::new(None),
        })
    }

    /// Client URL of the embedded broker
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// Command line for the broker process
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "-a".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if self.jetstream {
            args.push("-js".to_string());
        }
        args
    }

    /// Start the broker, retrying until it accepts connections
    ///
    /// Returns `false` if shutdown fired first.
    pub async fn start(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        retry_forever("embedded nats-server start", delay, shutdown, || {
            self.start_once()
        })
        .await
        .is_some()
    }

    async fn start_once(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        let running = match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        };
        if !running {
            info!(bin = %self.bin, url = %self.url(), "Starting embedded nats-server");
            let spawned = Command::new(&self.bin)
                .args(self.command_args())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| CacheError::Io(format!("failed to spawn {}: {}", self.bin, e)))?;
            *child = Some(spawned);
        }

        for attempt in 0..READY_ATTEMPTS {
            let addr = (self.host.as_str(), self.port);
            match tokio::time::timeout(READY_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => {
                    info!(url = %self.url(), "Embedded nats-server accepting connections");
                    return Ok(());
                }
                Ok(Err(e)) => debug!(attempt, error = %e, "nats-server not ready"),
                Err(_) => debug!(attempt, "nats-server readiness check timed out"),
            }
            if let Some(c) = child.as_mut() {
                if let Ok(Some(status)) = c.try_wait() {
                    *child = None;
                    return Err(CacheError::Io(format!("nats-server exited with {}", status)));
                }
            }
            tokio::time::sleep(READY_PROBE_TIMEOUT).await;
        }

        Err(CacheError::Io(format!(
            "nats-server not accepting connections on {}",
            self.url()
        )))
    }

    /// Kill the broker process if it is running
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to stop embedded nats-server");
            } else {
                info!("Embedded nats-server stopped");
            }
        }
    }
}
