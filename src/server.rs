//! TFTP server listener.
//!
//! Owns the well-known request port. Each inbound RRQ/WRQ is dispatched to a
//! [`TransferWorker`](crate::worker::TransferWorker) task gated by a bounded
//! worker pool; everything else arriving on the request port is dropped
//! without a reply, since the sender has no established transfer ID yet.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};

use crate::error::Error;
use crate::protocol::{Packet, MAX_PACKET_SIZE};
use crate::retry::RetryPolicy;
use crate::worker::TransferWorker;

/// TFTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the well-known request port.
    pub bind_address: String,
    /// Base directory confining all file access; created if absent.
    pub base_dir: PathBuf,
    /// Receive-side retry policy handed to each worker.
    pub policy: RetryPolicy,
    /// Maximum number of concurrently running transfers; requests beyond
    /// this queue.
    pub worker_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:69".to_string(),
            base_dir: PathBuf::from("./tftp-server-files"),
            policy: RetryPolicy::SERVER,
            worker_limit: 10,
        }
    }
}

/// Requests the listener loop to stop. Stopping is prompt: the loop observes
/// the signal without waiting out a receive timeout.
#[derive(Debug, Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// TFTP server: request listener plus its worker pool.
pub struct TftpServer {
    config: ServerConfig,
    socket: Option<UdpSocket>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    limiter: Arc<Semaphore>,
}

impl TftpServer {
    pub fn new(config: ServerConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let limiter = Arc::new(Semaphore::new(config.worker_limit.max(1)));
        Self {
            config,
            socket: None,
            stop_tx,
            stop_rx,
            limiter,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for stopping the listener from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// The bound request-port address, once [`bind`](Self::bind) has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Create the base directory if absent and bind the request socket.
    pub async fn bind(&mut self) -> Result<SocketAddr, Error> {
        tokio::fs::create_dir_all(&self.config.base_dir).await?;

        let socket = UdpSocket::bind(&self.config.bind_address).await?;
        let addr = socket.local_addr()?;
        tracing::info!(
            "TFTP server listening on {addr}, base directory {}",
            self.config.base_dir.display()
        );
        self.socket = Some(socket);
        Ok(addr)
    }

    /// Run the request loop until stopped.
    pub async fn run(&mut self) -> Result<(), Error> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return Ok(()),
        };

        let mut stop_rx = self.stop_rx.clone();
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, client) = received?;
                    self.dispatch(&buf[..len], client);
                }
            }
        }

        tracing::info!("TFTP server stopped");
        Ok(())
    }

    /// Decode one request-port datagram and hand it to a worker.
    fn dispatch(&self, datagram: &[u8], client: SocketAddr) {
        let request = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!("dropping undecodable datagram from {client}: {err}");
                return;
            }
        };

        match &request {
            Packet::ReadRequest { filename, mode } => {
                tracing::info!("RRQ for {filename:?} in {mode} mode from {client}");
            }
            Packet::WriteRequest { filename, mode } => {
                tracing::info!("WRQ for {filename:?} in {mode} mode from {client}");
            }
            other => {
                tracing::debug!(
                    "dropping {} on request port from {client}",
                    other.opcode()
                );
                return;
            }
        }

        let base = self.config.base_dir.clone();
        let policy = self.config.policy;
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            TransferWorker::run(request, client, base, policy).await;
        });
    }
}

/// Bind and run a TFTP server. Convenience wrapper around [`TftpServer`].
pub async fn run_server(bind_address: String, base_dir: PathBuf) -> Result<(), Error> {
    let mut server = TftpServer::new(ServerConfig {
        bind_address,
        base_dir,
        ..Default::default()
    });
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.base_dir, PathBuf::from("./tftp-server-files"));
        assert_eq!(config.policy, RetryPolicy::SERVER);
        assert_eq!(config.worker_limit, 10);
    }

    #[tokio::test]
    async fn bind_creates_base_dir_and_reports_addr() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("files");
        let mut server = TftpServer::new(ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            base_dir: base.clone(),
            ..Default::default()
        });

        assert!(server.local_addr().is_none());
        let addr = server.bind().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(base.is_dir());
    }

    #[tokio::test]
    async fn stop_handle_terminates_run() {
        let dir = tempdir().unwrap();
        let mut server = TftpServer::new(ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        server.bind().await.unwrap();
        let stop = server.stop_handle();

        let task = tokio::spawn(async move { server.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener should observe the stop signal promptly")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stop_before_run_is_observed() {
        let dir = tempdir().unwrap();
        let mut server = TftpServer::new(ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        server.bind().await.unwrap();
        server.stop_handle().stop();

        tokio::time::timeout(Duration::from_secs(1), server.run())
            .await
            .expect("run should return immediately")
            .unwrap();
    }
}
