//! Client-side read (download) and write (upload) transfer sessions.
//!
//! Each session binds a fresh ephemeral socket, talks to the server's
//! well-known port for the initial request, then locks onto the transfer ID
//! (address and port) of the first accepted response. Packets from any other
//! sender are logged and silently ignored; unlike the server, the client
//! sends no error reply to foreign senders.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::error::Error;
use crate::protocol::{Packet, TransferMode, BLOCK_SIZE};
use crate::retry::{exchange, RetryPolicy, Verdict};

/// Progress callback: `(bytes_transferred, total_size)`.
///
/// The total is `None` for downloads; no size-announcing option exists in
/// the protocol, so the length of an incoming file is never known ahead of
/// its final short block.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Cooperative cancellation flag, checked between blocks.
///
/// Cancellation cannot interrupt a blocked receive, so worst-case latency
/// is one retry-timeout interval.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Client transfer configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address with its well-known request port.
    pub server: SocketAddr,
    /// Receive-side retry policy.
    pub policy: RetryPolicy,
    /// Transport-failure retries for one DATA send (upload only).
    pub send_attempts: u32,
    /// Backoff between transport-failure retries.
    pub send_backoff: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            policy: RetryPolicy::CLIENT,
            send_attempts: 5,
            send_backoff: Duration::from_secs(1),
        }
    }
}

/// TFTP client. One download or upload per call; sessions share nothing.
pub struct TftpClient {
    config: ClientConfig,
}

impl TftpClient {
    pub fn new(server: SocketAddr) -> Self {
        Self::with_config(ClientConfig::new(server))
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Download `remote` from the server into `dest`.
    ///
    /// Returns the number of bytes written. On [`Error::Cancelled`] the
    /// partially written destination file is left for the caller to discard.
    pub async fn download(
        &self,
        remote: &str,
        dest: &Path,
        cancel: &CancelFlag,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, Error> {
        let socket = bind_ephemeral(self.config.server).await?;
        let mut file = File::create(dest).await?;

        let rrq = Packet::read_request(remote, TransferMode::Octet).encode();
        socket.send_to(&rrq, self.config.server).await?;
        tracing::debug!("RRQ sent for {remote:?} to {}", self.config.server);

        let mut peer: Option<SocketAddr> = None;
        let mut expected: u16 = 1;
        let mut bytes_written: u64 = 0;

        loop {
            let locked = peer;
            let (payload, src) = exchange(&socket, &self.config.policy, None, |buf, src| {
                if let Some(tid) = locked {
                    if src != tid {
                        tracing::debug!("ignoring packet from foreign sender {src} (TID is {tid})");
                        return Verdict::Ignore;
                    }
                }
                match Packet::decode(buf) {
                    Err(err) => Verdict::Abort(err),
                    Ok(Packet::Error { code, message }) => {
                        Verdict::Abort(Error::Protocol { code, message })
                    }
                    Ok(Packet::Data { block, payload }) if block == expected => {
                        Verdict::Accept((payload, src))
                    }
                    Ok(other) => {
                        tracing::debug!("ignoring unexpected packet: {other}");
                        Verdict::Ignore
                    }
                }
            })
            .await?;

            if peer.is_none() {
                tracing::debug!("server transfer port locked to {src}");
                peer = Some(src);
            }

            if !payload.is_empty() {
                file.write_all(&payload).await?;
                bytes_written += payload.len() as u64;
            }

            // A lost ACK is recovered by the peer's own DATA retransmission,
            // so the ACK itself is sent once.
            socket.send_to(&Packet::ack(expected).encode(), src).await?;
            if expected % 20 == 0 {
                tracing::debug!("ACK sent for block {expected}");
            }

            if let Some(report) = progress {
                report(bytes_written, None);
            }

            if payload.len() < BLOCK_SIZE {
                break;
            }
            expected = expected.wrapping_add(1);

            if cancel.is_cancelled() {
                tracing::info!("download of {remote:?} cancelled");
                return Err(Error::Cancelled);
            }
        }

        file.flush().await?;
        tracing::info!("downloaded {remote:?} ({bytes_written} bytes)");
        Ok(bytes_written)
    }

    /// Upload `source` to the server as `remote`.
    ///
    /// Returns the number of bytes sent. A cancelled upload stops sending
    /// further blocks; the server-side partial file remains.
    pub async fn upload(
        &self,
        source: &Path,
        remote: &str,
        cancel: &CancelFlag,
        progress: Option<&ProgressFn>,
    ) -> Result<u64, Error> {
        let socket = bind_ephemeral(self.config.server).await?;
        let total = tokio::fs::metadata(source).await?.len();
        let mut file = File::open(source).await?;

        let wrq = Packet::write_request(remote, TransferMode::Octet).encode();
        socket.send_to(&wrq, self.config.server).await?;
        tracing::debug!("WRQ sent for {remote:?} to {}", self.config.server);

        let mut peer: Option<SocketAddr> = None;
        let mut block: u16 = 0;
        let mut bytes_sent: u64 = 0;

        // The server's Ack(0) establishes its transfer port.
        let tid = self.await_ack(&socket, 0, &mut peer).await?;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("upload of {remote:?} cancelled");
                return Err(Error::Cancelled);
            }

            let chunk = read_block(&mut file).await?;
            block = block.wrapping_add(1);
            let data = Packet::data(block, chunk.clone()).encode();
            self.send_with_retry(&socket, &data, tid, block).await?;

            self.await_ack(&socket, block, &mut peer).await?;

            bytes_sent += chunk.len() as u64;
            if let Some(report) = progress {
                report(bytes_sent, Some(total));
            }

            if chunk.len() < BLOCK_SIZE {
                break;
            }
        }

        tracing::info!("uploaded {remote:?} ({bytes_sent} bytes)");
        Ok(bytes_sent)
    }

    /// Wait for the matching ACK, locking the TID on the first accepted one.
    async fn await_ack(
        &self,
        socket: &UdpSocket,
        expected: u16,
        peer: &mut Option<SocketAddr>,
    ) -> Result<SocketAddr, Error> {
        let locked = *peer;
        let src = exchange(socket, &self.config.policy, None, |buf, src| {
            if let Some(tid) = locked {
                if src != tid {
                    tracing::debug!("ignoring packet from foreign sender {src} (TID is {tid})");
                    return Verdict::Ignore;
                }
            }
            match Packet::decode(buf) {
                Err(err) => Verdict::Abort(err),
                Ok(Packet::Error { code, message }) => {
                    Verdict::Abort(Error::Protocol { code, message })
                }
                Ok(Packet::Ack { block }) if block == expected => Verdict::Accept(src),
                Ok(other) => {
                    tracing::debug!("ignoring unexpected packet: {other}");
                    Verdict::Ignore
                }
            }
        })
        .await?;

        if peer.is_none() {
            tracing::debug!("server transfer port locked to {src}");
            *peer = Some(src);
        }
        Ok(src)
    }

    /// Send one datagram, retrying transport failures with a backoff.
    ///
    /// Distinct from the receive-side retry policy: this only retries the
    /// send syscall itself, never a missing response.
    async fn send_with_retry(
        &self,
        socket: &UdpSocket,
        payload: &[u8],
        dest: SocketAddr,
        block: u16,
    ) -> Result<(), Error> {
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match socket.send_to(payload, dest).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if attempt >= attempts {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        "send of DATA block {block} failed (attempt {attempt}/{attempts}): {err}"
                    );
                    tokio::time::sleep(self.config.send_backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Bind an unspecified-address socket matching the server's address family.
async fn bind_ephemeral(server: SocketAddr) -> Result<UdpSocket, Error> {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    Ok(UdpSocket::bind(bind_addr).await?)
}

/// Read up to one full block from the file, short only at end of file.
pub(crate) async fn read_block(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn read_block_splits_at_block_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, vec![7u8; BLOCK_SIZE + 100]).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        assert_eq!(read_block(&mut file).await.unwrap().len(), BLOCK_SIZE);
        assert_eq!(read_block(&mut file).await.unwrap().len(), 100);
        assert_eq!(read_block(&mut file).await.unwrap().len(), 0);
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::new("127.0.0.1:69".parse().unwrap());
        assert_eq!(config.policy, RetryPolicy::CLIENT);
        assert_eq!(config.send_attempts, 5);
        assert_eq!(config.send_backoff, Duration::from_secs(1));
    }
}
