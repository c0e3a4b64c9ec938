//! Per-request transfer worker.
//!
//! Each accepted RRQ/WRQ runs on its own worker with a freshly bound
//! ephemeral socket; the socket's local port is the transfer ID the client
//! sees. The worker enforces the client's TID for every packet of the
//! exchange: a packet from any other sender is answered directly with
//! `Error{UnknownTransferID}` and the wait for the legitimate client
//! continues.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

use crate::client::read_block;
use crate::error::Error;
use crate::guard;
use crate::protocol::{ErrorCode, Packet, TransferMode, BLOCK_SIZE};
use crate::retry::{exchange, RetryPolicy, Verdict};

pub(crate) struct TransferWorker {
    socket: UdpSocket,
    client: SocketAddr,
    base: PathBuf,
    policy: RetryPolicy,
}

impl TransferWorker {
    /// Perform one complete transfer for a request accepted by the listener.
    ///
    /// All failures are handled here: protocol errors are reported to the
    /// client from the worker socket, everything is logged, nothing
    /// propagates to the listener.
    pub(crate) async fn run(
        request: Packet,
        client: SocketAddr,
        base: PathBuf,
        policy: RetryPolicy,
    ) {
        let bind_addr = if client.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!("[{client}] failed to bind transfer socket: {err}");
                return;
            }
        };
        if let Ok(addr) = socket.local_addr() {
            tracing::debug!("[{client}] transfer socket bound to {addr}");
        }

        let worker = Self {
            socket,
            client,
            base,
            policy,
        };

        let result = match request {
            Packet::ReadRequest { filename, mode } => {
                note_mode(client, mode);
                worker.serve_read(&filename).await
            }
            Packet::WriteRequest { filename, mode } => {
                note_mode(client, mode);
                worker.serve_write(&filename).await
            }
            other => {
                tracing::debug!("[{client}] worker dispatched with non-request packet {other}");
                return;
            }
        };

        if let Err(err) = result {
            tracing::warn!("[{client}] transfer failed: {err}");
        }
    }

    /// Serve an RRQ: stream the requested file to the client in 512-byte
    /// blocks, each re-sent per retry attempt until its ACK arrives.
    async fn serve_read(&self, filename: &str) -> Result<(), Error> {
        let mut file = match self.open_for_read(filename).await {
            Ok(file) => file,
            Err(err) => return Err(self.reject(err).await),
        };
        let size = file.metadata().await?.len();
        tracing::info!("[{}] sending {filename:?} ({size} bytes)", self.client);

        let mut block: u16 = 0;
        loop {
            let chunk = match read_block(&mut file).await {
                Ok(chunk) => chunk,
                Err(err) => return Err(self.reject(Error::Io(err)).await),
            };
            let last = chunk.len() < BLOCK_SIZE;
            block = block.wrapping_add(1);

            let data = Packet::data(block, chunk).encode();
            self.await_ack(&data, block).await?;

            if last {
                break;
            }
        }

        tracing::info!("[{}] sent {filename:?}", self.client);
        Ok(())
    }

    /// Serve a WRQ: receive the client's file block by block.
    ///
    /// The destination is opened create-exclusive so the existence check and
    /// the creation are atomic. A mid-transfer I/O failure deletes the
    /// partially written file before the error propagates.
    async fn serve_write(&self, filename: &str) -> Result<(), Error> {
        let path = match guard::resolve(&self.base, filename) {
            Ok(path) => path,
            Err(err) => return Err(self.reject(err).await),
        };

        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return Err(self.reject(Error::Io(err)).await);
            }
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let err = Error::protocol(ErrorCode::FileExists, "File already exists");
                return Err(self.reject(err).await);
            }
            Err(err) => return Err(self.reject(Error::Io(err)).await),
        };

        tracing::info!("[{}] receiving {filename:?}", self.client);

        let mut expected: u16 = 1;
        let mut ack = Packet::ack(0).encode();
        let result = loop {
            // The wait transmits the pending ACK and re-sends it on each
            // timed-out attempt.
            let payload = match self.await_data(expected, &ack).await {
                Ok(payload) => payload,
                Err(err) => break Err(err),
            };

            if let Err(err) = file.write_all(&payload).await {
                break Err(self.reject(Error::Io(err)).await);
            }

            ack = Packet::ack(expected).encode();
            if payload.len() < BLOCK_SIZE {
                if let Err(err) = self.socket.send_to(&ack, self.client).await {
                    break Err(Error::Io(err));
                }
                break Ok(());
            }
            expected = expected.wrapping_add(1);
        };

        match result {
            Ok(()) => {
                file.flush().await?;
                tracing::info!("[{}] received {filename:?}", self.client);
                Ok(())
            }
            Err(err) => {
                drop(file);
                if matches!(err, Error::Io(_)) {
                    if let Err(remove) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(
                            "[{}] failed to remove partial file {}: {remove}",
                            self.client,
                            path.display()
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Path Guard plus the read-side policy checks, in that order: the
    /// containment check runs before any existence check so an out-of-bounds
    /// name never probes the filesystem.
    async fn open_for_read(&self, filename: &str) -> Result<File, Error> {
        let path = guard::resolve(&self.base, filename)?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::protocol(
                    ErrorCode::FileNotFound,
                    format!("file {filename:?} not found"),
                ));
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(Error::protocol(
                    ErrorCode::AccessViolation,
                    format!("cannot read {filename:?}"),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Err(Error::protocol(
                ErrorCode::FileNotFound,
                format!("file {filename:?} not found"),
            ));
        }

        match File::open(&path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => Err(Error::protocol(
                ErrorCode::AccessViolation,
                format!("cannot read {filename:?}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Send a DATA packet and wait for its matching ACK, re-sending the
    /// packet at each retry attempt.
    async fn await_ack(&self, data: &[u8], block: u16) -> Result<(), Error> {
        let client = self.client;
        exchange(
            &self.socket,
            &self.policy,
            Some((data, client)),
            |buf, src| self.classify(buf, src, |packet| match packet {
                Packet::Ack { block: acked } if *acked == block => Some(()),
                _ => None,
            }),
        )
        .await
    }

    /// Wait for the expected DATA block, re-sending `ack` (the ACK for the
    /// previous block) at each retry attempt.
    async fn await_data(&self, expected: u16, ack: &[u8]) -> Result<Vec<u8>, Error> {
        let client = self.client;
        exchange(
            &self.socket,
            &self.policy,
            Some((ack, client)),
            |buf, src| self.classify(buf, src, |packet| match packet {
                Packet::Data { block, payload } if *block == expected => Some(payload.clone()),
                _ => None,
            }),
        )
        .await
    }

    /// Common packet classification for both directions: TID enforcement,
    /// malformed-drop, and peer error handling, with `accept` deciding
    /// whether a well-formed packet from the client qualifies.
    fn classify<T>(
        &self,
        buf: &[u8],
        src: SocketAddr,
        accept: impl Fn(&Packet) -> Option<T>,
    ) -> Verdict<T> {
        if src != self.client {
            tracing::warn!(
                "[{}] packet from foreign sender {src}, replying with unknown TID",
                self.client
            );
            let reply = Packet::error(
                ErrorCode::UnknownTransferId,
                ErrorCode::UnknownTransferId.default_message(),
            )
            .encode();
            return Verdict::Reject { reply, dest: src };
        }

        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!("[{}] dropping undecodable datagram: {err}", self.client);
                return Verdict::Ignore;
            }
        };

        if let Packet::Error { code, message } = &packet {
            return Verdict::Abort(Error::Protocol {
                code: *code,
                message: message.clone(),
            });
        }

        match accept(&packet) {
            Some(value) => Verdict::Accept(value),
            None => {
                tracing::debug!("[{}] ignoring unexpected packet: {packet}", self.client);
                Verdict::Ignore
            }
        }
    }

    /// Report a policy failure to the client and pass the error back.
    async fn reject(&self, err: Error) -> Error {
        if let Some(packet) = err.to_packet() {
            if let Err(send) = self.socket.send_to(&packet.encode(), self.client).await {
                tracing::debug!("[{}] failed to send error reply: {send}", self.client);
            } else {
                tracing::warn!("[{}] error sent: {packet}", self.client);
            }
        }
        err
    }
}

fn note_mode(client: SocketAddr, mode: TransferMode) {
    if mode == TransferMode::NetAscii {
        // Accepted but ignored: no newline translation is performed.
        tracing::debug!("[{client}] netascii requested, transferring with octet semantics");
    }
}
