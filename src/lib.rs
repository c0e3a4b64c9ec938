//! TFTP (Trivial File Transfer Protocol) client and server.
//!
//! An RFC 1350 implementation over UDP: lock-step block transfer with
//! 512-byte blocks, bounded retry on timeout, transfer-ID enforcement, and
//! base-directory containment on the server. Binary (octet) transfers only;
//! netascii is accepted on the wire but no newline translation is performed.
//!
//! # Server
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use tftp::{ServerConfig, TftpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = TftpServer::new(ServerConfig {
//!         bind_address: "0.0.0.0:69".to_string(),
//!         base_dir: PathBuf::from("./tftp-server-files"),
//!         ..Default::default()
//!     });
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Client
//!
//! ```rust,no_run
//! use std::path::Path;
//! use tftp::{CancelFlag, TftpClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = TftpClient::new("203.0.113.9:69".parse()?);
//!     let cancel = CancelFlag::new();
//!     let bytes = client
//!         .download("boot.img", Path::new("boot.img"), &cancel, None)
//!         .await?;
//!     println!("downloaded {bytes} bytes");
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod guard;
mod protocol;
mod retry;
mod server;
mod worker;

pub use client::{CancelFlag, ClientConfig, ProgressFn, TftpClient};
pub use error::Error;
pub use guard::resolve;
pub use protocol::{ErrorCode, Opcode, Packet, TransferMode, BLOCK_SIZE, MAX_PACKET_SIZE};
pub use retry::RetryPolicy;
pub use server::{run_server, ServerConfig, StopHandle, TftpServer};
