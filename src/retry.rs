//! Bounded retry-with-timeout primitive shared by both sides of a transfer.
//!
//! One attempt is a single timeout window spent waiting for a qualifying
//! response. Disqualifying packets (wrong TID, wrong block number, wrong
//! opcode) never consume an attempt: they are classified, optionally
//! answered, and the same window keeps waiting. Only an elapsed window
//! consumes budget, and exhausting the budget aborts the whole transfer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::error::Error;
use crate::protocol::MAX_PACKET_SIZE;

/// Per-attempt timeout and attempt budget for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Client-side default: 3 seconds per attempt, 5 attempts.
    pub const CLIENT: Self = Self {
        timeout: Duration::from_secs(3),
        max_attempts: 5,
    };

    /// Server-side default: 5 seconds per attempt, 5 attempts.
    pub const SERVER: Self = Self {
        timeout: Duration::from_secs(5),
        max_attempts: 5,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::CLIENT
    }
}

/// Classification of one received datagram.
pub(crate) enum Verdict<T> {
    /// Qualifying response; the wait is over.
    Accept(T),
    /// Disqualifying packet; keep waiting within the same attempt.
    Ignore,
    /// Disqualifying sender; answer it with `reply` and keep waiting.
    Reject { reply: Vec<u8>, dest: SocketAddr },
    /// Terminal condition (e.g. a peer error report); abort the transfer.
    Abort(Error),
}

/// Wait for a qualifying response under `policy`.
///
/// When `resend` is given, its payload is (re)transmitted to its destination
/// at the start of every attempt. When it is `None` the caller has already
/// sent whatever prompted the response and a timed-out attempt simply waits
/// again.
pub(crate) async fn exchange<T>(
    socket: &UdpSocket,
    policy: &RetryPolicy,
    resend: Option<(&[u8], SocketAddr)>,
    mut classify: impl FnMut(&[u8], SocketAddr) -> Verdict<T>,
) -> Result<T, Error> {
    let mut buf = [0u8; MAX_PACKET_SIZE];

    for attempt in 1..=policy.max_attempts {
        if let Some((payload, dest)) = resend {
            socket.send_to(payload, dest).await?;
        }

        let deadline = Instant::now() + policy.timeout;
        loop {
            let received = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(
                        "attempt {attempt}/{} timed out after {:?}",
                        policy.max_attempts,
                        policy.timeout
                    );
                    break;
                }
            };

            let (len, src) = received;
            match classify(&buf[..len], src) {
                Verdict::Accept(value) => return Ok(value),
                Verdict::Ignore => continue,
                Verdict::Reject { reply, dest } => {
                    socket.send_to(&reply, dest).await?;
                    continue;
                }
                Verdict::Abort(err) => return Err(err),
            }
        }
    }

    Err(Error::Timeout {
        attempts: policy.max_attempts,
    })
}
