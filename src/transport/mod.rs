//! Request/response exchange with the slave board.
//!
//! The physical link is abstracted behind [`SlaveLink`]: hand it a frame, get back a
//! frame or nothing within a timeout. [`Transport`] wraps a link with the resend
//! policy and is the only place in the crate where a request is ever sent twice.
//!
//! Decoding happens above this layer, so a protocol mismatch is never retried.

pub mod datalink;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AppResult, MasterError};

pub use mock::MockLink;
#[cfg(feature = "serial")]
pub use serial::SerialLink;

/// A byte-exchange channel to the slave board.
///
/// `Ok(None)` (or an empty reply) means nothing arrived within `timeout`; `Err` is
/// reserved for the link itself failing.
#[async_trait]
pub trait SlaveLink: Send + Sync {
    /// Sends `frame` and returns the reply, if one arrived within `timeout`.
    async fn exchange(&self, frame: &[u8], timeout: Duration) -> AppResult<Option<Vec<u8>>>;
}

#[async_trait]
impl<L: SlaveLink + ?Sized> SlaveLink for std::sync::Arc<L> {
    async fn exchange(&self, frame: &[u8], timeout: Duration) -> AppResult<Option<Vec<u8>>> {
        (**self).exchange(frame, timeout).await
    }
}

/// How many times a request is re-sent after the first unanswered attempt.
#[derive(Clone, Debug)]
pub struct ResendPolicy {
    /// Additional attempts after the first one.
    pub resends: u32,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self { resends: 3 }
    }
}

impl ResendPolicy {
    /// Total number of attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.resends + 1
    }
}

/// Default time allowed for the slave to answer a single request.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// A [`SlaveLink`] plus the resend policy.
///
/// Exchanges are serialised, so tasks sharing one transport never interleave frames.
pub struct Transport<L> {
    link: Mutex<L>,
    policy: ResendPolicy,
    command_timeout: Duration,
}

impl<L: SlaveLink> Transport<L> {
    /// Transport with the default resend policy.
    pub fn new(link: L) -> Self {
        Self::with_policy(link, ResendPolicy::default())
    }

    /// Transport with an explicit resend policy.
    pub fn with_policy(link: L, policy: ResendPolicy) -> Self {
        Self {
            link: Mutex::new(link),
            policy,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Overrides the per-attempt timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Resend policy in force.
    pub fn policy(&self) -> &ResendPolicy {
        &self.policy
    }

    /// Per-attempt timeout used by module drivers.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Exchanges `frame` for a response, resending while nothing comes back.
    ///
    /// Returns `Ok(None)` only after every attempt went unanswered.
    pub async fn exchange(&self, frame: &[u8], timeout: Duration) -> AppResult<Option<Vec<u8>>> {
        let link = self.link.lock().await;
        let attempts = self.policy.attempts();

        for attempt in 1..=attempts {
            match link.exchange(frame, timeout).await? {
                Some(reply) if !reply.is_empty() => return Ok(Some(reply)),
                _ if attempt < attempts => {
                    debug!(attempt, frame = ?frame, "no response, resending");
                }
                _ => {}
            }
        }

        warn!(attempts, frame = ?frame, "slave did not respond");
        Ok(None)
    }

    /// Exchanges `frame` and treats an exhausted exchange as [`MasterError::NoResponse`].
    ///
    /// This is what module drivers call.
    pub async fn request(&self, frame: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        match self.exchange(frame, timeout).await? {
            Some(reply) => Ok(reply),
            None => Err(MasterError::NoResponse {
                module: frame.first().copied().unwrap_or_default(),
                sub: frame.get(1).copied().unwrap_or_default(),
            }),
        }
    }

    /// Consumes the transport and returns the link.
    pub fn into_inner(self) -> L {
        self.link.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn succeeds_on_fourth_attempt() {
        let link = MockLink::new();
        link.push_silence(3);
        link.push_response(vec![0x01, 0x02, 0x00]);
        let transport = Transport::new(link.clone());

        let reply = transport.exchange(&[0x01, 0x02], TOUT).await.unwrap();
        assert_eq!(reply, Some(vec![0x01, 0x02, 0x00]));
        assert_eq!(link.call_count(), 4);
    }

    #[tokio::test]
    async fn gives_up_after_four_attempts() {
        let link = MockLink::new();
        let transport = Transport::new(link.clone());

        let reply = transport.exchange(&[0x22, 0x00], TOUT).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(link.call_count(), 4);
    }

    #[tokio::test]
    async fn empty_reply_counts_as_silence() {
        let link = MockLink::new();
        link.push_response(Vec::new());
        link.push_response(vec![0x22, 0x00, 0x00]);
        let transport = Transport::new(link.clone());

        let reply = transport.exchange(&[0x22, 0x00], TOUT).await.unwrap();
        assert!(reply.is_some());
        assert_eq!(link.call_count(), 2);
    }

    #[tokio::test]
    async fn request_maps_exhaustion_to_no_response() {
        let link = MockLink::new();
        let transport = Transport::with_policy(link.clone(), ResendPolicy { resends: 0 });

        let err = transport.request(&[0x24, 0x02], TOUT).await.unwrap_err();
        assert!(matches!(
            err,
            MasterError::NoResponse {
                module: 0x24,
                sub: 0x02
            }
        ));
        assert_eq!(link.call_count(), 1);
    }

    #[tokio::test]
    async fn link_errors_are_not_retried() {
        let link = MockLink::new();
        link.inject_next_failure();
        let transport = Transport::new(link.clone());

        assert!(transport.exchange(&[0x25, 0x00], TOUT).await.is_err());
        assert_eq!(link.call_count(), 1);
    }
}
