//! Scripted slave link for tests and dry runs.
//!
//! `MockLink` answers requests from, in order of precedence:
//! 1. a FIFO of canned replies (`Some(frame)` or silence)
//! 2. a responder closure that plays the slave board
//! 3. silence
//!
//! Every request frame is recorded so tests can assert exactly what was sent and
//! how often.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::SlaveLink;
use crate::error::AppResult;
use crate::protocol::ACK;

/// Zero bytes appended to dry-run replies, enough for the longest status frame.
const DRY_RUN_PADDING: usize = 48;

type Responder = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock slave link.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// transport owns another.
///
/// # Example
///
/// ```
/// use roti_master::transport::MockLink;
///
/// let link = MockLink::new();
/// link.push_response(vec![0x2F, 0x02, 0x00]);
/// assert_eq!(link.call_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockLink {
    script: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    responder: Arc<Mutex<Option<Arc<Responder>>>>,
    call_log: Arc<Mutex<Vec<Vec<u8>>>>,
    should_fail_next: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
}

impl MockLink {
    /// Link with an empty script; unscripted requests go unanswered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a link that answers every request through `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let link = Self::new();
        link.set_responder(responder);
        link
    }

    /// Answers requests the script does not cover through `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Arc::new(responder));
    }

    /// Creates a link that stands in for a healthy, idle board.
    ///
    /// Every request is ACKed and its arguments echoed back, followed by zero
    /// padding, so status queries decode as IDLE with no flags set.
    pub fn dry_run() -> Self {
        Self::with_responder(|frame| {
            let mut reply = Vec::with_capacity(frame.len() + 1 + DRY_RUN_PADDING);
            reply.extend_from_slice(&frame[..frame.len().min(2)]);
            reply.push(ACK);
            reply.extend_from_slice(frame.get(2..).unwrap_or_default());
            reply.resize(reply.len() + DRY_RUN_PADDING, 0);
            Some(reply)
        })
    }

    /// Simulated per-exchange latency.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    /// Queues a canned reply ahead of the responder.
    pub fn push_response(&self, frame: Vec<u8>) {
        lock(&self.script).push_back(Some(frame));
    }

    /// Queues `count` unanswered exchanges.
    pub fn push_silence(&self, count: usize) {
        let mut script = lock(&self.script);
        for _ in 0..count {
            script.push_back(None);
        }
    }

    /// The next exchange fails with an I/O error.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every request sent so far, in order.
    pub fn call_log(&self) -> Vec<Vec<u8>> {
        lock(&self.call_log).clone()
    }

    /// Number of requests sent so far.
    pub fn call_count(&self) -> usize {
        lock(&self.call_log).len()
    }

    /// Number of requests sent to `module`.
    pub fn calls_to(&self, module: u8) -> usize {
        lock(&self.call_log)
            .iter()
            .filter(|frame| frame.first() == Some(&module))
            .count()
    }

    /// Number of requests carrying the `(module, sub)` code pair.
    pub fn calls_with(&self, module: u8, sub: u8) -> usize {
        lock(&self.call_log)
            .iter()
            .filter(|frame| frame.len() >= 2 && frame[0] == module && frame[1] == sub)
            .count()
    }

    /// Forgets the requests sent so far.
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn next_reply(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        let responder = lock(&self.responder).clone();
        responder.and_then(|respond| respond(frame))
    }
}

#[async_trait]
impl SlaveLink for MockLink {
    async fn exchange(&self, frame: &[u8], _timeout: Duration) -> AppResult<Option<Vec<u8>>> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        lock(&self.call_log).push(frame.to_vec());

        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected failure").into());
        }

        Ok(self.next_reply(frame))
    }
}
