//! Mock transport for testing
//!
//! This transport provides a scripted instrument link for testing the driver
//! and the tracker without hardware. It provides:
//! - Exact-match replies (`on("*IDN?", "...")`)
//! - A fallback responder closure for anything else
//! - One-shot failure injection
//! - A log of every frame written, for test verification
//!
//! Clones share state, so a test can keep a handle while the driver owns
//! another.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Transport;
use crate::error::{AppResult, MonitorError};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    replies: HashMap<String, VecDeque<String>>,
    responder: Option<Responder>,
    pending: VecDeque<String>,
    sent: Vec<String>,
    fail_next: bool,
}

/// Scripted in-memory transport
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock that answers nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply `reply` every time `command` is written
    pub fn on(self, command: &str, reply: &str) -> Self {
        self.push_reply(command, reply);
        self
    }

    /// Queue one reply for `command`; the last queued reply repeats
    pub fn push_reply(&self, command: &str, reply: &str) {
        self.lock()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Answer commands without a scripted reply through `responder`
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
        self
    }

    /// Make the next write fail with a transport error
    pub fn inject_next_failure(&self) {
        self.lock().fail_next = true;
    }

    /// Frames written so far, without terminators
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Clear the frame log
    pub fn clear_log(&self) {
        self.lock().sent.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from the others.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(MonitorError::Transport("Injected failure".to_string()));
        }

        let frame = String::from_utf8_lossy(bytes);
        let frame = frame.strip_suffix('\n').unwrap_or(&frame).to_string();
        state.sent.push(frame.clone());

        let scripted = state.replies.get_mut(&frame).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        let reply = match scripted {
            Some(reply) => Some(reply),
            None => state.responder.as_mut().and_then(|respond| respond(&frame)),
        };
        if let Some(reply) = reply {
            state.pending.push_back(reply);
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<String> {
        self.lock()
            .pending
            .pop_front()
            .ok_or_else(|| MonitorError::timeout("Mock read", timeout))
    }

    fn escape(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn terminator(&self) -> &[u8] {
        b"\n"
    }
}
