//! Transport adapters
//!
//! Everything the analyzer driver knows about the link is the [`Transport`]
//! capability: write bytes, read one reply, and encode a payload for the link.
//! Encoding is not optional. [`Transport::send`] and [`Transport::send_bytes`]
//! always pass the payload through [`Transport::escape`] before it reaches the
//! wire, so a future binary upload cannot bypass the Prologix escaping.
//!
//! Implementations:
//! - [`SerialTransport`] - raw USB-serial link (`serialport`), identity encoding
//! - [`PrologixAdapter`] - Prologix GPIB-USB controller layered on any transport
//! - [`MockTransport`] - scripted in-memory transport for tests

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;

pub mod mock;
pub mod prologix;
pub mod serial_adapter;

pub use mock::MockTransport;
pub use prologix::{escape_reserved, PrologixAdapter, PrologixSettings};
pub use serial_adapter::SerialTransport;

/// Character-stream link to an instrument.
#[async_trait]
pub trait Transport: Send {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Write bytes to the link exactly as given.
    ///
    /// Callers outside this module go through [`Transport::send`], which
    /// encodes and terminates the payload first.
    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read one delimited reply, trimmed of surrounding whitespace.
    ///
    /// Returns [`MonitorError::Timeout`](crate::error::MonitorError::Timeout)
    /// when no complete reply arrives within `timeout`.
    async fn receive(&mut self, timeout: Duration) -> AppResult<String>;

    /// Encode a payload so that the link forwards it unaltered.
    fn escape(&self, payload: &[u8]) -> Vec<u8>;

    /// Terminator appended after the encoded payload.
    fn terminator(&self) -> &[u8];

    /// Encode, terminate and write a binary payload.
    async fn send_bytes(&mut self, payload: &[u8]) -> AppResult<()> {
        let mut frame = self.escape(payload);
        frame.extend_from_slice(self.terminator());
        self.write_raw(&frame).await
    }

    /// Encode, terminate and write an ASCII command.
    async fn send(&mut self, command: &str) -> AppResult<()> {
        self.send_bytes(command.as_bytes()).await
    }

    /// Send a command and read its reply.
    async fn query(&mut self, command: &str, timeout: Duration) -> AppResult<String> {
        self.send(command).await?;
        self.receive(timeout).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        (**self).write_raw(bytes).await
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<String> {
        (**self).receive(timeout).await
    }

    fn escape(&self, payload: &[u8]) -> Vec<u8> {
        (**self).escape(payload)
    }

    fn terminator(&self) -> &[u8] {
        (**self).terminator()
    }
}
