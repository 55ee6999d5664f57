//! Prologix GPIB-USB controller
//!
//! The controller sits between the USB-serial link and the GPIB bus. Lines that
//! start with `++` are consumed by the controller itself; everything else is
//! forwarded to the addressed instrument. The controller also interprets four
//! bytes inside forwarded data:
//!
//! | Byte | Meaning to the controller |
//! |------|---------------------------|
//! | CR (0x0D), LF (0x0A) | end of the forwarded command |
//! | ESC (0x1B) | escape prefix |
//! | `+` (0x2B) | start of a controller command |
//!
//! Each of them must be preceded by ESC to reach the instrument verbatim.
//! [`PrologixAdapter`] does this for every payload through
//! [`Transport::escape`]; controller commands are written unescaped.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::Transport;
use crate::config::TransportConfig;
use crate::error::AppResult;

const ESC: u8 = 0x1B;
const RESERVED: [u8; 4] = [b'\r', b'\n', ESC, b'+'];

/// Longest read timeout the controller accepts for `++read_tmo_ms`.
const MAX_CONTROLLER_READ_TIMEOUT_MS: u64 = 3000;

/// Prefix every CR, LF, ESC and `+` in `payload` with ESC.
pub fn escape_reserved(payload: &[u8]) -> Vec<u8> {
    let reserved = payload.iter().filter(|b| RESERVED.contains(b)).count();
    let mut escaped = Vec::with_capacity(payload.len() + reserved);
    for &byte in payload {
        if RESERVED.contains(&byte) {
            escaped.push(ESC);
        }
        escaped.push(byte);
    }
    escaped
}

/// Controller settings applied by [`PrologixAdapter::configure`]
#[derive(Debug, Clone, PartialEq)]
pub struct PrologixSettings {
    /// GPIB primary address of the instrument
    pub gpib_address: u8,
    /// `++auto 1`: address the instrument to talk after every write
    pub read_after_write: bool,
    /// Controller-side GPIB read timeout
    pub read_timeout: Duration,
}

impl PrologixSettings {
    /// Settings from the `[transport]` configuration section
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            gpib_address: config.gpib_address,
            read_after_write: config.read_after_write,
            read_timeout: config.read_timeout(),
        }
    }
}

impl Default for PrologixSettings {
    fn default() -> Self {
        Self {
            gpib_address: 20,
            read_after_write: false,
            read_timeout: Duration::from_millis(1000),
        }
    }
}

/// Transport that talks to a GPIB instrument through a Prologix controller
pub struct PrologixAdapter<T> {
    inner: T,
    settings: PrologixSettings,
}

impl<T: Transport> PrologixAdapter<T> {
    /// Wrap an already-open link to the controller
    pub fn new(inner: T, settings: PrologixSettings) -> Self {
        Self { inner, settings }
    }

    /// Settings in use
    pub fn settings(&self) -> &PrologixSettings {
        &self.settings
    }

    /// Borrow the underlying link
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Unwrap the underlying link
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Write a `++` controller command. Never escaped.
    pub async fn controller_command(&mut self, command: &str) -> AppResult<()> {
        debug!("Prologix controller command: {}", command);
        let mut frame = command.as_bytes().to_vec();
        frame.extend_from_slice(self.inner.terminator());
        self.inner.write_raw(&frame).await
    }

    /// Put the controller in controller mode and address the instrument
    ///
    /// Sends, in order: `++mode 1`, `++addr N`, `++auto 0|1`, `++eos 2`
    /// (LF appended on the bus), `++eoi 1` and `++read_tmo_ms`.
    pub async fn configure(&mut self) -> AppResult<()> {
        let read_tmo_ms = (self.settings.read_timeout.as_millis() as u64)
            .clamp(1, MAX_CONTROLLER_READ_TIMEOUT_MS);
        let commands = [
            "++mode 1".to_string(),
            format!("++addr {}", self.settings.gpib_address),
            format!("++auto {}", u8::from(self.settings.read_after_write)),
            "++eos 2".to_string(),
            "++eoi 1".to_string(),
            format!("++read_tmo_ms {}", read_tmo_ms),
        ];
        for command in &commands {
            self.controller_command(command).await?;
        }
        info!(
            "Prologix controller configured for GPIB address {}",
            self.settings.gpib_address
        );
        Ok(())
    }

    /// Controller firmware version (`++ver`)
    pub async fn controller_version(&mut self, timeout: Duration) -> AppResult<String> {
        self.controller_command("++ver").await?;
        self.inner.receive(timeout).await
    }
}

#[async_trait]
impl<T: Transport> Transport for PrologixAdapter<T> {
    fn name(&self) -> &str {
        "prologix"
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.inner.write_raw(bytes).await
    }

    async fn receive(&mut self, timeout: Duration) -> AppResult<String> {
        if !self.settings.read_after_write {
            self.controller_command("++read eoi").await?;
        }
        self.inner.receive(timeout).await
    }

    fn escape(&self, payload: &[u8]) -> Vec<u8> {
        self.inner.escape(&escape_reserved(payload))
    }

    fn terminator(&self) -> &[u8] {
        self.inner.terminator()
    }
}
