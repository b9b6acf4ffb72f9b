//! Command-channel abstraction over the physical transports.
//!
//! A [`Backend`] is one live session to one instrument: it can write a
//! command, run a write-then-read query, adjust the blocking-read timeout,
//! and drain the instrument's queued error reports. Every operation is a
//! single blocking exchange from the caller's point of view; nothing here
//! retries; retry policy, if any, belongs to the driver above.
//!
//! One implementation exists per transport:
//!
//! - [`serial::SerialBackend`]: RS-232/USB-serial via `serialport`
//!   (feature `serial`)
//! - [`usbtmc::UsbTmcBackend`]: Linux `/dev/usbtmcN` character devices
//! - [`vxi11::Vxi11Backend`]: VXI-11 core channel over ONC RPC/TCP
//! - [`visa::VisaBackend`]: a session opened through a system VISA library
//!
//! A session is exclusively owned by the instrument instance that created it
//! and is closed when that instance is dropped.

pub mod serial;
pub mod usbtmc;
pub mod visa;
pub mod vxi11;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;

/// Upper bound on the number of queue entries [`drain_errors`] will read.
/// Guards against instruments that keep reporting the same error forever.
const MAX_DRAIN: usize = 64;

/// A command channel to one physical device.
///
/// The default `has_error`/`pop_next_error` implementations speak IEEE 488.2
/// / SCPI: `*STB?` bit 2 (EAV) flags a non-empty error queue and `SYST:ERR?`
/// pops one entry. Transports talking to non-SCPI firmware override them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send one command. Fails on transport failure (disconnect, timeout).
    async fn write(&self, command: &str) -> Result<(), BackendError>;

    /// Send one command and block for a single response line.
    ///
    /// A timeout is reported as [`BackendError::Timeout`], distinct from a
    /// disconnect.
    async fn query(&self, command: &str) -> Result<String, BackendError>;

    /// Set the blocking-read timeout for subsequent operations on this
    /// session only.
    async fn set_timeout(&self, timeout: Duration) -> Result<(), BackendError>;

    /// Whether the instrument has queued error reports.
    ///
    /// Non-consuming: checks the status byte's error-available bit.
    async fn has_error(&self) -> Result<bool, BackendError> {
        let raw = self.query("*STB?").await?;
        let stb = parse_status_byte(&raw)?;
        Ok(stb & STB_ERROR_QUEUE != 0)
    }

    /// Pop the oldest queued error report, or `None` when the queue is empty.
    ///
    /// Callers are expected to drain until empty before trusting subsequent
    /// readings; failing to drain is not fatal but degrades diagnosis.
    async fn pop_next_error(&self) -> Result<Option<String>, BackendError> {
        let raw = self.query("SYST:ERR?").await?;
        Ok(parse_error_entry(&raw))
    }
}

/// Status byte bit 2: error/event queue available (IEEE 488.2 EAV).
pub const STB_ERROR_QUEUE: u8 = 1 << 2;

/// Drain the instrument error queue, returning every entry found.
pub async fn drain_errors(backend: &dyn Backend) -> Result<Vec<String>, BackendError> {
    let mut drained = Vec::new();
    for _ in 0..MAX_DRAIN {
        match backend.pop_next_error().await? {
            Some(entry) => drained.push(entry),
            None => break,
        }
    }
    Ok(drained)
}

/// Drain the error queue and fail if it was non-empty.
pub async fn ensure_no_pending_errors(backend: &dyn Backend) -> crate::Result<()> {
    let drained = drain_errors(backend).await?;
    if drained.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::InstrumentPendingErrors(drained))
    }
}

/// Parse one `SYST:ERR?` response. Code `0` means the queue is empty.
///
/// Typical entries: `0,"No error"`, `-113,"Undefined header"`.
pub(crate) fn parse_error_entry(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let code = trimmed
        .split(',')
        .next()
        .and_then(|c| c.trim().parse::<i32>().ok());
    match code {
        Some(0) => None,
        // Unparseable entries are preserved verbatim so diagnosis can see
        // what the instrument actually said.
        _ if trimmed.is_empty() => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Parse a `*STB?` response into the raw status byte.
pub(crate) fn parse_status_byte(raw: &str) -> Result<u8, BackendError> {
    raw.trim()
        .parse::<u16>()
        .map(|v| (v & 0xff) as u8)
        .map_err(|_| BackendError::Malformed(format!("status byte: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend: answers queries from a queue.
    struct Scripted {
        replies: Mutex<VecDeque<&'static str>>,
    }

    impl Scripted {
        fn new(replies: &[&'static str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        async fn write(&self, _command: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn query(&self, _command: &str) -> Result<String, BackendError> {
            #[allow(clippy::unwrap_used)]
            let mut replies = self.replies.lock().unwrap();
            replies
                .pop_front()
                .map(str::to_string)
                .ok_or_else(|| BackendError::Disconnected("script exhausted".into()))
        }

        async fn set_timeout(&self, _timeout: Duration) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn error_entry_zero_means_empty() {
        assert_eq!(parse_error_entry("0,\"No error\""), None);
        assert_eq!(parse_error_entry("  0, \"No error\" \r\n"), None);
    }

    #[test]
    fn error_entry_nonzero_is_reported() {
        assert_eq!(
            parse_error_entry("-113,\"Undefined header\""),
            Some("-113,\"Undefined header\"".to_string())
        );
    }

    #[test]
    fn status_byte_parses_decimal() {
        assert_eq!(parse_status_byte("4\n").ok(), Some(4));
        assert!(parse_status_byte("garbage").is_err());
    }

    #[tokio::test]
    async fn drain_collects_until_empty() {
        let backend = Scripted::new(&[
            "-113,\"Undefined header\"",
            "-410,\"Query INTERRUPTED\"",
            "0,\"No error\"",
        ]);
        let drained = drain_errors(&backend).await.expect("drain");
        assert_eq!(drained.len(), 2);
    }

    #[tokio::test]
    async fn ensure_no_pending_errors_flags_nonempty_queue() {
        let backend = Scripted::new(&["-222,\"Data out of range\"", "0,\"No error\""]);
        let err = ensure_no_pending_errors(&backend).await.err();
        assert!(matches!(
            err,
            Some(crate::Error::InstrumentPendingErrors(entries)) if entries.len() == 1
        ));
    }

    #[tokio::test]
    async fn has_error_checks_stb_bit() {
        let backend = Scripted::new(&["4"]);
        assert_eq!(backend.has_error().await.ok(), Some(true));
        let backend = Scripted::new(&["0"]);
        assert_eq!(backend.has_error().await.ok(), Some(false));
    }
}
