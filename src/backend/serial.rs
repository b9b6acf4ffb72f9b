//! Serial-port backend (feature `serial`).
//!
//! Wraps a blocking `serialport` handle; all I/O runs on the blocking thread
//! pool so the async runtime is never stalled by a slow instrument. Reads
//! poll in short slices until the response terminator shows up or the
//! session timeout elapses.

#![cfg(feature = "serial")]

use std::io::Read;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::trace;

use crate::backend::Backend;
use crate::error::BackendError;

/// How long one blocking `read` call may sit before the deadline is
/// re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared session state: the port handle plus the current read timeout.
struct Session {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

/// Command channel over one serial device.
pub struct SerialBackend {
    path: String,
    session: Arc<Mutex<Session>>,
    tx_terminator: String,
    rx_terminator: char,
}

impl SerialBackend {
    /// Open a serial device with a line-oriented SCPI framing (`\n` both ways).
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, BackendError> {
        let port = serialport::new(path, baud_rate)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|err| BackendError::Disconnected(format!("{path}: {err}")))?;
        Ok(Self {
            path: path.to_string(),
            session: Arc::new(Mutex::new(Session { port, timeout })),
            tx_terminator: "\n".to_string(),
            rx_terminator: '\n',
        })
    }

    /// Override the command/response terminators for non-SCPI framing.
    pub fn with_terminators(mut self, tx: impl Into<String>, rx: char) -> Self {
        self.tx_terminator = tx.into();
        self.rx_terminator = rx;
        self
    }

    /// Device path this session is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn blocking_write(session: &mut Session, payload: &[u8]) -> Result<(), BackendError> {
        session
            .port
            .write_all(payload)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => {
                    BackendError::Disconnected(err.to_string())
                }
                _ => BackendError::Io(err),
            })
    }

    fn blocking_read_line(session: &mut Session, terminator: char) -> Result<String, BackendError> {
        let timeout = session.timeout;
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        let mut response = String::new();
        loop {
            match session.port.read(&mut buf) {
                Ok(n) if n > 0 => {
                    response.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if response.contains(terminator) {
                        return Ok(response.trim().to_string());
                    }
                }
                // Zero-byte read: the device closed the line.
                Ok(_) => return Err(BackendError::Disconnected("EOF on serial port".into())),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(BackendError::Io(err)),
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Timeout(timeout));
            }
        }
    }
}

#[async_trait]
impl Backend for SerialBackend {
    async fn write(&self, command: &str) -> Result<(), BackendError> {
        let payload = format!("{}{}", command, self.tx_terminator).into_bytes();
        let session = Arc::clone(&self.session);
        let path = self.path.clone();
        trace!(port = %path, command, "serial write");
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| BackendError::Disconnected("serial session poisoned".into()))?;
            Self::blocking_write(&mut session, &payload)
        })
        .await
        .map_err(|err| BackendError::Disconnected(format!("serial task: {err}")))?
    }

    async fn query(&self, command: &str) -> Result<String, BackendError> {
        let payload = format!("{}{}", command, self.tx_terminator).into_bytes();
        let session = Arc::clone(&self.session);
        let terminator = self.rx_terminator;
        let path = self.path.clone();
        trace!(port = %path, command, "serial query");
        let response = tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| BackendError::Disconnected("serial session poisoned".into()))?;
            Self::blocking_write(&mut session, &payload)?;
            Self::blocking_read_line(&mut session, terminator)
        })
        .await
        .map_err(|err| BackendError::Disconnected(format!("serial task: {err}")))??;
        trace!(port = %path, response, "serial response");
        Ok(response)
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), BackendError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| BackendError::Disconnected("serial session poisoned".into()))?;
        session.timeout = timeout;
        Ok(())
    }
}
