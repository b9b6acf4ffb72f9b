//! USB-TMC backend over Linux `/dev/usbtmcN` character devices.
//!
//! The kernel `usbtmc` driver frames TMC messages, so one `write` sends a
//! complete command and one `read` returns one complete response. I/O runs
//! on the blocking pool; the session timeout is enforced around the blocking
//! read. A read that times out leaves its blocking task behind until the
//! device answers or the handle is dropped; the kernel driver offers no
//! per-read cancellation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::backend::Backend;
use crate::error::BackendError;

/// Largest single response accepted from the device.
const READ_BUFFER: usize = 16 * 1024;

struct Session {
    file: File,
    timeout: Duration,
}

/// Command channel over one `/dev/usbtmcN` device.
pub struct UsbTmcBackend {
    path: String,
    session: Arc<Mutex<Session>>,
}

impl UsbTmcBackend {
    /// Open a USB-TMC character device with the given read timeout.
    pub fn open(path: &str, timeout: Duration) -> Result<Self, BackendError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    BackendError::Disconnected(format!("{path}: {err}"))
                }
                _ => BackendError::Io(err),
            })?;
        Ok(Self {
            path: path.to_string(),
            session: Arc::new(Mutex::new(Session { file, timeout })),
        })
    }

    /// Device path this session is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(session: &Arc<Mutex<Session>>) -> Result<std::sync::MutexGuard<'_, Session>, BackendError> {
        session
            .lock()
            .map_err(|_| BackendError::Disconnected("usbtmc session poisoned".into()))
    }

    async fn write_inner(&self, command: &str) -> Result<(), BackendError> {
        let payload = format!("{command}\n").into_bytes();
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut session = Self::lock(&session)?;
            session.file.write_all(&payload).map_err(BackendError::Io)
        })
        .await
        .map_err(|err| BackendError::Disconnected(format!("usbtmc task: {err}")))?
    }
}

#[async_trait]
impl Backend for UsbTmcBackend {
    async fn write(&self, command: &str) -> Result<(), BackendError> {
        trace!(device = %self.path, command, "usbtmc write");
        self.write_inner(command).await
    }

    async fn query(&self, command: &str) -> Result<String, BackendError> {
        trace!(device = %self.path, command, "usbtmc query");
        self.write_inner(command).await?;

        let session = Arc::clone(&self.session);
        let timeout = Self::lock(&self.session)?.timeout;
        let read = tokio::task::spawn_blocking(move || {
            let mut session = Self::lock(&session)?;
            let mut buf = vec![0u8; READ_BUFFER];
            let n = session.file.read(&mut buf).map_err(BackendError::Io)?;
            Ok::<String, BackendError>(String::from_utf8_lossy(&buf[..n]).trim().to_string())
        });
        match tokio::time::timeout(timeout, read).await {
            Ok(joined) => {
                let response = joined
                    .map_err(|err| BackendError::Disconnected(format!("usbtmc task: {err}")))??;
                trace!(device = %self.path, response, "usbtmc response");
                Ok(response)
            }
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), BackendError> {
        Self::lock(&self.session)?.timeout = timeout;
        Ok(())
    }
}
