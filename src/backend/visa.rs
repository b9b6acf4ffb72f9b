//! Generic VISA backend (PyVISA-style resource strings).
//!
//! VISA implementations are vendor libraries loaded at runtime (NI-VISA,
//! Keysight IO Libraries, ...). They are modelled here as [`VisaLibrary`]
//! objects registered under a name; the configuration key
//! `scanners.visa.backend` selects which one the scanner and backend use.
//! When the configured name is not registered, callers get
//! [`crate::Error::MissingDependency`] and discovery moves on with zero
//! candidates from this transport.
//!
//! The `visa` cargo feature registers the system library (via `visa-rs`)
//! under the name `"system"`. Tests register fakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::backend::Backend;
use crate::error::BackendError;

/// Library name used when `scanners.visa.backend` is not configured.
pub const DEFAULT_LIBRARY: &str = "system";

/// A VISA implementation: enumerate resources, open sessions.
///
/// Calls may block (vendor libraries are synchronous); the async wrappers
/// route them through the blocking pool.
pub trait VisaLibrary: Send + Sync {
    /// Enumerate resource strings matching a VISA search expression
    /// (e.g. `?*::INSTR`).
    fn list_resources(&self, expression: &str) -> Result<Vec<String>, BackendError>;

    /// Open a message-based session to one resource.
    fn open(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn VisaSession>, BackendError>;
}

/// One open message-based VISA session.
pub trait VisaSession: Send {
    /// Write one complete command message.
    fn write(&mut self, data: &[u8]) -> Result<(), BackendError>;

    /// Read one complete response message.
    fn read(&mut self) -> Result<String, BackendError>;

    /// Adjust the I/O timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), BackendError>;
}

static LIBRARIES: Lazy<RwLock<HashMap<String, Arc<dyn VisaLibrary>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a VISA library under a name, replacing any previous entry.
pub fn register_library(name: impl Into<String>, library: Arc<dyn VisaLibrary>) {
    if let Ok(mut libraries) = LIBRARIES.write() {
        libraries.insert(name.into(), library);
    }
}

/// Look up a registered VISA library by name.
pub fn library(name: &str) -> Option<Arc<dyn VisaLibrary>> {
    LIBRARIES.read().ok()?.get(name).cloned()
}

/// Command channel over a VISA session.
pub struct VisaBackend {
    resource: String,
    session: Arc<Mutex<Box<dyn VisaSession>>>,
}

impl VisaBackend {
    /// Open a resource through a registered library.
    pub fn open(
        library: &dyn VisaLibrary,
        resource: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let session = library.open(resource, timeout)?;
        Ok(Self {
            resource: resource.to_string(),
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Resource string this session is bound to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    async fn with_session<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn VisaSession) -> Result<T, BackendError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| BackendError::Disconnected("VISA session poisoned".into()))?;
            op(session.as_mut())
        })
        .await
        .map_err(|err| BackendError::Disconnected(format!("VISA task: {err}")))?
    }
}

#[async_trait]
impl Backend for VisaBackend {
    async fn write(&self, command: &str) -> Result<(), BackendError> {
        trace!(resource = %self.resource, command, "visa write");
        let payload = format!("{command}\n").into_bytes();
        self.with_session(move |session| session.write(&payload)).await
    }

    async fn query(&self, command: &str) -> Result<String, BackendError> {
        trace!(resource = %self.resource, command, "visa query");
        let payload = format!("{command}\n").into_bytes();
        self.with_session(move |session| {
            session.write(&payload)?;
            Ok(session.read()?.trim().to_string())
        })
        .await
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), BackendError> {
        self.with_session(move |session| session.set_timeout(timeout)).await
    }
}

#[cfg(feature = "visa")]
mod system {
    //! System VISA library through the `visa-rs` bindings.

    use super::*;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};

    use visa_rs::prelude::*;

    fn to_backend(err: visa_rs::Error) -> BackendError {
        BackendError::Protocol(err.to_string())
    }

    /// The host's default VISA resource manager.
    pub struct SystemVisa {
        rm: DefaultRM,
    }

    impl SystemVisa {
        /// Open the default resource manager.
        pub fn new() -> Result<Self, BackendError> {
            Ok(Self {
                rm: DefaultRM::new().map_err(to_backend)?,
            })
        }
    }

    struct SystemSession {
        instrument: Instrument,
    }

    impl VisaLibrary for SystemVisa {
        fn list_resources(&self, expression: &str) -> Result<Vec<String>, BackendError> {
            let expr = CString::new(expression)
                .map_err(|_| BackendError::Malformed("NUL in search expression".into()))?
                .into();
            let mut resources = Vec::new();
            for res in self.rm.find_res_list(&expr).map_err(to_backend)? {
                resources.push(res.map_err(to_backend)?.to_string());
            }
            Ok(resources)
        }

        fn open(
            &self,
            resource: &str,
            timeout: Duration,
        ) -> Result<Box<dyn VisaSession>, BackendError> {
            let expr = CString::new(resource)
                .map_err(|_| BackendError::Malformed("NUL in resource string".into()))?
                .into();
            let res = self.rm.find_res(&expr).map_err(to_backend)?;
            let instrument = self
                .rm
                .open(&res, AccessMode::NO_LOCK, timeout)
                .map_err(to_backend)?;
            Ok(Box::new(SystemSession { instrument }))
        }
    }

    impl VisaSession for SystemSession {
        fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
            (&self.instrument).write_all(data).map_err(BackendError::Io)
        }

        fn read(&mut self) -> Result<String, BackendError> {
            let mut line = String::new();
            BufReader::new(&self.instrument)
                .read_line(&mut line)
                .map_err(BackendError::Io)?;
            Ok(line)
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), BackendError> {
            self.instrument
                .set_timeout(timeout)
                .map_err(to_backend)
        }
    }

    /// Register the system library under [`DEFAULT_LIBRARY`].
    pub fn register_system_library() -> Result<(), BackendError> {
        register_library(DEFAULT_LIBRARY, Arc::new(SystemVisa::new()?));
        Ok(())
    }
}

#[cfg(feature = "visa")]
pub use system::{register_system_library, SystemVisa};
