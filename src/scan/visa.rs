//! Resource enumeration through a registered VISA library.
//!
//! Asks the configured library (`scanners.visa.backend`, default `"system"`)
//! for every `?*::INSTR` resource and applies the driver's match predicate
//! to the resource strings. When the configured library name has not been
//! registered, the scan surfaces [`crate::Error::MissingDependency`] so the
//! registry can move on to the remaining transports.

use std::sync::Arc;

use tracing::debug;

use crate::backend::visa::{library, VisaLibrary, DEFAULT_LIBRARY};
use crate::discovery::Candidate;
use crate::error::{Error, Result};
use crate::hwinfo::HardwareInfo;

/// Search expression covering every message-based instrument resource.
const ALL_INSTRUMENTS: &str = "?*::INSTR";

/// Scan VISA resources, matching on the resource string.
pub async fn scan<M>(info: &HardwareInfo, matcher: M) -> Result<Vec<Candidate>>
where
    M: Fn(&str) -> bool + Send + Sync,
{
    let name = info
        .visa_backend()?
        .unwrap_or_else(|| DEFAULT_LIBRARY.to_string());
    let Some(library) = library(&name) else {
        return Err(Error::MissingDependency(format!(
            "VISA library '{name}' is not registered"
        )));
    };
    scan_with(&name, library, matcher).await
}

async fn scan_with<M>(
    name: &str,
    library: Arc<dyn VisaLibrary>,
    matcher: M,
) -> Result<Vec<Candidate>>
where
    M: Fn(&str) -> bool + Send + Sync,
{
    let resources =
        tokio::task::spawn_blocking(move || library.list_resources(ALL_INSTRUMENTS))
            .await
            .map_err(|err| Error::Instrument(format!("VISA enumeration task: {err}")))??;
    debug!(library = name, resources = resources.len(), "visa scan");

    Ok(resources
        .into_iter()
        .filter(|resource| {
            let matched = matcher(resource);
            debug!(resource, matched, "visa resource examined");
            matched
        })
        .map(Candidate::visa)
        .collect())
}
