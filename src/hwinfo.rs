//! Read-only view of the bench environment handed to every discovery call.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigStore;
use crate::error::Result;

/// Default per-host probe timeout for the network scan (10 ms).
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(10);

/// Default bound on concurrent network probes.
pub const DEFAULT_MAX_PROBES: usize = 64;

/// Resolved configuration plus host identity, created once per discovery
/// pass and passed by reference to every `discover`/`build` call.
///
/// Cheap to clone; never persisted.
#[derive(Clone)]
pub struct HardwareInfo {
    config: Arc<ConfigStore>,
    hostname: String,
}

impl HardwareInfo {
    /// Build a view over an explicit configuration store.
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let hostname = config.hostname().to_string();
        Self { config, hostname }
    }

    /// Build a view over the process-wide configuration.
    pub fn detect() -> Result<Self> {
        Ok(Self::new(ConfigStore::global()?))
    }

    /// The underlying configuration store.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Host identity used for hostname-scoped configuration.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Per-host probe timeout for the VXI-11 network scan
    /// (`scanners.vxi11.scan_timeout`, seconds).
    pub fn scan_timeout(&self) -> Result<Duration> {
        let secs = self
            .config
            .get_f64_or("scanners.vxi11.scan_timeout", DEFAULT_SCAN_TIMEOUT.as_secs_f64())?;
        Ok(Duration::from_secs_f64(secs))
    }

    /// Whether the network scan reports every probed host
    /// (`scanners.vxi11.scan_verbose`).
    pub fn scan_verbose(&self) -> Result<bool> {
        self.config.get_bool_or("scanners.vxi11.scan_verbose", false)
    }

    /// Bound on concurrent network probes (`scanners.vxi11.max_probes`).
    pub fn max_probes(&self) -> Result<usize> {
        let n = self
            .config
            .get_u64_or("scanners.vxi11.max_probes", DEFAULT_MAX_PROBES as u64)?;
        Ok((n as usize).max(1))
    }

    /// CIDR range scanned for network instruments (`scopenet`), if configured.
    pub fn scopenet(&self) -> Result<Option<String>> {
        self.config.get_str("scopenet")
    }

    /// Name of the VISA library used for generic resource enumeration
    /// (`scanners.visa.backend`), if configured.
    pub fn visa_backend(&self) -> Result<Option<String>> {
        self.config.get_str("scanners.visa.backend")
    }

    /// Baud rate used when probing serial ports (`scanners.serial.baud_rate`).
    pub fn serial_baud_rate(&self) -> Result<u32> {
        Ok(self.config.get_u64_or("scanners.serial.baud_rate", 115_200)? as u32)
    }

    /// Per-port identification timeout for the serial scan
    /// (`scanners.serial.timeout`, seconds).
    pub fn serial_timeout(&self) -> Result<Duration> {
        let secs = self.config.get_f64_or("scanners.serial.timeout", 0.5)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::unwrap_used)]
    fn info(sources: &[&str]) -> HardwareInfo {
        HardwareInfo::new(Arc::new(ConfigStore::from_strs(sources).unwrap()))
    }

    #[test]
    fn scan_timeout_defaults_to_ten_ms() {
        let info = info(&[]);
        assert_eq!(info.scan_timeout().ok(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn scan_timeout_reads_config() {
        let info = info(&["[scanners.vxi11]\nscan_timeout = 0.5"]);
        assert_eq!(info.scan_timeout().ok(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn max_probes_is_at_least_one() {
        let info = info(&["[scanners.vxi11]\nmax_probes = 0"]);
        assert_eq!(info.max_probes().ok(), Some(1));
    }

    #[test]
    fn scopenet_absent_by_default() {
        let info = info(&[]);
        assert_eq!(info.scopenet().ok().flatten(), None);
    }
}
