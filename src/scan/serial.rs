//! Serial-port scan.
//!
//! Enumerates the currently attached serial devices, queries each for its
//! `*IDN?` identification string and applies the driver's match predicate to
//! it. Ports that cannot be opened or do not answer are logged and skipped;
//! an unrelated console device hanging off `/dev/ttyS0` must not abort the
//! scan.

#[cfg(feature = "serial")]
use tracing::debug;

use crate::discovery::Candidate;
use crate::error::Result;
use crate::hwinfo::HardwareInfo;

/// Scan attached serial ports, matching on the `*IDN?` response.
#[cfg(feature = "serial")]
pub async fn scan<M>(info: &HardwareInfo, matcher: M) -> Result<Vec<Candidate>>
where
    M: Fn(&str) -> bool + Send + Sync,
{
    use crate::backend::serial::SerialBackend;
    use crate::backend::Backend;
    use crate::error::Error;

    let ports = serialport::available_ports()
        .map_err(|err| Error::MissingDependency(format!("serial enumeration: {err}")))?;
    let baud_rate = info.serial_baud_rate()?;
    let timeout = info.serial_timeout()?;
    debug!(ports = ports.len(), baud_rate, "serial scan");

    let mut candidates = Vec::new();
    for port in ports {
        let path = port.port_name;
        if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
            debug!(
                port = %path,
                vid = format_args!("{:04x}", usb.vid),
                pid = format_args!("{:04x}", usb.pid),
                serial = usb.serial_number.as_deref().unwrap_or(""),
                "usb serial port"
            );
        }
        let backend = match SerialBackend::open(&path, baud_rate, timeout) {
            Ok(backend) => backend,
            Err(err) => {
                debug!(port = %path, %err, "serial port not usable, skipped");
                continue;
            }
        };
        match backend.query("*IDN?").await {
            Ok(idn) if matcher(&idn) => {
                debug!(port = %path, idn, "serial candidate matched");
                candidates.push(Candidate::serial(path));
            }
            Ok(idn) => {
                debug!(port = %path, idn, "serial device did not match");
            }
            Err(err) => {
                debug!(port = %path, %err, "serial identification failed, skipped");
            }
        }
    }
    Ok(candidates)
}

/// Serial support was compiled out; the transport is a missing dependency.
#[cfg(not(feature = "serial"))]
pub async fn scan<M>(_info: &HardwareInfo, _matcher: M) -> Result<Vec<Candidate>>
where
    M: Fn(&str) -> bool + Send + Sync,
{
    Err(crate::error::Error::MissingDependency(
        "serial support not enabled; rebuild with --features serial".into(),
    ))
}
