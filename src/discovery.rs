//! The discoverable-driver contract.
//!
//! A driver participates in bench discovery by implementing
//! [`InstrumentDriver`]: enumerate transport addresses that look like its
//! hardware ([`InstrumentDriver::discover`]), and construct a live instance
//! from one of them ([`InstrumentDriver::build`]). The registry treats
//! drivers purely through this contract; what capability traits the built
//! instrument satisfies is declared through
//! [`InstrumentDriver::capabilities`] and carried by the returned
//! [`Instrument`](crate::instrument::Instrument) record.
//!
//! Discovery output is a set: candidate order depends on OS enumeration
//! order and network timing, and implementers must not rely on it beyond
//! "every reachable candidate eventually appears".

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hwinfo::HardwareInfo;
use crate::instrument::{Capability, Instrument};

/// Physical transport a candidate address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// Serial device path (e.g. `/dev/ttyUSB0`).
    Serial,
    /// USB-TMC character device (e.g. `/dev/usbtmc0`).
    UsbTmc,
    /// VXI-11 network instrument (VISA-style `TCPIP0::<ip>::INSTR`).
    Vxi11,
    /// Resource enumerated through a generic VISA library.
    Visa,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Serial => "serial",
            Transport::UsbTmc => "usbtmc",
            Transport::Vxi11 => "vxi11",
            Transport::Visa => "visa",
        };
        f.write_str(name)
    }
}

/// A transport-specific address produced by discovery, not yet bound to a
/// driver instance.
///
/// The address is opaque to the registry; only the driver that produced it
/// knows how to open it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Transport the address belongs to.
    pub transport: Transport,
    /// Transport-specific address string.
    pub address: String,
}

impl Candidate {
    /// Candidate on the serial transport.
    pub fn serial(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Serial,
            address: address.into(),
        }
    }

    /// Candidate on the USB-TMC transport.
    pub fn usbtmc(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::UsbTmc,
            address: address.into(),
        }
    }

    /// Candidate on the VXI-11 network transport.
    pub fn vxi11(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Vxi11,
            address: address.into(),
        }
    }

    /// Candidate enumerated through a VISA library.
    pub fn visa(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Visa,
            address: address.into(),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

/// How many candidates a discovery request builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryPolicy {
    /// Build the first candidate encountered and stop (the default).
    #[default]
    FirstMatch,
    /// Build every candidate from every driver and return the collection.
    AllMatches,
}

/// A driver type that can be found and constructed by the bench registry.
///
/// Implementations delegate `discover` to the transport scanners in
/// [`crate::scan`] with a driver-specific match predicate, keeping the
/// scanners themselves capability-agnostic.
#[async_trait]
pub trait InstrumentDriver: Send + Sync {
    /// Stable driver name, used in logs and status listings.
    fn name(&self) -> &'static str;

    /// Capabilities instances of this driver satisfy.
    fn capabilities(&self) -> &'static [Capability];

    /// Enumerate candidate addresses reachable right now.
    ///
    /// The result is finite and may be empty; rescanning is just calling
    /// again. A transport whose library is unavailable should surface
    /// [`crate::Error::MissingDependency`]; the registry downgrades it to
    /// "zero candidates from this driver".
    async fn discover(&self, info: &HardwareInfo) -> Result<Vec<Candidate>>;

    /// Construct a live instance from one candidate.
    ///
    /// Deterministic for a given candidate and configuration. Fails with
    /// [`crate::Error::Backend`] when the candidate is no longer reachable
    /// (a race between discovery and build) or
    /// [`crate::Error::InvalidParameter`] when the address is malformed.
    async fn build(&self, info: &HardwareInfo, candidate: &Candidate) -> Result<Instrument>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_display_includes_transport() {
        let candidate = Candidate::vxi11("TCPIP0::192.168.1.2::INSTR");
        assert_eq!(candidate.to_string(), "vxi11://TCPIP0::192.168.1.2::INSTR");
    }

    #[test]
    fn default_policy_is_first_match() {
        assert_eq!(DiscoveryPolicy::default(), DiscoveryPolicy::FirstMatch);
    }
}
