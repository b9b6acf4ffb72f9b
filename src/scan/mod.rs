//! Per-transport enumeration primitives.
//!
//! Each scanner enumerates one physical transport and yields
//! [`Candidate`](crate::discovery::Candidate) addresses that pass a
//! caller-supplied match predicate. The predicate is how a driver tells the
//! generic scanner what its hardware looks like (an `*IDN?` substring for
//! serial, vendor/product identity for USB-TMC, a resource-string pattern
//! for the network and VISA scans), so the scanners themselves stay
//! capability-agnostic.
//!
//! Scans are finite and restartable (call again to rescan). Failures
//! enumerating or probing a single device are logged and skipped; an
//! entirely unavailable transport surfaces
//! [`crate::Error::MissingDependency`], which discovery treats as zero
//! candidates without aborting the other transports.

pub mod serial;
pub mod usbtmc;
pub mod visa;
pub mod vxi11;
