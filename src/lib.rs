//! Hardware discovery and instrument access for security-testing benches.
//!
//! `benchkit` answers one question for experiment code: *give me the scope
//! (or pulser, table, ...) on this bench*, without the experiment hard-coding
//! which instrument model sits on which port. The pieces:
//!
//! - [`config`]: layered TOML configuration (`BENCHKIT_USER_CONFIG`) with
//!   hostname-scoped entries and environment overrides.
//! - [`scan`]: per-transport enumeration: serial ports, Linux USB-TMC
//!   device nodes, a concurrent VXI-11 network sweep over the configured
//!   `scopenet` CIDR range, and generic VISA resource listing.
//! - [`backend`]: the command-channel abstraction a driver talks through
//!   (write, query, timeout, SCPI error-queue draining), one implementation
//!   per transport.
//! - [`instrument`]: the capability contracts (Scope, Pulser, Afg, Table,
//!   PowerSupply) and the multi-capability [`Instrument`] record.
//! - [`discovery`]: the [`InstrumentDriver`] contract tying a driver's match
//!   predicates to the scanners.
//! - [`bench`]: the registry that fans discovery out over registered
//!   drivers, caches built instruments per capability and hands out shared
//!   handles.
//!
//! A minimal session:
//!
//! ```no_run
//! use benchkit::Bench;
//!
//! # async fn demo() -> benchkit::Result<()> {
//! let bench = Bench::global()?;
//! // Drivers are registered by the driver crates in use on this bench.
//! let scope = bench.get_scope().await?;
//! scope.arm().await?;
//! scope.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bench;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hwinfo;
pub mod instrument;
pub mod scan;

pub use backend::Backend;
pub use bench::{Bench, BenchStatusEntry, GetOptions};
pub use config::ConfigStore;
pub use discovery::{Candidate, DiscoveryPolicy, InstrumentDriver, Transport};
pub use error::{BackendError, ConfigError, Error, Result};
pub use hwinfo::HardwareInfo;
pub use instrument::{Afg, Capability, Instrument, PowerSupply, Pulser, Scope, Table};
