//! Instrument capability contracts.
//!
//! Instead of one deep driver hierarchy, each instrument kind is a small
//! capability trait a driver implements. A device may satisfy several
//! capabilities at once (a combined scope/generator implements both
//! [`Scope`] and [`Afg`]); the operation set is the contract, not a base
//! class.
//!
//! Concrete instrument semantics (timebase math, pulse shaping, motion
//! profiles) live in the driver crates. The traits here carry only the
//! operations the discovery layer and generic experiment code need; none of
//! them validate instrument-specific parameter ranges; that is the driver's
//! job.
//!
//! Every trait:
//! - is async (`#[async_trait]`) and takes `&self` (interior mutability in
//!   the driver),
//! - requires `Send + Sync`,
//! - returns `crate::Result`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tag identifying an instrument kind a driver can be requested as.
///
/// Many concrete drivers may declare the same capability. The set is closed:
/// supporting a new kind means adding a variant here together with its
/// capability trait and the matching [`Instrument`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Oscilloscope-like acquisition device.
    Scope,
    /// Fault-injection pulse generator.
    Pulser,
    /// Arbitrary function / signal generator.
    Afg,
    /// Positioning table.
    Table,
    /// Programmable power supply.
    PowerSupply,
}

impl Capability {
    /// All known capability tags.
    pub const ALL: &'static [Capability] = &[
        Capability::Scope,
        Capability::Pulser,
        Capability::Afg,
        Capability::Table,
        Capability::PowerSupply,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Scope => "Scope",
            Capability::Pulser => "Pulser",
            Capability::Afg => "Afg",
            Capability::Table => "Table",
            Capability::PowerSupply => "PowerSupply",
        };
        f.write_str(name)
    }
}

/// Capability: waveform acquisition (oscilloscopes and scope-like digitizers).
#[async_trait]
pub trait Scope: Send + Sync {
    /// Names of the acquisition channels (e.g. `["1", "2", "3", "4"]`).
    fn channel_names(&self) -> Vec<String>;

    /// Arm the acquisition and return once the scope is waiting for trigger.
    async fn arm(&self) -> Result<()>;

    /// Block until the armed acquisition has triggered and completed.
    async fn wait(&self) -> Result<()>;

    /// Validate a channel name, for drivers exposing per-channel operations.
    ///
    /// Returns [`crate::Error::NoSuchChannel`] when the name is unknown.
    fn check_channel(&self, name: &str) -> Result<()> {
        if self.channel_names().iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(crate::Error::NoSuchChannel(name.to_string()))
        }
    }
}

/// Capability: fault-injection pulse generation.
#[async_trait]
pub trait Pulser: Send + Sync {
    /// Arm the pulser for the next trigger.
    async fn arm(&self) -> Result<()>;

    /// Set the trigger-to-pulse delay in seconds.
    async fn set_delay(&self, seconds: f64) -> Result<()>;
}

/// Capability: arbitrary function / signal generation.
#[async_trait]
pub trait Afg: Send + Sync {
    /// Set the output frequency in hertz.
    async fn set_frequency(&self, hz: f64) -> Result<()>;

    /// Enable or disable the output.
    async fn set_output_enabled(&self, enabled: bool) -> Result<()>;
}

/// Capability: positioning table motion.
#[async_trait]
pub trait Table: Send + Sync {
    /// Move to an absolute position, in device-native units per axis.
    async fn move_abs(&self, position: &[f64]) -> Result<()>;

    /// Current position, one entry per axis.
    async fn position(&self) -> Result<Vec<f64>>;

    /// Home all axes to their reference position.
    async fn home(&self) -> Result<()>;
}

/// Capability: programmable power supply output.
#[async_trait]
pub trait PowerSupply: Send + Sync {
    /// Set the output voltage in volts. Range checks are the driver's job.
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Enable or disable the output.
    async fn set_output_enabled(&self, enabled: bool) -> Result<()>;
}

/// A built instrument: one capability handle per contract the device
/// satisfies.
///
/// Cloning shares the underlying driver object (the handles are `Arc`s), so
/// a cache entry and the value handed to a caller are the *same* instance;
/// [`Instrument::same_as`] tests that identity.
#[derive(Clone, Default)]
pub struct Instrument {
    driver: &'static str,
    /// Scope handle, if the device acquires waveforms.
    pub scope: Option<Arc<dyn Scope>>,
    /// Pulser handle, if the device injects faults.
    pub pulser: Option<Arc<dyn Pulser>>,
    /// Function-generator handle.
    pub afg: Option<Arc<dyn Afg>>,
    /// Positioning-table handle.
    pub table: Option<Arc<dyn Table>>,
    /// Power-supply handle.
    pub power_supply: Option<Arc<dyn PowerSupply>>,
}

impl Instrument {
    /// Start an empty instrument record for the named driver.
    pub fn new(driver: &'static str) -> Self {
        Self {
            driver,
            ..Self::default()
        }
    }

    /// Name of the driver that built this instance.
    pub fn driver(&self) -> &'static str {
        self.driver
    }

    /// Attach a scope handle.
    pub fn with_scope(mut self, scope: Arc<dyn Scope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Attach a pulser handle.
    pub fn with_pulser(mut self, pulser: Arc<dyn Pulser>) -> Self {
        self.pulser = Some(pulser);
        self
    }

    /// Attach a function-generator handle.
    pub fn with_afg(mut self, afg: Arc<dyn Afg>) -> Self {
        self.afg = Some(afg);
        self
    }

    /// Attach a positioning-table handle.
    pub fn with_table(mut self, table: Arc<dyn Table>) -> Self {
        self.table = Some(table);
        self
    }

    /// Attach a power-supply handle.
    pub fn with_power_supply(mut self, supply: Arc<dyn PowerSupply>) -> Self {
        self.power_supply = Some(supply);
        self
    }

    /// The capabilities this instance actually satisfies.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.scope.is_some() {
            caps.push(Capability::Scope);
        }
        if self.pulser.is_some() {
            caps.push(Capability::Pulser);
        }
        if self.afg.is_some() {
            caps.push(Capability::Afg);
        }
        if self.table.is_some() {
            caps.push(Capability::Table);
        }
        if self.power_supply.is_some() {
            caps.push(Capability::PowerSupply);
        }
        caps
    }

    /// Whether this instance satisfies `capability`.
    pub fn satisfies(&self, capability: Capability) -> bool {
        match capability {
            Capability::Scope => self.scope.is_some(),
            Capability::Pulser => self.pulser.is_some(),
            Capability::Afg => self.afg.is_some(),
            Capability::Table => self.table.is_some(),
            Capability::PowerSupply => self.power_supply.is_some(),
        }
    }

    /// Identity comparison: do both records point at the same driver object?
    ///
    /// Equality of the contained `Arc` pointers, capability by capability.
    /// Two instruments built from the same candidate in separate `build`
    /// calls are *not* the same instance.
    pub fn same_as(&self, other: &Instrument) -> bool {
        fn ptr_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
        }
        ptr_eq(&self.scope, &other.scope)
            && ptr_eq(&self.pulser, &other.pulser)
            && ptr_eq(&self.afg, &other.afg)
            && ptr_eq(&self.table, &other.table)
            && ptr_eq(&self.power_supply, &other.power_supply)
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("driver", &self.driver)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeScope;

    #[async_trait]
    impl Scope for FakeScope {
        fn channel_names(&self) -> Vec<String> {
            vec!["1".into(), "2".into()]
        }

        async fn arm(&self) -> Result<()> {
            Ok(())
        }

        async fn wait(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn capability_set_follows_handles() {
        let inst = Instrument::new("fake").with_scope(Arc::new(FakeScope));
        assert_eq!(inst.capabilities(), vec![Capability::Scope]);
        assert!(inst.satisfies(Capability::Scope));
        assert!(!inst.satisfies(Capability::Table));
    }

    #[test]
    fn clones_share_identity() {
        let inst = Instrument::new("fake").with_scope(Arc::new(FakeScope));
        let clone = inst.clone();
        assert!(inst.same_as(&clone));

        let other = Instrument::new("fake").with_scope(Arc::new(FakeScope));
        assert!(!inst.same_as(&other));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let scope = FakeScope;
        assert!(scope.check_channel("1").is_ok());
        let err = scope.check_channel("9").err();
        assert!(matches!(err, Some(crate::Error::NoSuchChannel(name)) if name == "9"));
    }
}
