//! The bench registry: capability requests over registered drivers.
//!
//! A [`Bench`] owns the set of registered [`InstrumentDriver`]s and a cache
//! of built instruments keyed by [`Capability`]. Callers ask for a
//! capability (`bench.get_scope()`); the bench answers from cache when it
//! can, and otherwise fans discovery out over every driver declaring that
//! capability, builds the first reachable candidate and caches it.
//!
//! Concurrency contract: concurrent requests for the *same* capability
//! serialize on a per-capability lock so hardware is probed once, not once
//! per caller; requests for different capabilities proceed independently.
//! Within one discovery pass the drivers are scanned concurrently and the
//! first responder wins. One physical device reachable over two transports
//! may therefore surface as either; the registry does not reconcile
//! duplicate identities.
//!
//! Failures of a single scanner or driver during discovery are logged and
//! treated as zero candidates from that driver; only a globally empty
//! outcome for a required request becomes [`Error::NoSuchHardware`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::discovery::{Candidate, DiscoveryPolicy, InstrumentDriver};
use crate::error::{Error, Result};
use crate::hwinfo::HardwareInfo;
use crate::instrument::{Afg, Capability, Instrument, PowerSupply, Pulser, Scope, Table};

/// Per-request knobs for [`Bench::get_with`].
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// Answer from (and insert into) the bench cache. Defaults to `true`;
    /// with `false` the request always runs a fresh discovery pass and the
    /// result is not retained.
    pub cache: bool,
    /// Treat zero candidates as [`Error::NoSuchHardware`]. Defaults to
    /// `true`; with `false` an empty outcome is `Ok(None)`.
    pub required: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            cache: true,
            required: true,
        }
    }
}

/// One line of [`Bench::status`]: a cached instrument under one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchStatusEntry {
    /// Capability the instrument is cached under.
    pub capability: Capability,
    /// Name of the driver that built (or registered) it.
    pub driver: &'static str,
}

static GLOBAL: OnceCell<Arc<Bench>> = OnceCell::new();

/// Registry of instrument drivers with a per-capability instrument cache.
pub struct Bench {
    info: HardwareInfo,
    drivers: RwLock<Vec<Arc<dyn InstrumentDriver>>>,
    cache: Mutex<HashMap<Capability, Vec<Instrument>>>,
    /// One async lock per capability so concurrent requests share a single
    /// discovery pass instead of racing the hardware.
    discovery_locks: Mutex<HashMap<Capability, Arc<tokio::sync::Mutex<()>>>>,
}

impl Bench {
    /// Bench over the process-wide configuration.
    pub fn new() -> Result<Self> {
        Ok(Self::with_config(ConfigStore::global()?))
    }

    /// Bench over an explicit configuration store (tests, embedded use).
    pub fn with_config(config: Arc<ConfigStore>) -> Self {
        Self {
            info: HardwareInfo::new(config),
            drivers: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
            discovery_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide bench, created on first use.
    ///
    /// The usual entry point for experiment scripts; code that needs
    /// isolation builds its own with [`Bench::with_config`].
    pub fn global() -> Result<Arc<Bench>> {
        GLOBAL
            .get_or_try_init(|| Bench::new().map(Arc::new))
            .cloned()
    }

    /// The environment view handed to drivers during discovery.
    pub fn hardware_info(&self) -> &HardwareInfo {
        &self.info
    }

    /// Register a driver type for future discovery passes.
    ///
    /// Does not invalidate the cache; already-built instruments stay.
    pub fn register_driver(&self, driver: Arc<dyn InstrumentDriver>) {
        if let Ok(mut drivers) = self.drivers.write() {
            debug!(driver = driver.name(), "driver registered");
            drivers.push(driver);
        }
    }

    /// Insert an already-built instrument, bypassing discovery.
    ///
    /// The instance is cached under every capability it satisfies and takes
    /// priority over anything already cached for those capabilities,
    /// including previously discovered instruments, until
    /// [`Bench::clear_cache`].
    pub fn register(&self, instrument: Instrument) {
        if let Ok(mut cache) = self.cache.lock() {
            for capability in instrument.capabilities() {
                info!(driver = instrument.driver(), %capability, "instrument registered");
                cache
                    .entry(capability)
                    .or_default()
                    .insert(0, instrument.clone());
            }
        }
    }

    /// Drop every cached instrument, including registered ones.
    ///
    /// The next request for any capability runs discovery again. Existing
    /// handles held by callers stay alive; only the bench forgets them.
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            debug!(entries = cache.len(), "bench cache cleared");
            cache.clear();
        }
    }

    /// Cached instruments, one entry per (capability, instance) pair.
    pub fn status(&self) -> Vec<BenchStatusEntry> {
        let Ok(cache) = self.cache.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<BenchStatusEntry> = cache
            .iter()
            .flat_map(|(capability, instruments)| {
                instruments.iter().map(|instrument| BenchStatusEntry {
                    capability: *capability,
                    driver: instrument.driver(),
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.capability.to_string(), e.driver));
        entries
    }

    /// Get one instrument for a capability with default options (cached,
    /// required).
    pub async fn get(&self, capability: Capability) -> Result<Instrument> {
        match self.get_with(capability, GetOptions::default()).await? {
            Some(instrument) => Ok(instrument),
            None => Err(Error::NoSuchHardware(capability)),
        }
    }

    /// Get one instrument for a capability, `Ok(None)` when none is
    /// reachable.
    pub async fn try_get(&self, capability: Capability) -> Result<Option<Instrument>> {
        self.get_with(
            capability,
            GetOptions {
                required: false,
                ..GetOptions::default()
            },
        )
        .await
    }

    /// Get one instrument for a capability with explicit options.
    pub async fn get_with(
        &self,
        capability: Capability,
        opts: GetOptions,
    ) -> Result<Option<Instrument>> {
        if opts.cache {
            if let Some(cached) = self.cached_first(capability) {
                debug!(%capability, driver = cached.driver(), "cache hit");
                return Ok(Some(cached));
            }
        }

        let lock = self.discovery_lock(capability);
        let _guard = lock.lock().await;

        // A concurrent request may have filled the cache while this one
        // waited on the lock.
        if opts.cache {
            if let Some(cached) = self.cached_first(capability) {
                return Ok(Some(cached));
            }
        }

        let found = self
            .discover(capability, DiscoveryPolicy::FirstMatch)
            .await;
        match found.into_iter().next() {
            Some(instrument) => {
                if opts.cache {
                    self.cache_insert(capability, vec![instrument.clone()]);
                }
                Ok(Some(instrument))
            }
            None if opts.required => Err(Error::NoSuchHardware(capability)),
            None => Ok(None),
        }
    }

    /// Get every reachable instrument for a capability.
    ///
    /// Runs a full discovery pass over every declaring driver and builds
    /// every candidate. The result (possibly empty) replaces the cache entry
    /// for the capability.
    pub async fn get_all(&self, capability: Capability) -> Result<Vec<Instrument>> {
        let lock = self.discovery_lock(capability);
        let _guard = lock.lock().await;

        let found = self.discover(capability, DiscoveryPolicy::AllMatches).await;
        self.cache_insert(capability, found.clone());
        Ok(found)
    }

    /// Get the bench scope.
    pub async fn get_scope(&self) -> Result<Arc<dyn Scope>> {
        self.get(Capability::Scope)
            .await?
            .scope
            .ok_or(Error::NoSuchHardware(Capability::Scope))
    }

    /// Get the bench scope if one is reachable.
    pub async fn try_scope(&self) -> Result<Option<Arc<dyn Scope>>> {
        Ok(self.try_get(Capability::Scope).await?.and_then(|i| i.scope))
    }

    /// Get the bench pulser.
    pub async fn get_pulser(&self) -> Result<Arc<dyn Pulser>> {
        self.get(Capability::Pulser)
            .await?
            .pulser
            .ok_or(Error::NoSuchHardware(Capability::Pulser))
    }

    /// Get the bench pulser if one is reachable.
    pub async fn try_pulser(&self) -> Result<Option<Arc<dyn Pulser>>> {
        Ok(self
            .try_get(Capability::Pulser)
            .await?
            .and_then(|i| i.pulser))
    }

    /// Get the bench function generator.
    pub async fn get_afg(&self) -> Result<Arc<dyn Afg>> {
        self.get(Capability::Afg)
            .await?
            .afg
            .ok_or(Error::NoSuchHardware(Capability::Afg))
    }

    /// Get the bench function generator if one is reachable.
    pub async fn try_afg(&self) -> Result<Option<Arc<dyn Afg>>> {
        Ok(self.try_get(Capability::Afg).await?.and_then(|i| i.afg))
    }

    /// Get the bench positioning table.
    pub async fn get_table(&self) -> Result<Arc<dyn Table>> {
        self.get(Capability::Table)
            .await?
            .table
            .ok_or(Error::NoSuchHardware(Capability::Table))
    }

    /// Get the bench positioning table if one is reachable.
    pub async fn try_table(&self) -> Result<Option<Arc<dyn Table>>> {
        Ok(self.try_get(Capability::Table).await?.and_then(|i| i.table))
    }

    /// Get the bench power supply.
    pub async fn get_power_supply(&self) -> Result<Arc<dyn PowerSupply>> {
        self.get(Capability::PowerSupply)
            .await?
            .power_supply
            .ok_or(Error::NoSuchHardware(Capability::PowerSupply))
    }

    /// Get the bench power supply if one is reachable.
    pub async fn try_power_supply(&self) -> Result<Option<Arc<dyn PowerSupply>>> {
        Ok(self
            .try_get(Capability::PowerSupply)
            .await?
            .and_then(|i| i.power_supply))
    }

    fn cached_first(&self, capability: Capability) -> Option<Instrument> {
        self.cache
            .lock()
            .ok()?
            .get(&capability)
            .and_then(|v| v.first())
            .cloned()
    }

    fn cache_insert(&self, capability: Capability, instruments: Vec<Instrument>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(capability, instruments);
        }
    }

    fn discovery_lock(&self, capability: Capability) -> Arc<tokio::sync::Mutex<()>> {
        match self.discovery_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(capability).or_default()),
            // A poisoned map only loses the dedup optimization.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn drivers_for(&self, capability: Capability) -> Vec<Arc<dyn InstrumentDriver>> {
        self.drivers
            .read()
            .map(|drivers| {
                drivers
                    .iter()
                    .filter(|d| d.capabilities().contains(&capability))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One discovery pass: scan every declaring driver concurrently, build
    /// candidates per the policy.
    ///
    /// Never fails: scanner and build errors are logged and the driver
    /// contributes nothing. Candidate order between drivers is whoever
    /// responds first.
    async fn discover(
        &self,
        capability: Capability,
        policy: DiscoveryPolicy,
    ) -> Vec<Instrument> {
        let drivers = self.drivers_for(capability);
        debug!(%capability, drivers = drivers.len(), ?policy, "discovery pass");

        let mut scans: FuturesUnordered<_> = drivers
            .iter()
            .map(|driver| {
                let driver = Arc::clone(driver);
                let info = &self.info;
                async move {
                    let candidates = match driver.discover(info).await {
                        Ok(candidates) => candidates,
                        Err(err) => {
                            warn!(driver = driver.name(), %err, "discovery failed, driver skipped");
                            Vec::new()
                        }
                    };
                    (driver, candidates)
                }
            })
            .collect();

        let mut built = Vec::new();
        while let Some((driver, candidates)) = scans.next().await {
            for candidate in candidates {
                match self.build_one(&driver, &candidate).await {
                    Some(instrument) => {
                        built.push(instrument);
                        if policy == DiscoveryPolicy::FirstMatch {
                            return built;
                        }
                    }
                    None => continue,
                }
            }
        }
        built
    }

    async fn build_one(
        &self,
        driver: &Arc<dyn InstrumentDriver>,
        candidate: &Candidate,
    ) -> Option<Instrument> {
        match driver.build(&self.info, candidate).await {
            Ok(instrument) => {
                info!(driver = driver.name(), %candidate, "instrument built");
                Some(instrument)
            }
            Err(err) => {
                warn!(driver = driver.name(), %candidate, %err, "build failed, candidate skipped");
                None
            }
        }
    }
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let drivers = self
            .drivers
            .read()
            .map(|d| d.iter().map(|d| d.name()).collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("Bench")
            .field("drivers", &drivers)
            .field("cached", &self.status())
            .finish()
    }
}
