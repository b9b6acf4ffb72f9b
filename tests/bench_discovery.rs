//! End-to-end discovery behavior of the bench registry with mock drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use benchkit::{
    Bench, Capability, Candidate, ConfigStore, Error, GetOptions, HardwareInfo, Instrument,
    InstrumentDriver, Result, Scope,
};

struct NullScope;

#[async_trait]
impl Scope for NullScope {
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

/// Scriptable scope driver: fixed candidate list, counters on every call.
struct MockScopeDriver {
    name: &'static str,
    candidates: Vec<Candidate>,
    discoveries: AtomicUsize,
    builds: AtomicUsize,
    fail_discover: bool,
    /// Addresses whose build should fail (simulates a device that vanished
    /// between scan and open).
    unreachable: Vec<String>,
}

impl MockScopeDriver {
    fn new(name: &'static str, addresses: &[&str]) -> Self {
        Self {
            name,
            candidates: addresses.iter().map(|a| Candidate::serial(*a)).collect(),
            discoveries: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            fail_discover: false,
            unreachable: Vec::new(),
        }
    }

    fn failing(name: &'static str) -> Self {
        Self {
            fail_discover: true,
            ..Self::new(name, &[])
        }
    }

    fn with_unreachable(mut self, address: &str) -> Self {
        self.unreachable.push(address.to_string());
        self
    }
}

#[async_trait]
impl InstrumentDriver for MockScopeDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Scope]
    }

    async fn discover(&self, _info: &HardwareInfo) -> Result<Vec<Candidate>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        if self.fail_discover {
            return Err(Error::MissingDependency(format!(
                "{} transport unavailable",
                self.name
            )));
        }
        Ok(self.candidates.clone())
    }

    async fn build(&self, _info: &HardwareInfo, candidate: &Candidate) -> Result<Instrument> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(&candidate.address) {
            return Err(Error::Instrument(format!(
                "{} no longer answers",
                candidate.address
            )));
        }
        Ok(Instrument::new(self.name).with_scope(Arc::new(NullScope)))
    }
}

fn bench() -> Bench {
    #[allow(clippy::expect_used)]
    Bench::with_config(Arc::new(
        ConfigStore::from_strs(&[]).expect("empty config"),
    ))
}

#[tokio::test]
async fn single_driver_discovery_succeeds() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let scope = bench.get_scope().await.expect("scope");
    assert_eq!(scope.channel_names(), vec!["1", "2"]);
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn required_request_without_hardware_errors() {
    let bench = bench();
    bench.register_driver(Arc::new(MockScopeDriver::new("empty", &[])));

    let err = bench.get(Capability::Scope).await.expect_err("no scope");
    assert!(matches!(err, Error::NoSuchHardware(Capability::Scope)));
}

#[tokio::test]
async fn optional_request_without_hardware_is_none() {
    let bench = bench();
    bench.register_driver(Arc::new(MockScopeDriver::new("empty", &[])));

    let got = bench.try_get(Capability::Scope).await.expect("ok");
    assert!(got.is_none());
    assert!(bench.try_scope().await.expect("ok").is_none());
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let first = bench.get(Capability::Scope).await.expect("scope");
    let second = bench.get(Capability::Scope).await.expect("scope");
    assert!(first.same_as(&second), "cache must hand out the same instance");
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 1);
    assert_eq!(driver.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn uncached_request_builds_a_fresh_instance() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let cached = bench.get(Capability::Scope).await.expect("scope");
    let fresh = bench
        .get_with(
            Capability::Scope,
            GetOptions {
                cache: false,
                ..GetOptions::default()
            },
        )
        .await
        .expect("scope")
        .expect("present");

    assert!(!cached.same_as(&fresh));
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 2);

    // The fresh instance was not retained; the cache still answers with the
    // original.
    let again = bench.get(Capability::Scope).await.expect("scope");
    assert!(again.same_as(&cached));
}

#[tokio::test]
async fn registered_instrument_bypasses_discovery() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let manual = Instrument::new("manual").with_scope(Arc::new(NullScope));
    bench.register(manual.clone());

    let got = bench.get(Capability::Scope).await.expect("scope");
    assert!(got.same_as(&manual));
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn late_registration_overrides_a_discovered_instrument() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("one-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    // Discovery runs first and caches its result.
    let discovered = bench.get(Capability::Scope).await.expect("scope");
    assert_eq!(discovered.driver(), "one-scope");

    // A manual instrument registered afterwards must win until the cache is
    // cleared.
    let manual = Instrument::new("manual").with_scope(Arc::new(NullScope));
    bench.register(manual.clone());

    let got = bench.get(Capability::Scope).await.expect("scope");
    assert!(got.same_as(&manual), "expected the registered instrument");
    assert_eq!(got.driver(), "manual");
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_cache_forces_rediscovery() {
    let bench = bench();
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let first = bench.get(Capability::Scope).await.expect("scope");
    bench.clear_cache();
    let second = bench.get(Capability::Scope).await.expect("scope");

    assert!(!first.same_as(&second));
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_driver_does_not_poison_the_pass() {
    let bench = bench();
    let broken = Arc::new(MockScopeDriver::failing("broken"));
    let working = Arc::new(MockScopeDriver::new("working", &["/dev/ttyUSB1"]));
    bench.register_driver(broken.clone());
    bench.register_driver(working);

    let scope = bench.get(Capability::Scope).await.expect("scope");
    assert_eq!(scope.driver(), "working");
    assert_eq!(broken.discoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_candidate_falls_through_to_the_next() {
    let bench = bench();
    let driver = Arc::new(
        MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0", "/dev/ttyUSB1"])
            .with_unreachable("/dev/ttyUSB0"),
    );
    bench.register_driver(driver.clone());

    let scope = bench.get(Capability::Scope).await.expect("scope");
    assert!(scope.satisfies(Capability::Scope));
    assert_eq!(driver.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn get_all_builds_every_candidate() {
    let bench = bench();
    bench.register_driver(Arc::new(MockScopeDriver::new(
        "multi",
        &["/dev/ttyUSB0", "/dev/ttyUSB1"],
    )));
    bench.register_driver(Arc::new(MockScopeDriver::new("single", &["/dev/ttyACM0"])));

    let all = bench.get_all(Capability::Scope).await.expect("scopes");
    assert_eq!(all.len(), 3);

    // Cache now holds the whole set; a plain get answers from it.
    let one = bench.get(Capability::Scope).await.expect("scope");
    assert!(all.iter().any(|i| i.same_as(&one)));
}

#[tokio::test]
async fn concurrent_requests_share_one_discovery_pass() {
    let bench = Arc::new(bench());
    let driver = Arc::new(MockScopeDriver::new("mock-scope", &["/dev/ttyUSB0"]));
    bench.register_driver(driver.clone());

    let a = {
        let bench = Arc::clone(&bench);
        tokio::spawn(async move { bench.get(Capability::Scope).await })
    };
    let b = {
        let bench = Arc::clone(&bench);
        tokio::spawn(async move { bench.get(Capability::Scope).await })
    };
    let (a, b) = (
        a.await.expect("join").expect("scope"),
        b.await.expect("join").expect("scope"),
    );

    assert!(a.same_as(&b));
    assert_eq!(driver.discoveries.load(Ordering::SeqCst), 1);
}
