//! Network-scan semantics with an injected prober (no sockets).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use benchkit::scan::vxi11::scan_hosts_with;

#[tokio::test]
async fn scan_finds_the_single_responsive_host() {
    let hosts: Vec<Ipv4Addr> = (1..=4).map(|i| Ipv4Addr::new(192, 168, 1, i)).collect();
    let probed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&probed);
    let found = scan_hosts_with(
        hosts,
        Duration::from_millis(10),
        64,
        false,
        move |host, timeout| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(timeout).await;
                (host.octets()[3] == 2).then(|| format!("TCPIP0::{host}::INSTR"))
            }
        },
    )
    .await;

    assert_eq!(found, vec!["TCPIP0::192.168.1.2::INSTR".to_string()]);
    assert_eq!(probed.load(Ordering::SeqCst), 4, "every host is probed");
}

#[tokio::test]
async fn wall_time_is_one_timeout_not_one_per_host() {
    let hosts: Vec<Ipv4Addr> = (1..=32).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
    let timeout = Duration::from_millis(50);

    let started = Instant::now();
    let found = scan_hosts_with(hosts, timeout, 64, false, |_, timeout| async move {
        tokio::time::sleep(timeout).await;
        None
    })
    .await;
    let elapsed = started.elapsed();

    assert!(found.is_empty());
    // 32 sequential probes would take 1.6 s.
    assert!(
        elapsed < Duration::from_millis(500),
        "scan took {elapsed:?}, probes are not concurrent"
    );
}

#[tokio::test]
async fn probe_concurrency_is_bounded() {
    let hosts: Vec<Ipv4Addr> = (1..=8).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
    let timeout = Duration::from_millis(40);

    // With a worker bound of 2, eight 40 ms probes need at least four waves.
    let started = Instant::now();
    scan_hosts_with(hosts, timeout, 2, false, |_, timeout| async move {
        tokio::time::sleep(timeout).await;
        None
    })
    .await;
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(150),
        "scan took {elapsed:?}, the probe bound was not honored"
    );
}
