//! Network scan for VXI-11 instruments.
//!
//! Iterates every host in the configured `scopenet` CIDR range and probes
//! each for a registered VXI-11 core channel. Scan time is dominated by
//! unreachable hosts timing out, so probes run concurrently with a bounded
//! worker count (`scanners.vxi11.max_probes`); the scan completes when all
//! probes resolve or fail and returns the union of matches. With
//! `scanners.vxi11.scan_verbose`, every examined host is reported regardless
//! of match.

use std::future::Future;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use futures::{stream, StreamExt};
use tracing::{debug, info};

use crate::backend::vxi11::probe;
use crate::discovery::Candidate;
use crate::error::{ConfigError, Result};
use crate::hwinfo::HardwareInfo;

/// An IPv4 CIDR range (`a.b.c.d/prefix`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    /// The range's prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Host addresses in the range.
    ///
    /// For prefixes shorter than /31 the network and broadcast addresses are
    /// excluded, following the usual subnet conventions; /31 yields both
    /// addresses and /32 the single one.
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let base = u32::from(self.addr) & self.mask();
        match self.prefix {
            32 => vec![self.addr],
            31 => vec![Ipv4Addr::from(base), Ipv4Addr::from(base + 1)],
            _ => {
                let count = 1u32 << (32 - self.prefix);
                (1..count - 1).map(|i| Ipv4Addr::from(base + i)).collect()
            }
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }
}

impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{s}' is not in a.b.c.d/prefix form"))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| format!("bad IPv4 address in '{s}'"))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| format!("bad prefix length in '{s}'"))?;
        if prefix > 32 {
            return Err(format!("prefix /{prefix} out of range"));
        }
        // Refuse ranges too large to probe sensibly.
        if prefix < 16 {
            return Err(format!("range /{prefix} is wider than /16"));
        }
        Ok(Ipv4Net { addr, prefix })
    }
}

/// Scan the configured `scopenet` range for VXI-11 instruments.
///
/// `matcher` filters the discovered resource strings
/// (`TCPIP0::<ip>::INSTR`). An unconfigured `scopenet` yields zero
/// candidates; a malformed one is a configuration error.
pub async fn scan<M>(info: &HardwareInfo, matcher: M) -> Result<Vec<Candidate>>
where
    M: Fn(&str) -> bool + Send + Sync,
{
    let Some(range) = info.scopenet()? else {
        debug!("scopenet not configured, skipping VXI-11 scan");
        return Ok(Vec::new());
    };
    let net: Ipv4Net = range.parse().map_err(|message| ConfigError::InvalidValue {
        key: "scopenet".into(),
        message,
    })?;
    let timeout = info.scan_timeout()?;
    let max_probes = info.max_probes()?;
    let verbose = info.scan_verbose()?;

    let hosts = net.hosts();
    debug!(range = %range, hosts = hosts.len(), ?timeout, max_probes, "VXI-11 scan");
    let resources = scan_hosts_with(hosts, timeout, max_probes, verbose, probe).await;

    Ok(resources
        .into_iter()
        .filter(|resource| matcher(resource))
        .map(Candidate::vxi11)
        .collect())
}

/// Probe a host list with a bounded worker count.
///
/// Generic over the prober so the concurrency behavior is testable without
/// touching the network; production passes [`crate::backend::vxi11::probe`].
pub async fn scan_hosts_with<P, Fut>(
    hosts: Vec<Ipv4Addr>,
    timeout: Duration,
    max_probes: usize,
    verbose: bool,
    probe: P,
) -> Vec<String>
where
    P: Fn(Ipv4Addr, Duration) -> Fut,
    Fut: Future<Output = Option<String>>,
{
    stream::iter(hosts)
        .map(|host| {
            let fut = probe(host, timeout);
            async move {
                let resource = fut.await;
                if verbose {
                    info!(%host, found = resource.is_some(), "VXI-11 probe");
                }
                resource
            }
        })
        .buffer_unordered(max_probes.max(1))
        .filter_map(|resource| async move { resource })
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_30_yields_two_hosts() {
        let net: Ipv4Net = "192.168.1.0/30".parse().expect("net");
        let hosts = net.hosts();
        assert_eq!(
            hosts,
            vec![
                "192.168.1.1".parse::<Ipv4Addr>().expect("ip"),
                "192.168.1.2".parse::<Ipv4Addr>().expect("ip"),
            ]
        );
    }

    #[test]
    fn slash_32_yields_single_host() {
        let net: Ipv4Net = "10.0.0.7/32".parse().expect("net");
        assert_eq!(net.hosts(), vec!["10.0.0.7".parse::<Ipv4Addr>().expect("ip")]);
    }

    #[test]
    fn slash_31_yields_both_addresses() {
        let net: Ipv4Net = "10.0.0.6/31".parse().expect("net");
        assert_eq!(net.hosts().len(), 2);
    }

    #[test]
    fn slash_24_yields_254_hosts() {
        let net: Ipv4Net = "192.168.1.0/24".parse().expect("net");
        assert_eq!(net.hosts().len(), 254);
    }

    #[test]
    fn non_aligned_base_is_masked() {
        let net: Ipv4Net = "192.168.1.9/30".parse().expect("net");
        assert_eq!(
            net.hosts(),
            vec![
                "192.168.1.9".parse::<Ipv4Addr>().expect("ip"),
                "192.168.1.10".parse::<Ipv4Addr>().expect("ip"),
            ]
        );
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!("192.168.1.0".parse::<Ipv4Net>().is_err());
        assert!("192.168.1.0/40".parse::<Ipv4Net>().is_err());
        assert!("192.168.1.0/8".parse::<Ipv4Net>().is_err());
        assert!("not-an-ip/24".parse::<Ipv4Net>().is_err());
    }

    #[tokio::test]
    async fn probes_run_concurrently() {
        use std::time::Instant;

        let timeout = Duration::from_millis(50);
        let hosts: Vec<Ipv4Addr> = (1..=16)
            .map(|i| Ipv4Addr::new(10, 0, 0, i))
            .collect();

        // Every probe takes the full timeout; only .2 responds.
        let started = Instant::now();
        let found = scan_hosts_with(hosts, timeout, 64, false, |host, timeout| async move {
            tokio::time::sleep(timeout).await;
            (host.octets()[3] == 2).then(|| format!("TCPIP0::{host}::INSTR"))
        })
        .await;
        let elapsed = started.elapsed();

        assert_eq!(found, vec!["TCPIP0::10.0.0.2::INSTR".to_string()]);
        // 16 sequential probes would take 800 ms; concurrent ones roughly one
        // timeout period.
        assert!(
            elapsed < Duration::from_millis(400),
            "scan took {elapsed:?}, probes are not concurrent"
        );
    }
}
