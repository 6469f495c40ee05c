//! Public TCP port leasing.
//!
//! The server owns a set of leasable ports assembled from configured
//! ranges. A lease claims a port, counts against the covering range-group's
//! quota, and performs the actual bind - a failed bind returns the port.
//! Ports go back into the set when the leased listener closes with its
//! owning client; the quota consumption does not, by design: a client's
//! quota lives as long as the client itself.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Inclusive port range parsed from `"22-80"`, `"80"`, or `"0"` (the whole
/// dynamic space, `1-65535`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Error)]
pub enum PortRangeError {
    #[error("invalid port range '{0}'")]
    Invalid(String),

    #[error("port range minimum is greater than maximum")]
    MinAboveMax,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, PortRangeError> {
        let min = if min == 0 { 1 } else { min };
        if min > max {
            return Err(PortRangeError::MinAboveMax);
        }
        Ok(Self { min, max })
    }

    pub fn parse(s: &str) -> Result<Self, PortRangeError> {
        match s.split_once('-') {
            Some((min, max)) => {
                let min: u16 = min
                    .parse()
                    .map_err(|_| PortRangeError::Invalid(s.to_owned()))?;
                let max: u16 = max
                    .parse()
                    .map_err(|_| PortRangeError::Invalid(s.to_owned()))?;
                Self::new(min, max)
            }
            None => {
                let port: u16 = s
                    .parse()
                    .map_err(|_| PortRangeError::Invalid(s.to_owned()))?;
                if port == 0 {
                    Self::new(1, 65535)
                } else {
                    Self::new(port, port)
                }
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

struct RangeGroup {
    range: PortRange,
    /// Max leases this group hands out per manager; 0 disables the group.
    number: u16,
    used: AtomicU32,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("port {0} is not leasable")]
    NotAllowed(u16),

    #[error("port quota exhausted")]
    QuotaExhausted,

    #[error("no leasable port available")]
    Exhausted,

    #[error(transparent)]
    Bind(#[from] io::Error),
}

/// A successful lease: the bound listener and its port. The caller owns the
/// listener; the port must be given back via [`PortsManager::release`] when
/// it closes.
pub struct Lease {
    pub port: u16,
    pub listener: TcpListener,
}

/// Tracks which public TCP ports are leased. Shared globally or held
/// privately per user, depending on configuration.
pub struct PortsManager {
    groups: Vec<RangeGroup>,
    available: Mutex<HashSet<u16>>,
    scan_seed: AtomicUsize,
}

impl PortsManager {
    pub fn new(ranges: &[(PortRange, u16)]) -> Self {
        let mut available = HashSet::new();
        let mut groups = Vec::with_capacity(ranges.len());
        for (range, number) in ranges {
            for port in range.min..=range.max {
                available.insert(port);
                if port == u16::MAX {
                    break;
                }
            }
            groups.push(RangeGroup {
                range: *range,
                number: *number,
                used: AtomicU32::new(0),
            });
        }
        Self {
            groups,
            available: Mutex::new(available),
            scan_seed: AtomicUsize::new(rand::thread_rng().gen()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Ports currently leasable.
    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Lease one specific port: it must be inside a configured range with
    /// quota to spare, and the bind must succeed.
    pub async fn lease_specific(&self, port: u16) -> Result<Lease, LeaseError> {
        self.claim(port)?;
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                debug!(port, "tcp port leased");
                Ok(Lease { port, listener })
            }
            Err(err) => {
                self.unclaim(port);
                Err(LeaseError::Bind(err))
            }
        }
    }

    /// Lease any available port, scanning from a rotating start point so
    /// consecutive leases spread over the range. Gives up after a few
    /// failed binds rather than sweeping the whole set.
    pub async fn lease_random(&self) -> Result<Lease, LeaseError> {
        let candidates: Vec<u16> = {
            let available = self.available.lock().unwrap();
            available
                .iter()
                .copied()
                .filter(|port| self.group_allows(*port))
                .collect()
        };
        if candidates.is_empty() {
            return Err(LeaseError::Exhausted);
        }

        let start = self.scan_seed.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let mut attempts = 0;
        for i in 0..candidates.len() {
            let port = candidates[(start + i) % candidates.len()];
            match self.lease_specific(port).await {
                Ok(lease) => return Ok(lease),
                Err(LeaseError::Bind(err)) => {
                    warn!(port, %err, "failed to bind leasable port");
                    attempts += 1;
                    if attempts >= 3 {
                        break;
                    }
                }
                // Claimed by a concurrent lease since the snapshot.
                Err(_) => continue,
            }
        }
        Err(LeaseError::Exhausted)
    }

    /// Return a port to the leasable set. Quota consumption is not given
    /// back; it belongs to the owning client for its lifetime.
    pub fn release(&self, port: u16) {
        self.available.lock().unwrap().insert(port);
    }

    fn claim(&self, port: u16) -> Result<(), LeaseError> {
        let group = self
            .groups
            .iter()
            .find(|g| g.range.contains(port))
            .ok_or(LeaseError::NotAllowed(port))?;

        let mut available = self.available.lock().unwrap();
        if !available.contains(&port) {
            return Err(LeaseError::NotAllowed(port));
        }
        if group.used.load(Ordering::Acquire) >= u32::from(group.number) {
            return Err(LeaseError::QuotaExhausted);
        }
        available.remove(&port);
        group.used.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unclaim(&self, port: u16) {
        if let Some(group) = self.groups.iter().find(|g| g.range.contains(port)) {
            group.used.fetch_sub(1, Ordering::AcqRel);
        }
        self.available.lock().unwrap().insert(port);
    }

    fn group_allows(&self, port: u16) -> bool {
        self.groups
            .iter()
            .find(|g| g.range.contains(port))
            .map(|g| g.used.load(Ordering::Acquire) < u32::from(g.number))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_forms() {
        assert_eq!(PortRange::parse("22-80").unwrap(), PortRange { min: 22, max: 80 });
        assert_eq!(PortRange::parse("80").unwrap(), PortRange { min: 80, max: 80 });
        assert_eq!(
            PortRange::parse("0").unwrap(),
            PortRange { min: 1, max: 65535 }
        );
        assert!(PortRange::parse("80-22").is_err());
        assert!(PortRange::parse("abc").is_err());
        assert!(PortRange::parse("70000").is_err());
    }

    #[test]
    fn zero_min_normalizes_to_one() {
        assert_eq!(PortRange::new(0, 10).unwrap().min, 1);
    }

    #[tokio::test]
    async fn specific_lease_conflicts_until_released() {
        let manager = PortsManager::new(&[(PortRange::new(41200, 41210).unwrap(), 10)]);

        let lease = manager.lease_specific(41205).await.unwrap();
        // Same port again: refused without touching the bind.
        assert!(matches!(
            manager.lease_specific(41205).await,
            Err(LeaseError::NotAllowed(41205))
        ));

        drop(lease);
        manager.release(41205);
        let again = manager.lease_specific(41205).await.unwrap();
        assert_eq!(again.port, 41205);
    }

    #[tokio::test]
    async fn lease_outside_ranges_is_refused() {
        let manager = PortsManager::new(&[(PortRange::new(41220, 41225).unwrap(), 10)]);
        assert!(matches!(
            manager.lease_specific(41230).await,
            Err(LeaseError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn quota_is_enforced_per_group() {
        let manager = PortsManager::new(&[(PortRange::new(41230, 41239).unwrap(), 1)]);
        let _lease = manager.lease_specific(41230).await.unwrap();
        assert!(matches!(
            manager.lease_specific(41231).await,
            Err(LeaseError::QuotaExhausted)
        ));
        assert!(matches!(
            manager.lease_random().await,
            Err(LeaseError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn random_lease_stays_inside_ranges_and_exhausts_cleanly() {
        let range = PortRange::new(41240, 41242).unwrap();
        let manager = PortsManager::new(&[(range, 10)]);

        let mut leases = Vec::new();
        for _ in 0..3 {
            let lease = manager.lease_random().await.unwrap();
            assert!(range.contains(lease.port));
            leases.push(lease);
        }
        assert!(matches!(
            manager.lease_random().await,
            Err(LeaseError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn failed_bind_unleases() {
        // Occupy a port outside the manager first.
        let blocker = TcpListener::bind(("0.0.0.0", 41250)).await.unwrap();
        let manager = PortsManager::new(&[(PortRange::new(41250, 41250).unwrap(), 10)]);

        assert!(matches!(
            manager.lease_specific(41250).await,
            Err(LeaseError::Bind(_))
        ));
        // The claim was rolled back: releasing the blocker lets it succeed.
        drop(blocker);
        let lease = manager.lease_specific(41250).await.unwrap();
        assert_eq!(lease.port, 41250);
    }
}
