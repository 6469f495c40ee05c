//! Per-IP reconnect limiting.
//!
//! Failed handshakes increment a counter per remote IP. Once the counter
//! passes the limit, further tunnel attempts from that IP are dropped
//! before the handshake is even read - no error frame, nothing for a
//! credential-guessing client to learn from. The counter resets once, a
//! fixed duration after the limit is first exceeded; this is a delayed
//! reset, not a sliding window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

pub struct ReconnectThrottle {
    attempts: RwLock<HashMap<IpAddr, u32>>,
    times: u32,
    duration: Duration,
}

impl ReconnectThrottle {
    pub fn new(times: u32, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            attempts: RwLock::new(HashMap::new()),
            times,
            duration,
        })
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.attempts
            .read()
            .unwrap()
            .get(&ip)
            .is_some_and(|n| *n > self.times)
    }

    /// Record one failed handshake. Schedules the single delayed reset when
    /// the counter first crosses the limit (a zero duration never resets).
    pub fn record_failure(self: &Arc<Self>, ip: IpAddr) {
        let attempts = {
            let mut map = self.attempts.write().unwrap();
            let n = map.entry(ip).or_insert(0);
            *n += 1;
            *n
        };

        if self.duration > Duration::ZERO && attempts > self.times {
            let throttle = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(throttle.duration).await;
                throttle.attempts.write().unwrap().insert(ip, 0);
                info!(%ip, "released blocked ip");
            });
        }
    }

    #[cfg(test)]
    fn failures(&self, ip: IpAddr) -> u32 {
        self.attempts.read().unwrap().get(&ip).copied().unwrap_or(0)
    }
}
