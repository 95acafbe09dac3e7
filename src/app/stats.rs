//! Per-application traffic accounting.
//!
//! One record per uid, all counters atomic. A record is created on first
//! touch behind the single-flight table so concurrent first connections of
//! one app never race two records into existence. `deactivate_at` is
//! stamped when the last live connection of the uid goes away, which is
//! what the host app's "recently active" list keys on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::{CondTable, Flight};
use crate::engine::Network;

#[derive(Default)]
pub struct AppStats {
    pub tcp_conn: AtomicI32,
    pub udp_conn: AtomicI32,
    pub tcp_conn_total: AtomicU32,
    pub udp_conn_total: AtomicU32,
    pub uplink: Arc<AtomicU64>,
    pub downlink: Arc<AtomicU64>,
    pub deactivate_at: AtomicI64,
}

impl AppStats {
    pub fn live_connections(&self) -> i32 {
        self.tcp_conn.load(Ordering::Relaxed) + self.udp_conn.load(Ordering::Relaxed)
    }
}

pub struct StatsRegistry {
    records: Mutex<HashMap<u32, Arc<AppStats>>>,
    first_touch: CondTable<u32>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            first_touch: CondTable::new(),
        }
    }

    pub fn get(&self, uid: u32) -> Option<Arc<AppStats>> {
        match self.records.lock() {
            Ok(records) => records.get(&uid).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&uid).cloned(),
        }
    }

    /// Look up or create the record for `uid`, coalescing concurrent first
    /// touches of the same uid.
    pub async fn get_or_create(&self, uid: u32) -> Arc<AppStats> {
        loop {
            if let Some(stats) = self.get(uid) {
                return stats;
            }
            match self.first_touch.join(uid).await {
                Flight::Leader(_guard) => {
                    let stats = Arc::new(AppStats::default());
                    match self.records.lock() {
                        Ok(mut records) => {
                            records.insert(uid, stats.clone());
                        }
                        Err(poisoned) => {
                            poisoned.into_inner().insert(uid, stats.clone());
                        }
                    }
                    return stats;
                }
                Flight::Follower => continue,
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(u32, Arc<AppStats>)> {
        match self.records.lock() {
            Ok(records) => records.iter().map(|(k, v)| (*k, v.clone())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }
}

/// Live-connection bookkeeping for one adopted session. Increments the
/// per-network counters on creation; on drop decrements and, when the uid
/// has no live connections left, stamps `deactivate_at`.
pub struct ActiveConn {
    stats: Arc<AppStats>,
    network: Network,
}

impl ActiveConn {
    pub fn begin(stats: Arc<AppStats>, network: Network) -> Self {
        match network {
            Network::Tcp => {
                stats.tcp_conn.fetch_add(1, Ordering::SeqCst);
                stats.tcp_conn_total.fetch_add(1, Ordering::Relaxed);
            }
            Network::Udp => {
                stats.udp_conn.fetch_add(1, Ordering::SeqCst);
                stats.udp_conn_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        stats.deactivate_at.store(0, Ordering::Relaxed);
        Self { stats, network }
    }
}

impl Drop for ActiveConn {
    fn drop(&mut self) {
        let remaining = match self.network {
            Network::Tcp => {
                self.stats.tcp_conn.fetch_sub(1, Ordering::SeqCst) - 1
                    + self.stats.udp_conn.load(Ordering::SeqCst)
            }
            Network::Udp => {
                self.stats.udp_conn.fetch_sub(1, Ordering::SeqCst) - 1
                    + self.stats.tcp_conn.load(Ordering::SeqCst)
            }
        };
        if remaining == 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            self.stats.deactivate_at.store(now, Ordering::Relaxed);
        }
    }
}
