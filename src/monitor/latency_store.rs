use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::stats::latency_entry::LatencyEntry;
use crate::stats::node_summary::PeerLatency;

/// Latest latency per peer IP, plus the set of target IPs per known node.
///
/// Both maps live behind a single lock. Callers never get hold of the lock: the only way to modify
///  an entry is [LatencyStore::set], which applies a mutator function to the entry while holding
///  the write lock, so concurrent updates of different fields of the same entry are never lost.
///
/// All addresses are stored in canonical form, i.e. IPv4-mapped IPv6 addresses as plain IPv4.
///
/// There is no eviction: entries are removed only when their node goes away or stops using the IP.
#[derive(Default)]
pub struct LatencyStore {
    inner: RwLock<LatencyStoreInner>,
}

#[derive(Default)]
struct LatencyStoreInner {
    latencies: FxHashMap<IpAddr, LatencyEntry>,
    node_ips: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl LatencyStoreInner {
    fn is_referenced(&self, ip: &IpAddr) -> bool {
        self.node_ips.values().any(|ips| ips.contains(ip))
    }

    fn remove_unreferenced(&mut self, candidates: impl IntoIterator<Item = IpAddr>) {
        for ip in candidates {
            if !self.is_referenced(&ip) && self.latencies.remove(&ip).is_some() {
                debug!("removed latency entry for {} which is no longer monitored", ip);
            }
        }
    }

    fn set_node_ips(&mut self, name: &str, ips: &[IpAddr]) {
        let new_ips = ips.iter()
            .map(|ip| ip.to_canonical())
            .collect::<BTreeSet<_>>();

        let previous = self.node_ips.insert(name.to_string(), new_ips.clone());
        if let Some(previous) = previous {
            self.remove_unreferenced(previous.difference(&new_ips).cloned().collect::<Vec<_>>());
        }
    }
}

impl LatencyStore {
    pub fn new() -> LatencyStore {
        Default::default()
    }

    /// fetch-or-create the entry for `ip` and apply `mutator` to it, all under the write lock
    pub async fn set(&self, ip: IpAddr, mutator: impl FnOnce(&mut LatencyEntry)) {
        let mut inner = self.inner.write().await;
        let entry = inner.latencies.entry(ip.to_canonical()).or_default();
        mutator(entry);
    }

    pub async fn get(&self, ip: &IpAddr) -> Option<LatencyEntry> {
        self.inner.read().await
            .latencies.get(&ip.to_canonical())
            .cloned()
    }

    pub async fn delete(&self, ip: &IpAddr) {
        self.inner.write().await
            .latencies.remove(&ip.to_canonical());
    }

    /// sorted snapshot of all target IPs of all known nodes, i.e. the IPs to probe in one pass
    pub async fn list_peer_ips(&self) -> Vec<IpAddr> {
        self.inner.read().await
            .node_ips.values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn add_node(&self, name: &str, ips: &[IpAddr]) {
        debug!("adding node {} with IPs {:?}", name, ips);
        self.inner.write().await
            .set_node_ips(name, ips);
    }

    /// Replaces the node's IPs. Latency entries of IPs the node no longer has are removed unless
    ///  another node still uses them.
    pub async fn update_node(&self, name: &str, ips: &[IpAddr]) {
        debug!("updating node {} to IPs {:?}", name, ips);
        self.inner.write().await
            .set_node_ips(name, ips);
    }

    pub async fn delete_node(&self, name: &str) {
        let mut inner = self.inner.write().await;
        match inner.node_ips.remove(name) {
            Some(ips) => {
                debug!("deleting node {}", name);
                inner.remove_unreferenced(ips);
            }
            None => debug!("deleting node {} which is not known - ignoring", name),
        }
    }

    /// Snapshot of the entries of all known target IPs, ordered by node name and then by IP. IPs
    ///  that have no entry yet are skipped, and so are entries of IPs that belong to no node (e.g.
    ///  created by a stray reply).
    pub async fn peer_latencies(&self) -> Vec<PeerLatency> {
        let inner = self.inner.read().await;

        let mut reported = BTreeSet::new();
        let mut result = Vec::new();
        for ip in inner.node_ips.values().flatten() {
            if !reported.insert(*ip) {
                continue;
            }
            if let Some(latency) = inner.latencies.get(ip) {
                result.push(PeerLatency {
                    peer_ip: *ip,
                    latency: latency.clone(),
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use chrono::Utc;
    use rstest::rstest;
    use crate::monitor::latency_store::LatencyStore;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ips(s: &[&str]) -> Vec<IpAddr> {
        s.iter().map(|s| ip(s)).collect()
    }

    #[tokio::test]
    async fn test_set_creates_entry() {
        let store = LatencyStore::new();
        assert!(store.get(&ip("10.0.0.1")).await.is_none());

        let now = Utc::now();
        store.set(ip("10.0.0.1"), |e| e.last_send_time = Some(now)).await;

        let entry = store.get(&ip("10.0.0.1")).await.unwrap();
        assert_eq!(entry.last_send_time, Some(now));
        assert_eq!(entry.last_recv_time, None);
        assert_eq!(entry.last_measured_rtt, None);
    }

    #[tokio::test]
    async fn test_set_keeps_untouched_fields() {
        let store = LatencyStore::new();
        let sent = Utc::now();
        store.set(ip("10.0.0.1"), |e| e.last_send_time = Some(sent)).await;
        store.set(ip("10.0.0.1"), |e| e.last_measured_rtt = Some(Duration::from_millis(2))).await;

        let entry = store.get(&ip("10.0.0.1")).await.unwrap();
        assert_eq!(entry.last_send_time, Some(sent));
        assert_eq!(entry.last_measured_rtt, Some(Duration::from_millis(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_loses_no_update() {
        let store = Arc::new(LatencyStore::new());
        let sent = Utc::now();

        let mut handles = Vec::new();
        for i in 0..100u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.set(ip("10.0.0.1"), |e| e.last_send_time = Some(sent)).await;
                }
                else {
                    store.set(ip("10.0.0.1"), |e| {
                        let rtt = e.last_measured_rtt.unwrap_or_default();
                        e.last_measured_rtt = Some(rtt + Duration::from_nanos(1));
                    }).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let entry = store.get(&ip("10.0.0.1")).await.unwrap();
        assert_eq!(entry.last_send_time, Some(sent));
        assert_eq!(entry.last_measured_rtt, Some(Duration::from_nanos(50)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = LatencyStore::new();
        store.set(ip("10.0.0.1"), |_| {}).await;
        store.set(ip("10.0.0.2"), |_| {}).await;

        store.delete(&ip("10.0.0.1")).await;
        assert!(store.get(&ip("10.0.0.1")).await.is_none());
        assert!(store.get(&ip("10.0.0.2")).await.is_some());

        store.delete(&ip("10.0.0.9")).await;
    }

    #[tokio::test]
    async fn test_canonical_keys() {
        let store = LatencyStore::new();
        store.set(ip("::ffff:10.0.0.1"), |e| e.last_measured_rtt = Some(Duration::from_millis(1))).await;
        assert!(store.get(&ip("10.0.0.1")).await.is_some());

        store.add_node("b", &ips(&["::ffff:10.0.0.2"])).await;
        assert_eq!(store.list_peer_ips().await, ips(&["10.0.0.2"]));
    }

    #[tokio::test]
    async fn test_list_peer_ips() {
        let store = LatencyStore::new();
        assert!(store.list_peer_ips().await.is_empty());

        store.add_node("b", &ips(&["10.0.0.2", "fd00::2"])).await;
        store.add_node("a", &ips(&["10.0.0.3", "10.0.0.2"])).await;
        assert_eq!(store.list_peer_ips().await, ips(&["10.0.0.2", "10.0.0.3", "fd00::2"]));
    }

    #[rstest]
    #[case::ip_dropped(vec!["10.0.0.2", "10.0.0.3"], vec!["10.0.0.2"], vec!["10.0.0.2"])]
    #[case::ip_replaced(vec!["10.0.0.2"], vec!["10.0.0.4"], vec![])]
    #[case::ip_added(vec!["10.0.0.2"], vec!["10.0.0.2", "10.0.0.3"], vec!["10.0.0.2"])]
    #[case::shared_ip_dropped(vec!["10.0.0.2", "10.0.0.9"], vec!["10.0.0.2"], vec!["10.0.0.2", "10.0.0.9"])]
    #[tokio::test]
    async fn test_update_node(#[case] before: Vec<&str>, #[case] after: Vec<&str>, #[case] expected_entries: Vec<&str>) {
        let store = LatencyStore::new();
        store.add_node("b", &ips(&before)).await;
        store.add_node("other", &ips(&["10.0.0.9"])).await;
        for ip in ips(&before) {
            store.set(ip, |e| e.last_measured_rtt = Some(Duration::from_millis(1))).await;
        }

        store.update_node("b", &ips(&after)).await;

        let mut actual = Vec::new();
        for candidate in ips(&["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.9"]) {
            if store.get(&candidate).await.is_some() {
                actual.push(candidate);
            }
        }
        assert_eq!(actual, ips(&expected_entries));
    }

    #[tokio::test]
    async fn test_delete_node() {
        let store = LatencyStore::new();
        store.add_node("a", &ips(&["10.0.0.1", "10.0.0.5"])).await;
        store.add_node("b", &ips(&["10.0.0.2", "10.0.0.5"])).await;
        for ip in ips(&["10.0.0.1", "10.0.0.2", "10.0.0.5"]) {
            store.set(ip, |_| {}).await;
        }

        store.delete_node("a").await;
        assert!(store.get(&ip("10.0.0.1")).await.is_none());
        assert!(store.get(&ip("10.0.0.2")).await.is_some());
        assert!(store.get(&ip("10.0.0.5")).await.is_some());
        assert_eq!(store.list_peer_ips().await, ips(&["10.0.0.2", "10.0.0.5"]));

        store.delete_node("unknown").await;
        assert_eq!(store.list_peer_ips().await, ips(&["10.0.0.2", "10.0.0.5"]));
    }

    #[tokio::test]
    async fn test_peer_latencies() {
        let store = LatencyStore::new();
        store.add_node("b", &ips(&["10.0.0.3", "10.0.0.2"])).await;
        store.add_node("a", &ips(&["10.0.0.7", "10.0.0.3"])).await;
        store.add_node("c", &ips(&["10.0.0.8"])).await;

        for ip in ips(&["10.0.0.2", "10.0.0.3", "10.0.0.7", "10.0.0.99"]) {
            store.set(ip, |e| e.last_measured_rtt = Some(Duration::from_millis(1))).await;
        }

        let reported = store.peer_latencies().await.into_iter()
            .map(|p| p.peer_ip)
            .collect::<Vec<_>>();
        assert_eq!(reported, ips(&["10.0.0.3", "10.0.0.7", "10.0.0.2"]));
    }
}
