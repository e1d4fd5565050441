// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use slog::{debug, info, warn, Logger};

use crate::error::Error;
use crate::host::{Host, HostKey};
use crate::supplier::HostSupplier;
use crate::token::{HashPartitioner, Token, TokenRing};

/// An immutable view of the cluster: its hosts and one token ring per rack.
///
/// Snapshots are never mutated. A topology refresh builds a new snapshot and
/// publishes it; operations that already hold the old one keep resolving
/// against it until they drop it.
#[derive(Debug)]
pub struct TopologySnapshot {
    hosts: Vec<Host>,
    // Position of each host in `hosts`, by key
    index: HashMap<HostKey, usize>,
    rings: BTreeMap<String, TokenRing>,
    local_rack: Option<String>,
    token_aware: bool,
    partitioner: Arc<dyn HashPartitioner>,
    next_round_robin: AtomicUsize,
}

impl TopologySnapshot {
    pub fn new(
        hosts: Vec<Host>,
        local_rack: Option<String>,
        token_aware: bool,
        partitioner: Arc<dyn HashPartitioner>,
    ) -> Self {
        let mut by_rack: BTreeMap<String, Vec<Host>> = BTreeMap::new();
        hosts.iter().for_each(|h| {
            by_rack.entry(h.rack.clone()).or_default().push(h.clone());
        });
        let rings = by_rack
            .into_iter()
            .map(|(rack, members)| (rack, TokenRing::new(members)))
            .collect();

        let mut index = HashMap::with_capacity(hosts.len());
        hosts.iter().enumerate().for_each(|(i, h)| {
            index.entry(h.key()).or_insert(i);
        });

        TopologySnapshot {
            hosts,
            index,
            rings,
            local_rack,
            token_aware,
            partitioner,
            next_round_robin: AtomicUsize::new(0),
        }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn host(&self, key: &HostKey) -> Option<&Host> {
        self.index.get(key).map(|&i| &self.hosts[i])
    }

    pub fn contains(&self, key: &HostKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn racks(&self) -> impl Iterator<Item = &str> {
        self.rings.keys().map(|r| r.as_str())
    }

    pub fn ring(&self, rack: &str) -> Option<&TokenRing> {
        self.rings.get(rack)
    }

    pub fn is_token_aware(&self) -> bool {
        self.token_aware
    }

    pub fn hash(&self, key: &[u8]) -> Token {
        self.partitioner.hash(key)
    }

    /// Resolve the host that should serve `key`.
    ///
    /// In token-aware mode this is the owner of the key's token in the local
    /// rack, or the owner of the same token in another rack when the local
    /// owner is down. The answer is deterministic for a given snapshot.
    pub fn resolve(&self, key: &[u8]) -> Result<Host, Error> {
        let mut candidates = self.replicas(key)?;
        Ok(candidates.swap_remove(0))
    }

    /// Every up host that can serve `key`, in order of preference. The first
    /// entry is the host `resolve` returns.
    pub fn replicas(&self, key: &[u8]) -> Result<Vec<Host>, Error> {
        let candidates = if self.token_aware {
            let hash = self.hash(key);
            self.rack_order()
                .into_iter()
                .filter_map(|ring| ring.owner(hash))
                .filter(|h| h.is_up())
                .cloned()
                .collect()
        } else {
            self.round_robin_order()
        };

        if candidates.is_empty() {
            Err(Error::NoAvailableHost)
        } else {
            Ok(candidates)
        }
    }

    /// Whether `host` owns `key` on its own rack's ring. Always true when the
    /// snapshot is not token aware.
    pub fn owns(&self, host: &Host, key: &[u8]) -> bool {
        if !self.token_aware {
            return true;
        }
        self.rings
            .get(&host.rack)
            .and_then(|ring| ring.owner(self.hash(key)))
            .map_or(false, |owner| owner.name == host.name)
    }

    // The local rack's ring first, then the remaining racks in name order.
    fn rack_order(&self) -> Vec<&TokenRing> {
        let mut rings = Vec::with_capacity(self.rings.len());
        let local = self.local_rack.as_ref();
        if let Some(ring) = local.and_then(|r| self.rings.get(r)) {
            rings.push(ring);
        }
        self.rings
            .iter()
            .filter(|(rack, _)| Some(*rack) != local)
            .for_each(|(_, ring)| rings.push(ring));
        rings
    }

    fn round_robin_order(&self) -> Vec<Host> {
        let local = self.local_rack.as_ref();
        let (mut near, mut far): (Vec<Host>, Vec<Host>) = self
            .hosts
            .iter()
            .filter(|h| h.is_up())
            .cloned()
            .partition(|h| Some(&h.rack) == local);

        let offset = self.next_round_robin.fetch_add(1, Ordering::Relaxed);
        if !near.is_empty() {
            let len = near.len();
            near.rotate_left(offset % len);
        } else if !far.is_empty() {
            let len = far.len();
            far.rotate_left(offset % len);
        }
        near.append(&mut far);
        near
    }
}

/// The currently published `TopologySnapshot`.
///
/// Readers load the snapshot without blocking; a refresh swaps in a new one
/// atomically.
#[derive(Debug)]
pub struct Topology {
    current: ArcSwap<TopologySnapshot>,
    local_rack: Option<String>,
    token_aware: bool,
    partitioner: Arc<dyn HashPartitioner>,
}

impl Topology {
    pub fn new(
        local_rack: Option<String>,
        token_aware: bool,
        partitioner: Arc<dyn HashPartitioner>,
    ) -> Self {
        let empty = TopologySnapshot::new(
            Vec::new(),
            local_rack.clone(),
            token_aware,
            partitioner.clone(),
        );
        Topology {
            current: ArcSwap::from_pointee(empty),
            local_rack,
            token_aware,
            partitioner,
        }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    /// Build a snapshot from `hosts` and make it the current one.
    pub fn publish(&self, hosts: Vec<Host>) -> Arc<TopologySnapshot> {
        let snapshot = Arc::new(TopologySnapshot::new(
            hosts,
            self.local_rack.clone(),
            self.token_aware,
            self.partitioner.clone(),
        ));
        self.current.store(snapshot.clone());
        snapshot
    }

    /// Poll `supplier` and publish what it returns. Returns `None` and keeps
    /// the current snapshot if the supplier fails.
    pub fn refresh<S>(
        &self,
        supplier: &mut S,
        log: &Logger,
    ) -> Option<Arc<TopologySnapshot>>
    where
        S: HostSupplier + ?Sized,
    {
        match supplier.list_hosts() {
            Ok(hosts) => {
                let previous = self.snapshot();
                if hosts != previous.hosts {
                    info!(
                        log,
                        "topology changed: {} hosts -> {} hosts",
                        previous.hosts.len(),
                        hosts.len()
                    );
                } else {
                    debug!(log, "topology unchanged ({} hosts)", hosts.len());
                }
                Some(self.publish(hosts))
            }
            Err(e) => {
                warn!(
                    log,
                    "host supplier failed, keeping last topology: {}", e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use quickcheck::quickcheck;

    use crate::host::HostStatus;
    use crate::token::Xxh32Partitioner;

    fn host(octet: u8, rack: &str, token: u32) -> Host {
        Host::new(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)), 8102, rack)
            .with_token(Token::from(token))
    }

    // Two racks, each a full copy of a three-token ring.
    fn two_rack_hosts() -> Vec<Host> {
        vec![
            host(1, "rack1", 1_000_000_000),
            host(2, "rack1", 2_000_000_000),
            host(3, "rack1", 3_000_000_000),
            host(4, "rack2", 1_000_000_000),
            host(5, "rack2", 2_000_000_000),
            host(6, "rack2", 3_000_000_000),
        ]
    }

    fn snapshot(hosts: Vec<Host>, local: Option<&str>) -> TopologySnapshot {
        TopologySnapshot::new(
            hosts,
            local.map(String::from),
            true,
            Arc::new(Xxh32Partitioner),
        )
    }

    #[test]
    fn resolve_prefers_local_rack() {
        let snap = snapshot(two_rack_hosts(), Some("rack2"));
        for key in &["a", "b", "user:42", "counter_1"] {
            let host = snap.resolve(key.as_bytes()).unwrap();
            assert_eq!(host.rack, "rack2");
        }
    }

    #[test]
    fn resolve_falls_back_to_remote_rack_owner() {
        let key = b"some-key";
        let full = snapshot(two_rack_hosts(), Some("rack1"));
        let owner = full.resolve(key).unwrap();
        let token = owner.ring_token();

        let hosts = two_rack_hosts()
            .into_iter()
            .map(|h| {
                if h.name == owner.name {
                    h.with_status(HostStatus::Down)
                } else {
                    h
                }
            })
            .collect();
        let degraded = snapshot(hosts, Some("rack1"));
        let fallback = degraded.resolve(key).unwrap();

        assert_eq!(fallback.rack, "rack2");
        assert_eq!(fallback.ring_token(), token);
    }

    #[test]
    fn resolve_fails_without_hosts() {
        let snap = snapshot(Vec::new(), None);
        assert_eq!(snap.resolve(b"k"), Err(Error::NoAvailableHost));
    }

    #[test]
    fn resolve_fails_when_all_hosts_down() {
        let hosts = two_rack_hosts()
            .into_iter()
            .map(|h| h.with_status(HostStatus::Down))
            .collect();
        let snap = snapshot(hosts, Some("rack1"));
        assert_eq!(snap.resolve(b"k"), Err(Error::NoAvailableHost));
    }

    #[test]
    fn replicas_list_one_owner_per_rack() {
        let snap = snapshot(two_rack_hosts(), Some("rack1"));
        let replicas = snap.replicas(b"key").unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].rack, "rack1");
        assert_eq!(replicas[1].rack, "rack2");
        assert_eq!(replicas[0].ring_token(), replicas[1].ring_token());
    }

    #[test]
    fn round_robin_rotates_over_local_rack() {
        let snap = TopologySnapshot::new(
            two_rack_hosts(),
            Some(String::from("rack1")),
            false,
            Arc::new(Xxh32Partitioner),
        );
        let first = snap.resolve(b"k").unwrap();
        let second = snap.resolve(b"k").unwrap();
        let third = snap.resolve(b"k").unwrap();
        let fourth = snap.resolve(b"k").unwrap();

        assert_eq!(first.rack, "rack1");
        assert_ne!(first.name, second.name);
        assert_ne!(second.name, third.name);
        assert_eq!(first.name, fourth.name);
    }

    #[test]
    fn publish_replaces_snapshot() {
        let topology =
            Topology::new(None, true, Arc::new(Xxh32Partitioner));
        let before = topology.snapshot();
        assert!(before.is_empty());

        topology.publish(two_rack_hosts());
        let after = topology.snapshot();

        assert!(before.is_empty());
        assert_eq!(after.hosts().len(), 6);
    }

    #[test]
    fn hosts_found_by_key() {
        let hosts = two_rack_hosts();
        let snap = snapshot(hosts.clone(), Some("rack1"));
        hosts.iter().for_each(|h| {
            assert_eq!(snap.host(&h.key()), Some(h));
            assert!(snap.contains(&h.key()));
        });

        let stranger = host(9, "rack1", 7);
        assert_eq!(snap.host(&stranger.key()), None);
        assert!(!snap.contains(&stranger.key()));

        // A host listed twice resolves to its first entry
        let mut twice = hosts[..2].to_vec();
        twice.push(hosts[0].clone().with_status(HostStatus::Down));
        let snap = snapshot(twice, None);
        assert!(snap.host(&hosts[0].key()).unwrap().is_up());
    }

    quickcheck! {
        fn prop_resolve_is_deterministic_and_in_snapshot(key: Vec<u8>) -> bool {
            let snap = snapshot(two_rack_hosts(), Some("rack1"));
            let a = snap.resolve(&key).unwrap();
            let b = snap.resolve(&key).unwrap();
            a == b && snap.contains(&a.key())
        }

        fn prop_same_segment_same_host(k1: Vec<u8>, k2: Vec<u8>) -> bool {
            let snap = snapshot(two_rack_hosts(), Some("rack1"));
            let ring = snap.ring("rack1").unwrap();
            let t1 = ring.owner_token(snap.hash(&k1));
            let t2 = ring.owner_token(snap.hash(&k2));
            if t1 == t2 {
                snap.resolve(&k1).unwrap() == snap.resolve(&k2).unwrap()
            } else {
                true
            }
        }
    }
}
