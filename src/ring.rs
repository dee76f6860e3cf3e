//! Consistent hash ring mapping keys to cache hosts.
//!
//! Each host contributes `replicas` virtual nodes so that load stays even when
//! only a handful of hosts are configured. Rings are immutable once built and
//! are memoized process-wide per host set, so lookups never take a lock.

use crate::error::{Error, Result};
use crate::metrics::RING_BUILDS;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::{Arc, LazyLock};

/// Virtual nodes per host when the configuration does not say otherwise.
pub const DEFAULT_REPLICAS: usize = 10;

static RINGS: LazyLock<RwLock<AHashMap<String, Arc<HashRing>>>> =
    LazyLock::new(|| RwLock::new(AHashMap::new()));

/// An immutable consistent hash ring.
#[derive(Debug)]
pub struct HashRing {
    hosts: Vec<String>,
    replicas: usize,
    /// Sorted ring positions.
    positions: Vec<u64>,
    /// `owners[i]` indexes into `hosts` for `positions[i]`.
    owners: Vec<usize>,
}

impl HashRing {
    /// Build a ring over `hosts` with `replicas` virtual nodes per host.
    pub fn build<S: AsRef<str>>(hosts: &[S], replicas: usize) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::InvalidConfig("host list is empty".to_string()));
        }
        if replicas == 0 {
            return Err(Error::InvalidConfig(
                "replica count must be positive".to_string(),
            ));
        }

        let hosts: Vec<String> = hosts.iter().map(|h| h.as_ref().to_string()).collect();
        let mut nodes = Vec::with_capacity(hosts.len() * replicas);
        for (idx, host) in hosts.iter().enumerate() {
            for i in 0..replicas {
                let vnode = format!("{host}_{i}");
                nodes.push((hash(vnode.as_bytes()), idx));
            }
        }
        // Ties are broken by host order so the ring never depends on sort
        // stability or insertion order.
        nodes.sort_unstable();
        nodes.dedup_by_key(|(position, _)| *position);

        let (positions, owners) = nodes.into_iter().unzip();

        Ok(Self {
            hosts,
            replicas,
            positions,
            owners,
        })
    }

    /// Return the memoized ring for this host set, building it on first use.
    pub fn get_or_build<S: AsRef<str>>(hosts: &[S], replicas: usize) -> Result<Arc<Self>> {
        let key = canonical_key(hosts, replicas);

        if let Some(ring) = RINGS.read().get(&key) {
            return Ok(ring.clone());
        }

        let mut rings = RINGS.write();
        // Another thread may have built it while we waited for the lock.
        if let Some(ring) = rings.get(&key) {
            return Ok(ring.clone());
        }
        let ring = Arc::new(Self::build(hosts, replicas)?);
        RING_BUILDS.increment();
        tracing::debug!(hosts = hosts.len(), replicas, "built hash ring");
        rings.insert(key, ring.clone());
        Ok(ring)
    }

    /// The host that owns `key`.
    pub fn locate(&self, key: &[u8]) -> &str {
        let h = hash(key);
        let mut idx = self.positions.partition_point(|&p| p < h);
        if idx == self.positions.len() {
            idx = 0;
        }
        &self.hosts[self.owners[idx]]
    }

    /// Hosts in configuration order.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn canonical_key<S: AsRef<str>>(hosts: &[S], replicas: usize) -> String {
    let mut key = format!("{replicas}");
    for host in hosts {
        key.push('\n');
        key.push_str(host.as_ref());
    }
    key
}

/// FNV-1a (64-bit) followed by the murmur3 finalizer.
///
/// Plain FNV leaves keys that differ only in their last byte clustered on the
/// ring; the finalizer spreads them. Neither step is seeded.
fn hash(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        h ^= byte as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
