#![forbid(unsafe_code)]

use crate::rules::RuleToken;
use packet_types::{FragmentHeader, IpProtocol};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Identifies one in-flight fragmented datagram. At most one live entry
/// exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub ip_id: u16,
    pub protocol: IpProtocol,
}

impl FragmentKey {
    pub fn from_header(header: &FragmentHeader) -> Self {
        FragmentKey {
            src_addr: header.src_addr,
            dst_addr: header.dst_addr,
            ip_id: header.ip_id,
            protocol: header.protocol,
        }
    }

    fn shard_index(&self, shards: usize) -> usize {
        let mut hash = 2166136261u32;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(16777619);
        };
        match self.src_addr {
            IpAddr::V4(ip) => ip.octets().into_iter().for_each(&mut mix),
            IpAddr::V6(ip) => ip.octets().into_iter().for_each(&mut mix),
        }
        match self.dst_addr {
            IpAddr::V4(ip) => ip.octets().into_iter().for_each(&mut mix),
            IpAddr::V6(ip) => ip.octets().into_iter().for_each(&mut mix),
        }
        self.ip_id.to_be_bytes().into_iter().for_each(&mut mix);
        mix(self.protocol.number());
        (hash as usize) % shards
    }
}

/// Tracking state of one key, as observed at a point in time. `Expired`
/// covers an entry whose idle window has lapsed but which no sweep has
/// removed yet; it never serves lookups and never becomes `Pending` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    None,
    Pending,
    Expired,
}

#[derive(Debug, Clone)]
struct FragmentEntry {
    token: RuleToken,
    ttl: u8,
    packets: u64,
    bytes: u64,
    first_seen: bool,
    last_touched: Instant,
}

/// Point-in-time copy of one tracked datagram, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSnapshot {
    pub key: FragmentKey,
    pub token: RuleToken,
    pub ttl: u8,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: bool,
    pub last_touched: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragStats {
    /// Datagrams admitted into the cache.
    pub tracked: u64,
    /// Non-initial fragments that inherited a recorded verdict.
    pub hits: u64,
    /// Non-initial fragments with no live entry.
    pub orphans: u64,
    /// Entries pushed out by the capacity bound.
    pub evicted: u64,
    /// Entries removed because their idle window lapsed or they were
    /// explicitly flushed.
    pub expired: u64,
}

#[derive(Debug, Default)]
struct Shard {
    table: HashMap<FragmentKey, FragmentEntry>,
    lru: VecDeque<FragmentKey>,
    stats: FragStats,
}

impl Shard {
    fn touch(&mut self, key: &FragmentKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
            self.lru.push_back(*key);
        }
    }

    fn remove_entry(&mut self, key: &FragmentKey) -> bool {
        let removed = self.table.remove(key).is_some();
        if removed
            && let Some(pos) = self.lru.iter().position(|k| k == key)
        {
            self.lru.remove(pos);
        }
        removed
    }
}

/// Correlates non-initial fragments with the verdict recorded for fragment
/// zero of the same datagram. Keys hash across independent shards so
/// same-key operations serialize while unrelated datagrams rarely contend.
#[derive(Debug)]
pub struct FragmentCache {
    shards: Vec<Mutex<Shard>>,
    capacity_per_shard: AtomicUsize,
    idle_window_ms: AtomicU64,
}

impl FragmentCache {
    pub fn new(shards: usize, capacity_per_shard: usize, idle_window: Duration) -> Self {
        let shards = shards.max(1);
        FragmentCache {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            capacity_per_shard: AtomicUsize::new(capacity_per_shard.max(1)),
            idle_window_ms: AtomicU64::new(idle_window.as_millis() as u64),
        }
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms.load(Ordering::Relaxed))
    }

    /// Takes effect on the next lookup or sweep.
    pub fn set_idle_window(&self, window: Duration) {
        self.idle_window_ms
            .store(window.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn capacity_per_shard(&self) -> usize {
        self.capacity_per_shard.load(Ordering::Relaxed)
    }

    /// Applies to admissions from here on; a shrunk shard trims the next
    /// time it admits.
    pub fn set_capacity_per_shard(&self, capacity: usize) {
        self.capacity_per_shard
            .store(capacity.max(1), Ordering::Relaxed);
    }

    /// For a non-initial fragment, return the recorded verdict token if the
    /// datagram is tracked and live. A first fragment is never a lookup:
    /// the caller must run full rule evaluation and then `record` the
    /// outcome. `None` for a non-initial fragment means the fragment is an
    /// orphan and the caller applies the default policy.
    pub fn lookup_or_admit(&self, header: &FragmentHeader, now: Instant) -> Option<RuleToken> {
        if header.is_first_fragment {
            return None;
        }
        let key = FragmentKey::from_header(header);
        let window = self.idle_window();
        let mut shard = self.lock_shard(&key);
        match shard.table.get_mut(&key) {
            Some(entry) if !lapsed(entry.last_touched, now, window) => {
                entry.packets += 1;
                entry.bytes += header.len as u64;
                entry.last_touched = now;
                let token = entry.token;
                shard.touch(&key);
                shard.stats.hits += 1;
                Some(token)
            }
            Some(_) => {
                shard.remove_entry(&key);
                shard.stats.expired += 1;
                shard.stats.orphans += 1;
                None
            }
            None => {
                shard.stats.orphans += 1;
                None
            }
        }
    }

    /// Insert or refresh the tracking entry for a datagram whose first
    /// fragment just passed a rule. Re-recording a live key replaces its
    /// token; a lapsed entry under the key is dropped first, so a reused
    /// ip id starts a fresh entry instead of reviving the old one. At
    /// capacity the shard's least recently touched entry is evicted.
    pub fn record(&self, header: &FragmentHeader, token: RuleToken, now: Instant) {
        let key = FragmentKey::from_header(header);
        let window = self.idle_window();
        let mut shard = self.lock_shard(&key);
        if let Some(entry) = shard.table.get_mut(&key) {
            if !lapsed(entry.last_touched, now, window) {
                entry.token = token;
                entry.packets += 1;
                entry.bytes += header.len as u64;
                entry.last_touched = now;
                entry.first_seen = entry.first_seen || header.is_first_fragment;
                shard.touch(&key);
                return;
            }
            shard.remove_entry(&key);
            shard.stats.expired += 1;
        }
        let capacity = self.capacity_per_shard();
        while shard.table.len() >= capacity {
            let Some(oldest) = shard.lru.pop_front() else {
                break;
            };
            shard.table.remove(&oldest);
            shard.stats.evicted += 1;
        }
        shard.lru.push_back(key);
        shard.table.insert(
            key,
            FragmentEntry {
                token,
                ttl: header.ttl,
                packets: 1,
                bytes: header.len as u64,
                first_seen: header.is_first_fragment,
                last_touched: now,
            },
        );
        shard.stats.tracked += 1;
    }

    pub fn entry_state(&self, key: &FragmentKey, now: Instant) -> FragmentState {
        let window = self.idle_window();
        let shard = self.lock_shard(key);
        match shard.table.get(key) {
            None => FragmentState::None,
            Some(entry) if lapsed(entry.last_touched, now, window) => FragmentState::Expired,
            Some(_) => FragmentState::Pending,
        }
    }

    /// Explicit flush of one datagram, on reassembly completion.
    pub fn expire(&self, key: &FragmentKey) -> bool {
        let mut shard = self.lock_shard(key);
        let removed = shard.remove_entry(key);
        if removed {
            shard.stats.expired += 1;
        }
        removed
    }

    /// Remove every entry whose idle window has lapsed. Runs off the packet
    /// path, driven by the periodic reaper.
    pub fn reap(&self, now: Instant) -> usize {
        let window = self.idle_window();
        let mut removed = 0usize;
        for shard in &self.shards {
            let mut shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let lapsed_keys: Vec<FragmentKey> = shard
                .table
                .iter()
                .filter(|(_, entry)| lapsed(entry.last_touched, now, window))
                .map(|(key, _)| *key)
                .collect();
            for key in lapsed_keys {
                shard.remove_entry(&key);
                shard.stats.expired += 1;
                removed += 1;
            }
        }
        removed
    }

    pub fn flush(&self) {
        for shard in &self.shards {
            let mut shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shard.table.clear();
            shard.lru.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| match shard.lock() {
                Ok(guard) => guard.table.len(),
                Err(poisoned) => poisoned.into_inner().table.len(),
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<FragmentSnapshot> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for key in &shard.lru {
                if let Some(entry) = shard.table.get(key) {
                    out.push(FragmentSnapshot {
                        key: *key,
                        token: entry.token,
                        ttl: entry.ttl,
                        packets: entry.packets,
                        bytes: entry.bytes,
                        first_seen: entry.first_seen,
                        last_touched: entry.last_touched,
                    });
                }
            }
        }
        out
    }

    pub fn stats(&self) -> FragStats {
        let mut agg = FragStats::default();
        for shard in &self.shards {
            let shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            agg.tracked += shard.stats.tracked;
            agg.hits += shard.stats.hits;
            agg.orphans += shard.stats.orphans;
            agg.evicted += shard.stats.evicted;
            agg.expired += shard.stats.expired;
        }
        agg
    }

    fn lock_shard(&self, key: &FragmentKey) -> std::sync::MutexGuard<'_, Shard> {
        let index = key.shard_index(self.shards.len());
        match self.shards[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn lapsed(last_touched: Instant, now: Instant, window: Duration) -> bool {
    now.duration_since(last_touched) > window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(src: &str, ip_id: u16, first: bool) -> FragmentHeader {
        FragmentHeader {
            src_addr: src.parse().unwrap(),
            dst_addr: "192.168.1.1".parse().unwrap(),
            protocol: IpProtocol::Udp,
            ip_id,
            is_first_fragment: first,
            ttl: 64,
            len: 1480,
        }
    }

    fn token(id: u64) -> RuleToken {
        RuleToken { generation: 1, id }
    }

    #[test]
    fn later_fragments_inherit_recorded_verdict() {
        let cache = FragmentCache::new(4, 128, Duration::from_secs(30));
        let now = Instant::now();
        cache.record(&frag("10.0.0.1", 42, true), token(3), now);

        let hit = cache.lookup_or_admit(&frag("10.0.0.1", 42, false), now);
        assert_eq!(hit, Some(token(3)));

        // a different datagram id is an orphan
        let miss = cache.lookup_or_admit(&frag("10.0.0.1", 43, false), now);
        assert_eq!(miss, None);

        let stats = cache.stats();
        assert_eq!(stats.tracked, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.orphans, 1);
    }

    #[test]
    fn first_fragment_is_never_a_lookup() {
        let cache = FragmentCache::new(4, 128, Duration::from_secs(30));
        let now = Instant::now();
        cache.record(&frag("10.0.0.1", 7, true), token(0), now);
        assert_eq!(cache.lookup_or_admit(&frag("10.0.0.1", 7, true), now), None);
        // not counted as an orphan
        assert_eq!(cache.stats().orphans, 0);
    }

    #[test]
    fn idle_window_expires_entries() {
        let cache = FragmentCache::new(2, 64, Duration::from_secs(30));
        let t0 = Instant::now();
        let first = frag("10.0.0.1", 9, true);
        cache.record(&first, token(1), t0);
        let key = FragmentKey::from_header(&first);

        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(cache.entry_state(&key, t1), FragmentState::Expired);
        assert_eq!(cache.lookup_or_admit(&frag("10.0.0.1", 9, false), t1), None);
        assert_eq!(cache.entry_state(&key, t1), FragmentState::None);
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.orphans, 1);
    }

    #[test]
    fn a_touch_resets_the_idle_window() {
        let cache = FragmentCache::new(2, 64, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.record(&frag("10.0.0.1", 5, true), token(0), t0);

        let t1 = t0 + Duration::from_secs(20);
        assert!(cache.lookup_or_admit(&frag("10.0.0.1", 5, false), t1).is_some());
        // 31s after t0 but only 11s after the touch
        let t2 = t0 + Duration::from_secs(31);
        assert!(cache.lookup_or_admit(&frag("10.0.0.1", 5, false), t2).is_some());
    }

    #[test]
    fn reap_removes_only_lapsed_entries() {
        let cache = FragmentCache::new(1, 64, Duration::from_secs(10));
        let t0 = Instant::now();
        cache.record(&frag("10.0.0.1", 1, true), token(0), t0);
        cache.record(&frag("10.0.0.2", 2, true), token(1), t0 + Duration::from_secs(5));

        let removed = cache.reap(t0 + Duration::from_secs(12));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(
            cache
                .lookup_or_admit(&frag("10.0.0.2", 2, false), t0 + Duration::from_secs(12))
                .is_some()
        );
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = FragmentCache::new(1, 2, Duration::from_secs(60));
        let now = Instant::now();
        cache.record(&frag("10.0.0.1", 1, true), token(0), now);
        cache.record(&frag("10.0.0.2", 2, true), token(1), now);
        // touch the first so the second is oldest
        assert!(cache.lookup_or_admit(&frag("10.0.0.1", 1, false), now).is_some());
        cache.record(&frag("10.0.0.3", 3, true), token(2), now);

        assert!(cache.lookup_or_admit(&frag("10.0.0.1", 1, false), now).is_some());
        assert_eq!(cache.lookup_or_admit(&frag("10.0.0.2", 2, false), now), None);
        assert_eq!(cache.stats().evicted, 1);
    }

    #[test]
    fn capacity_can_shrink_at_runtime() {
        let cache = FragmentCache::new(1, 4, Duration::from_secs(60));
        let now = Instant::now();
        for i in 0..4u16 {
            cache.record(&frag("10.0.0.1", i, true), token(i as u64), now);
        }
        cache.set_capacity_per_shard(2);
        cache.record(&frag("10.0.0.1", 9, true), token(9), now);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evicted, 3);
    }

    #[test]
    fn a_reused_ip_id_starts_a_fresh_entry() {
        let cache = FragmentCache::new(2, 64, Duration::from_secs(30));
        let t0 = Instant::now();
        cache.record(&frag("10.0.0.1", 13, true), token(0), t0);
        cache.lookup_or_admit(&frag("10.0.0.1", 13, false), t0);

        // same key again after the window lapsed: a new datagram
        let t1 = t0 + Duration::from_secs(40);
        cache.record(&frag("10.0.0.1", 13, true), token(4), t1);
        let snaps = cache.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].token, token(4));
        assert_eq!(snaps[0].packets, 1);
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn re_recording_keeps_one_entry_and_newest_token() {
        let cache = FragmentCache::new(4, 64, Duration::from_secs(30));
        let now = Instant::now();
        cache.record(&frag("10.0.0.1", 11, true), token(0), now);
        cache.record(&frag("10.0.0.1", 11, true), token(5), now);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.lookup_or_admit(&frag("10.0.0.1", 11, false), now),
            Some(token(5))
        );
    }

    #[test]
    fn explicit_expire_and_flush() {
        let cache = FragmentCache::new(4, 64, Duration::from_secs(30));
        let now = Instant::now();
        let first = frag("10.0.0.1", 21, true);
        cache.record(&first, token(0), now);
        let key = FragmentKey::from_header(&first);

        assert!(cache.expire(&key));
        assert!(!cache.expire(&key));
        assert_eq!(cache.lookup_or_admit(&frag("10.0.0.1", 21, false), now), None);

        cache.record(&frag("10.0.0.2", 22, true), token(1), now);
        cache.record(&frag("10.0.0.3", 23, true), token(2), now);
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn counters_accumulate_per_datagram() {
        let cache = FragmentCache::new(4, 64, Duration::from_secs(30));
        let now = Instant::now();
        cache.record(&frag("10.0.0.1", 31, true), token(0), now);
        cache.lookup_or_admit(&frag("10.0.0.1", 31, false), now);
        cache.lookup_or_admit(&frag("10.0.0.1", 31, false), now);

        let snaps = cache.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].packets, 3);
        assert_eq!(snaps[0].bytes, 3 * 1480);
        assert!(snaps[0].first_seen);
    }

    #[test]
    fn keys_spread_across_shards() {
        let cache = FragmentCache::new(8, 4, Duration::from_secs(30));
        let now = Instant::now();
        for i in 0..16u16 {
            cache.record(&frag("10.0.0.1", i, true), token(i as u64), now);
        }
        assert_eq!(cache.len(), 16);
        for i in 0..16u16 {
            assert_eq!(
                cache.lookup_or_admit(&frag("10.0.0.1", i, false), now),
                Some(token(i as u64))
            );
        }
    }
}
