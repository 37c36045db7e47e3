use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use priority_queue::PriorityQueue;

use dns_types::protocol::types::*;
use dns_types::zones::types::SOA;

/// One week, the ceiling every cached TTL is smoothed down to.
pub const MAX_TTL: u32 = 604_800;

/// The provenance of a cache entry: larger ranks win when an insert
/// would otherwise overwrite fresher data with staler data of the
/// same tag. Ordered so that the derived `Ord` gives the right
/// precedence directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rank {
    Additional,
    NonAuthoritativeAnswer,
    ZoneGlue,
    AuthoritativeAuthority,
    AuthoritativeAnswer,
    ZoneTransfer,
    ZoneFile,
}

#[derive(Debug, Clone)]
struct Meta {
    created_at: Instant,
    rank: Rank,
}

#[derive(Debug, Clone)]
enum Payload {
    /// A single resource record.
    Entry(ResourceRecord),
    /// An authoritative or resolved denial that this tag does not
    /// exist at this name.
    NoData { soa: SOA },
    /// An answer could not be obtained due to an upstream failure.
    ServFail,
}

#[derive(Debug, Clone)]
enum CacheValue {
    /// `name` is an alias: the real answer is at `target`.
    Alias { meta: Meta, ttl: u32, target: DomainName },
    /// `name` does not exist at all.
    NoDomain { meta: Meta, soa: SOA },
    /// Per-tag answers at `name`.
    RRMap(HashMap<RecordType, (Meta, Payload)>),
}

/// Outcome of a single `query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Hit(Vec<ResourceRecord>),
    Alias(DomainName),
    NoDomain,
    NoData,
    ServFail,
    Miss,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub hit: u64,
    pub miss: u64,
    pub drop: u64,
    pub insert: u64,
}

/// A single-owner, non-blocking cache of resolved and authoritative
/// answers. Every operation that depends on elapsed time is given
/// `now` explicitly rather than reading the clock itself.
#[derive(Debug, Clone)]
pub struct Cache {
    desired_size: usize,
    entries: HashMap<DomainName, CacheValue>,
    expiry: PriorityQueue<DomainName, Reverse<Instant>>,
    stats: Stats,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::with_desired_size(512)
    }

    pub fn with_desired_size(desired_size: usize) -> Self {
        Cache {
            desired_size,
            entries: HashMap::new(),
            expiry: PriorityQueue::new(),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `name`/`tag` as of `now`.
    pub fn query(&mut self, now: Instant, name: &DomainName, tag: RecordType) -> QueryResult {
        let result = match self.entries.get(name) {
            None => QueryResult::Miss,
            Some(CacheValue::Alias { meta, ttl, target }) => {
                if expired(now, meta, *ttl) {
                    QueryResult::Miss
                } else {
                    QueryResult::Alias(target.clone())
                }
            }
            Some(CacheValue::NoDomain { meta, .. }) => {
                if expired(now, meta, MAX_TTL) {
                    QueryResult::Miss
                } else {
                    QueryResult::NoDomain
                }
            }
            Some(CacheValue::RRMap(map)) => match map.get(&tag) {
                None => QueryResult::Miss,
                Some((meta, Payload::Entry(rr))) => {
                    if expired(now, meta, rr.ttl) {
                        QueryResult::Miss
                    } else {
                        let mut rr = rr.clone();
                        rr.ttl = remaining_ttl(now, meta, rr.ttl);
                        QueryResult::Hit(vec![rr])
                    }
                }
                Some((meta, Payload::NoData { .. })) => {
                    if expired(now, meta, MAX_TTL) {
                        QueryResult::Miss
                    } else {
                        QueryResult::NoData
                    }
                }
                Some((meta, Payload::ServFail)) => {
                    if expired(now, meta, 5) {
                        QueryResult::Miss
                    } else {
                        QueryResult::ServFail
                    }
                }
            },
        };

        match result {
            QueryResult::Miss => {
                if self.entries.contains_key(name) {
                    self.stats.drop += 1;
                } else {
                    self.stats.miss += 1;
                }
            }
            _ => self.stats.hit += 1,
        }

        result
    }

    /// Insert an alias (CNAME) entry, subject to rank suppression.
    pub fn insert_alias(
        &mut self,
        now: Instant,
        name: DomainName,
        ttl: u32,
        target: DomainName,
        rank: Rank,
    ) {
        let ttl = ttl.min(MAX_TTL);
        if let Some(CacheValue::Alias { meta, .. }) = self.entries.get(&name) {
            if meta.rank > rank {
                return;
            }
        }
        self.entries.insert(
            name.clone(),
            CacheValue::Alias {
                meta: Meta { created_at: now, rank },
                ttl,
                target,
            },
        );
        self.touch_expiry(now, name, Duration::from_secs(u64::from(ttl)));
        self.stats.insert += 1;
        self.prune_if_over_capacity();
    }

    /// Insert a negative (NXDOMAIN) answer for the whole name.
    pub fn insert_nodomain(&mut self, now: Instant, name: DomainName, soa: SOA, rank: Rank) {
        if let Some(CacheValue::NoDomain { meta, .. }) = self.entries.get(&name) {
            if meta.rank > rank {
                return;
            }
        }
        let ttl = soa.minimum.min(MAX_TTL);
        self.entries.insert(
            name.clone(),
            CacheValue::NoDomain {
                meta: Meta { created_at: now, rank },
                soa,
            },
        );
        self.touch_expiry(now, name, Duration::from_secs(u64::from(ttl)));
        self.stats.insert += 1;
        self.prune_if_over_capacity();
    }

    /// Insert a single resource record.
    pub fn insert_rr(&mut self, now: Instant, rr: &ResourceRecord, rank: Rank) {
        self.insert_tag(
            now,
            rr.name.clone(),
            rr.rtype_with_data.rtype(),
            Payload::Entry(rr.clone()),
            rank,
            rr.ttl,
        );
    }

    /// Insert a negative (NODATA) answer for a single tag at `name`.
    pub fn insert_nodata(&mut self, now: Instant, name: DomainName, tag: RecordType, soa: SOA, rank: Rank) {
        let ttl = soa.minimum.min(MAX_TTL);
        self.insert_tag(now, name, tag, Payload::NoData { soa }, rank, ttl);
    }

    /// Remember that this tag could not be resolved at all, for a
    /// short grace period, so repeated failures don't hammer the
    /// next stage.
    pub fn insert_servfail(&mut self, now: Instant, name: DomainName, tag: RecordType, rank: Rank) {
        self.insert_tag(now, name, tag, Payload::ServFail, rank, 5);
    }

    fn insert_tag(
        &mut self,
        now: Instant,
        name: DomainName,
        tag: RecordType,
        payload: Payload,
        rank: Rank,
        ttl: u32,
    ) {
        let ttl = ttl.min(MAX_TTL);
        let map = match self
            .entries
            .entry(name.clone())
            .or_insert_with(|| CacheValue::RRMap(HashMap::new()))
        {
            CacheValue::RRMap(map) => map,
            other => {
                *other = CacheValue::RRMap(HashMap::new());
                match other {
                    CacheValue::RRMap(map) => map,
                    _ => unreachable!(),
                }
            }
        };

        if let Some((existing_meta, _)) = map.get(&tag) {
            if existing_meta.rank > rank {
                return;
            }
        }

        map.insert(tag, (Meta { created_at: now, rank }, payload));
        self.touch_expiry(now, name, Duration::from_secs(u64::from(ttl)));
        self.stats.insert += 1;
        self.prune_if_over_capacity();
    }

    fn touch_expiry(&mut self, now: Instant, name: DomainName, ttl: Duration) {
        let deadline = now + ttl;
        self.expiry.push_increase(name, Reverse(deadline));
    }

    /// Evict the single soonest-to-expire entry if the cache has
    /// grown beyond its desired size. Eviction happens on insert
    /// rather than on a fixed schedule, since the cache has no
    /// internal timer.
    fn prune_if_over_capacity(&mut self) {
        while self.entries.len() > self.desired_size {
            let Some((name, _)) = self.expiry.pop() else {
                break;
            };
            self.entries.remove(&name);
        }
    }
}

fn expired(now: Instant, meta: &Meta, ttl: u32) -> bool {
    now.checked_duration_since(meta.created_at)
        .map(|elapsed| elapsed >= Duration::from_secs(u64::from(ttl)))
        .unwrap_or(false)
}

fn remaining_ttl(now: Instant, meta: &Meta, ttl: u32) -> u32 {
    let elapsed = now
        .checked_duration_since(meta.created_at)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    ttl.saturating_sub(u32::try_from(elapsed).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use dns_types::protocol::types::test_util::*;

    fn soa() -> SOA {
        SOA {
            mname: domain("ns1.example.com."),
            rname: domain("hostmaster.example.com."),
            serial: 1,
            refresh: 3600,
            retry: 600,
            expire: 604_800,
            minimum: 300,
        }
    }

    #[test]
    fn miss_on_empty_cache() {
        let mut cache = Cache::new();
        let now = Instant::now();
        assert_eq!(
            QueryResult::Miss,
            cache.query(now, &domain("example.com."), RecordType::A)
        );
        assert_eq!(1, cache.stats().miss);
    }

    #[test]
    fn insert_then_hit() {
        let mut cache = Cache::new();
        let now = Instant::now();
        let rr = a_record("example.com.", Ipv4Addr::new(1, 1, 1, 1));
        cache.insert_rr(now, &rr, Rank::AuthoritativeAnswer);

        match cache.query(now, &domain("example.com."), RecordType::A) {
            QueryResult::Hit(rrs) => assert_eq!(1, rrs.len()),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn expired_entry_is_a_drop_not_a_miss() {
        let mut cache = Cache::new();
        let now = Instant::now();
        let rr = a_record("example.com.", Ipv4Addr::new(1, 1, 1, 1));
        cache.insert_rr(now, &rr, Rank::AuthoritativeAnswer);

        let later = now + Duration::from_secs(301);
        assert_eq!(
            QueryResult::Miss,
            cache.query(later, &domain("example.com."), RecordType::A)
        );
        assert_eq!(1, cache.stats().drop);
    }

    #[test]
    fn higher_rank_suppresses_lower_rank_overwrite() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_nodata(
            now,
            domain("example.com."),
            RecordType::MX,
            soa(),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_nodata(
            now,
            domain("example.com."),
            RecordType::MX,
            soa(),
            Rank::Additional,
        );

        assert_eq!(
            QueryResult::NoData,
            cache.query(now, &domain("example.com."), RecordType::MX)
        );
    }

    #[test]
    fn nodomain_hit() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_nodomain(now, domain("absent.example.com."), soa(), Rank::AuthoritativeAnswer);

        assert_eq!(
            QueryResult::NoDomain,
            cache.query(now, &domain("absent.example.com."), RecordType::A)
        );
    }

    #[test]
    fn ttl_is_smoothed_to_one_week() {
        let mut cache = Cache::new();
        let now = Instant::now();
        let mut rr = a_record("example.com.", Ipv4Addr::new(1, 1, 1, 1));
        rr.ttl = MAX_TTL * 10;
        cache.insert_rr(now, &rr, Rank::AuthoritativeAnswer);

        let almost_a_week_later = now + Duration::from_secs(u64::from(MAX_TTL) - 1);
        match cache.query(almost_a_week_later, &domain("example.com."), RecordType::A) {
            QueryResult::Hit(rrs) => assert!(rrs[0].ttl <= MAX_TTL),
            other => panic!("expected Hit, got {other:?}"),
        }
    }
}
