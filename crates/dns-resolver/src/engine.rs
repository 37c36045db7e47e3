//! The resolver engine: given a question, either produce a reply
//! directly from the cache or ask the caller to go and query a
//! specific nameserver next.
//!
//! This is a pure function of `(cache, question, now)`: it never
//! performs I/O itself. The caller drives a loop, feeding `Query`
//! outputs from one call back into the next `insert`/`answer` round
//! after actually sending the packet.

use std::time::Instant;

use rand::Rng;

use dns_types::protocol::types::*;

use crate::cache::{Cache, QueryResult, Rank};

/// Maximum number of CNAMEs followed before giving up, to protect
/// against a malicious or misconfigured server returning an infinite
/// chain.
pub const RECURSION_LIMIT: usize = 32;

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A complete answer: return these records to the original
    /// requester.
    Reply {
        rcode: Rcode,
        answer: Vec<ResourceRecord>,
        authority: Vec<ResourceRecord>,
    },
    /// The cache cannot answer `qname`/`qtype`; send a query to one
    /// of `nameservers` for `zone` and call `answer` again once a
    /// reply (or timeout) has been scrubbed into the cache.
    Query {
        zone: DomainName,
        qname: DomainName,
        qtype: QueryType,
        nameservers: Vec<DomainName>,
    },
}

/// Errors that mean no outcome at all could be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    RecursionLimit,
    /// There is no nameserver data in the cache at all; the caller
    /// must prime it with the root hints before calling `answer`.
    NoRootHints,
}

/// Resolve `name`/`qtype` using whatever is in `cache`, following
/// CNAMEs and walking down delegations as far as cached data allows.
///
/// A CNAME chain that revisits a name it has already followed is a
/// cycle, not progress: it terminates the walk with a `NoError` reply
/// carrying whatever CNAMEs were collected so far, rather than an
/// error.
///
/// # Errors
///
/// If the chain is still growing after `RECURSION_LIMIT` steps without
/// repeating a name, or if the cache has no usable nameserver data at
/// all.
pub fn answer(
    cache: &mut Cache,
    now: Instant,
    name: &DomainName,
    qtype: QueryType,
) -> Result<Outcome, Error> {
    let mut current = name.clone();
    let mut answer_rrs = Vec::new();
    let mut visited = std::collections::HashSet::new();

    for _ in 0..RECURSION_LIMIT {
        if !visited.insert(current.clone()) {
            return Ok(Outcome::Reply {
                rcode: Rcode::NoError,
                answer: answer_rrs,
                authority: Vec::new(),
            });
        }

        let tag = match qtype {
            QueryType::Record(tag) => tag,
            QueryType::Wildcard => RecordType::CNAME,
            _ => RecordType::CNAME,
        };

        if let QueryType::Record(RecordType::SRV) = qtype {
            if let Some(outcome) = srv_shortcut(cache, now, &current) {
                return Ok(outcome);
            }
        }

        match cache.query(now, &current, tag) {
            QueryResult::Hit(rrs) => {
                answer_rrs.extend(rrs);
                return Ok(Outcome::Reply {
                    rcode: Rcode::NoError,
                    answer: answer_rrs,
                    authority: Vec::new(),
                });
            }
            QueryResult::Alias(target) => {
                if let QueryResult::Hit(mut crrs) = cache.query(now, &current, RecordType::CNAME) {
                    answer_rrs.append(&mut crrs);
                }
                current = target;
                continue;
            }
            QueryResult::NoDomain => {
                return Ok(Outcome::Reply {
                    rcode: Rcode::NameError,
                    answer: answer_rrs,
                    authority: Vec::new(),
                });
            }
            QueryResult::NoData => {
                return Ok(Outcome::Reply {
                    rcode: Rcode::NoError,
                    answer: answer_rrs,
                    authority: Vec::new(),
                });
            }
            QueryResult::ServFail => {
                return Ok(Outcome::Reply {
                    rcode: Rcode::ServerFailure,
                    answer: answer_rrs,
                    authority: Vec::new(),
                });
            }
            QueryResult::Miss => {
                let (zone, nameservers) = find_nearest_ns(cache, now, &current)?;
                return Ok(Outcome::Query {
                    zone,
                    qname: current,
                    qtype,
                    nameservers,
                });
            }
        }
    }

    Err(Error::RecursionLimit)
}

/// Handle an `_service._proto.owner` SRV shortcut: if SRV data for
/// `name` is already cached, resolve straight to the target
/// addresses instead of making the caller chase a separate A/AAAA
/// lookup.
fn srv_shortcut(cache: &mut Cache, now: Instant, name: &DomainName) -> Option<Outcome> {
    if let QueryResult::Hit(srv_rrs) = cache.query(now, name, RecordType::SRV) {
        let mut out = srv_rrs.clone();
        for rr in &srv_rrs {
            if let RecordTypeWithData::SRV { target, .. } = &rr.rtype_with_data {
                if let QueryResult::Hit(mut a) = cache.query(now, target, RecordType::A) {
                    out.append(&mut a);
                }
                if let QueryResult::Hit(mut aaaa) = cache.query(now, target, RecordType::AAAA) {
                    out.append(&mut aaaa);
                }
            }
        }
        return Some(Outcome::Reply {
            rcode: Rcode::NoError,
            answer: out,
            authority: Vec::new(),
        });
    }
    None
}

/// Find the nameservers for the zone most closely enclosing `name`
/// that the cache has NS data for, walking up from `name` towards
/// the root.
///
/// # Errors
///
/// If there is no NS data cached anywhere on the path to the root.
fn find_nearest_ns(
    cache: &mut Cache,
    now: Instant,
    name: &DomainName,
) -> Result<(DomainName, Vec<DomainName>), Error> {
    let labels = &name.labels;

    for depth in (0..=labels.len()).rev() {
        let start = labels.len() - depth;
        let candidate = DomainName::from_labels(labels[start..].to_vec()).expect("valid suffix");

        if let QueryResult::Hit(ns_rrs) = cache.query(now, &candidate, RecordType::NS) {
            let hostnames = ns_rrs
                .iter()
                .filter_map(|rr| match &rr.rtype_with_data {
                    RecordTypeWithData::NS { nsdname } => Some(nsdname.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>();
            if !hostnames.is_empty() {
                return Ok((candidate, hostnames));
            }
        }
    }

    Err(Error::NoRootHints)
}

/// Pick one nameserver address at random from a set of candidates,
/// for sending the next outgoing query to. The caller supplies the
/// RNG so that query dispatch stays deterministic under test.
pub fn pick_nameserver<'a, R: Rng>(rng: &mut R, nameservers: &'a [DomainName]) -> Option<&'a DomainName> {
    if nameservers.is_empty() {
        None
    } else {
        let idx = rng.gen_range(0..nameservers.len());
        nameservers.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use dns_types::protocol::types::test_util::*;

    #[test]
    fn hit_returns_reply_directly() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_rr(
            now,
            &a_record("example.com.", Ipv4Addr::new(1, 1, 1, 1)),
            Rank::AuthoritativeAnswer,
        );

        match answer(&mut cache, now, &domain("example.com."), QueryType::Record(RecordType::A)) {
            Ok(Outcome::Reply { rcode, answer, .. }) => {
                assert_eq!(Rcode::NoError, rcode);
                assert_eq!(1, answer.len());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn miss_asks_nearest_cached_nameserver() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_rr(
            now,
            &ns_record("com.", "ns1.com."),
            Rank::AuthoritativeAnswer,
        );

        match answer(
            &mut cache,
            now,
            &domain("example.com."),
            QueryType::Record(RecordType::A),
        ) {
            Ok(Outcome::Query { zone, nameservers, .. }) => {
                assert_eq!(domain("com."), zone);
                assert_eq!(vec![domain("ns1.com.")], nameservers);
            }
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn no_root_hints_is_an_error() {
        let mut cache = Cache::new();
        let now = Instant::now();
        assert_eq!(
            Err(Error::NoRootHints),
            answer(&mut cache, now, &domain("example.com."), QueryType::Record(RecordType::A))
                .map(|_| ())
                .map_err(|e| e)
        );
    }

    #[test]
    fn cname_is_followed_and_both_records_included() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_alias(
            now,
            domain("www.example.com."),
            300,
            domain("target.example.com."),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_rr(
            now,
            &cname_record("www.example.com.", "target.example.com."),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_rr(
            now,
            &a_record("target.example.com.", Ipv4Addr::new(9, 9, 9, 9)),
            Rank::AuthoritativeAnswer,
        );

        match answer(
            &mut cache,
            now,
            &domain("www.example.com."),
            QueryType::Record(RecordType::A),
        ) {
            Ok(Outcome::Reply { answer, .. }) => assert_eq!(2, answer.len()),
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[test]
    fn cname_cycle_terminates_with_noerror() {
        let mut cache = Cache::new();
        let now = Instant::now();
        cache.insert_rr(
            now,
            &cname_record("a.example.com.", "b.example.com."),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_alias(
            now,
            domain("a.example.com."),
            300,
            domain("b.example.com."),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_rr(
            now,
            &cname_record("b.example.com.", "a.example.com."),
            Rank::AuthoritativeAnswer,
        );
        cache.insert_alias(
            now,
            domain("b.example.com."),
            300,
            domain("a.example.com."),
            Rank::AuthoritativeAnswer,
        );

        match answer(
            &mut cache,
            now,
            &domain("a.example.com."),
            QueryType::Record(RecordType::A),
        ) {
            Ok(Outcome::Reply { rcode, authority, .. }) => {
                assert_eq!(Rcode::NoError, rcode);
                assert!(authority.is_empty());
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }
}
