//! Drives `dns_resolver::engine::answer` to completion, performing
//! the actual network I/O the pure engine asks for and feeding
//! scrubbed replies back into the cache.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tokio::time::timeout;

use dns_resolver::cache::{Cache, QueryResult, Rank};
use dns_resolver::engine::{self, Outcome};
use dns_resolver::scrubber::{self, Scrubbed};
use dns_types::protocol::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    RecursionLimit,
    NoRootHints,
    Timeout,
    DeadEnd,
}

/// Resolve `question` recursively, following delegations and
/// querying remote nameservers as needed. Bounded to 60s overall.
pub async fn resolve_recursive(cache: &mut Cache, question: &Question) -> Result<(Rcode, Vec<ResourceRecord>, Vec<ResourceRecord>), ResolutionError> {
    match timeout(Duration::from_secs(60), resolve_recursive_notimeout(cache, question)).await {
        Ok(res) => res,
        Err(_) => Err(ResolutionError::Timeout),
    }
}

async fn resolve_recursive_notimeout(
    cache: &mut Cache,
    question: &Question,
) -> Result<(Rcode, Vec<ResourceRecord>, Vec<ResourceRecord>), ResolutionError> {
    let mut rng = StdRng::from_entropy();

    loop {
        let now = Instant::now();
        let outcome = engine::answer(cache, now, &question.name, question.qtype).map_err(|err| match err {
            engine::Error::RecursionLimit => ResolutionError::RecursionLimit,
            engine::Error::NoRootHints => ResolutionError::NoRootHints,
        })?;

        match outcome {
            Outcome::Reply { rcode, answer, authority } => return Ok((rcode, answer, authority)),
            Outcome::Query {
                zone,
                qname,
                qtype,
                nameservers,
            } => {
                let Some(nsname) = engine::pick_nameserver(&mut rng, &nameservers).cloned() else {
                    return Err(ResolutionError::DeadEnd);
                };

                let Some(ip) = resolve_nameserver_address(cache, &nsname).await else {
                    // Can't resolve this nameserver's address; drop it
                    // from consideration and let the caller retry with
                    // whatever else is cached, by reporting a dead end
                    // for this branch.
                    return Err(ResolutionError::DeadEnd);
                };

                let subquestion = Question {
                    name: qname,
                    qtype,
                    qclass: QueryClass::Record(RecordClass::IN),
                };
                let request = Message {
                    header: Header {
                        id: rng.gen(),
                        is_response: false,
                        opcode: Opcode::Standard,
                        is_authoritative: false,
                        is_truncated: false,
                        recursion_desired: false,
                        recursion_available: false,
                        rcode: Rcode::NoError,
                    },
                    questions: vec![subquestion.clone()],
                    answers: Vec::new(),
                    authority: Vec::new(),
                    additional: Vec::new(),
                };

                match crate::net::query_nameserver(SocketAddr::new(ip, 53), &request).await {
                    Some(response) => {
                        let now = Instant::now();
                        for scrubbed in scrubber::scrub(
                            &zone,
                            &subquestion,
                            response.header.rcode,
                            &response.answers,
                            &response.authority,
                            response.header.is_authoritative,
                        ) {
                            apply_scrubbed(cache, now, scrubbed);
                        }
                        for rr in &response.additional {
                            cache.insert_rr(now, rr, Rank::Additional);
                        }
                    }
                    None => return Err(ResolutionError::DeadEnd),
                }
            }
        }
    }
}

/// Resolve a nameserver hostname to an address, trying the cache
/// first and then recursing (bounded, since `resolve_recursive`
/// already carries a 60s ceiling on the outer call).
async fn resolve_nameserver_address(cache: &mut Cache, name: &DomainName) -> Option<IpAddr> {
    let now = Instant::now();
    if let QueryResult::Hit(rrs) = cache.query(now, name, RecordType::A) {
        if let Some(ip) = rrs.iter().find_map(address_of) {
            return Some(ip);
        }
    }
    if let QueryResult::Hit(rrs) = cache.query(now, name, RecordType::AAAA) {
        if let Some(ip) = rrs.iter().find_map(address_of) {
            return Some(ip);
        }
    }

    let question = Question {
        name: name.clone(),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    };
    match Box::pin(resolve_recursive(cache, &question)).await {
        Ok((Rcode::NoError, answer, _)) => answer.iter().find_map(address_of),
        _ => None,
    }
}

fn address_of(rr: &ResourceRecord) -> Option<IpAddr> {
    match &rr.rtype_with_data {
        RecordTypeWithData::A { address } => Some(IpAddr::V4(*address)),
        RecordTypeWithData::AAAA { address } => Some(IpAddr::V6(*address)),
        _ => None,
    }
}

fn apply_scrubbed(cache: &mut Cache, now: Instant, scrubbed: Scrubbed) {
    match scrubbed {
        Scrubbed::Rr { rr, rank } => cache.insert_rr(now, &rr, rank),
        Scrubbed::Alias { name, ttl, target, rank } => cache.insert_alias(now, name, ttl, target, rank),
        Scrubbed::NoData { name, tag, soa, rank } => cache.insert_nodata(now, name, tag, soa, rank),
        Scrubbed::NoDomain { name, soa, rank } => cache.insert_nodomain(now, name, soa, rank),
        Scrubbed::ServFail { name, tag, rank } => cache.insert_servfail(now, name, tag, rank),
    }
}

/// Seed `cache` with the standard root hints so `answer` always has
/// somewhere to start walking down from.
pub fn seed_root_hints(cache: &mut Cache) {
    let now = Instant::now();
    let root = DomainName::root_domain();

    for (name, ip) in ROOT_HINTS {
        let ns = DomainName::from_dotted_string(name).expect("valid root hint name");
        cache.insert_rr(
            now,
            &ResourceRecord {
                name: root.clone(),
                rtype_with_data: RecordTypeWithData::NS { nsdname: ns.clone() },
                rclass: RecordClass::IN,
                ttl: 3_600_000,
            },
            Rank::ZoneFile,
        );
        cache.insert_rr(
            now,
            &ResourceRecord {
                name: ns,
                rtype_with_data: RecordTypeWithData::A {
                    address: ip.parse().expect("valid root hint address"),
                },
                rclass: RecordClass::IN,
                ttl: 3_600_000,
            },
            Rank::ZoneFile,
        );
    }
}

const ROOT_HINTS: &[(&str, &str)] = &[
    ("a.root-servers.net.", "198.41.0.4"),
    ("b.root-servers.net.", "199.9.14.201"),
    ("c.root-servers.net.", "192.33.4.12"),
    ("d.root-servers.net.", "199.7.91.13"),
    ("e.root-servers.net.", "192.203.230.10"),
    ("f.root-servers.net.", "192.5.5.241"),
    ("g.root-servers.net.", "192.112.36.4"),
    ("h.root-servers.net.", "198.97.190.53"),
    ("i.root-servers.net.", "192.36.148.17"),
    ("j.root-servers.net.", "192.58.128.30"),
    ("k.root-servers.net.", "193.0.14.129"),
    ("l.root-servers.net.", "199.7.83.42"),
    ("m.root-servers.net.", "202.12.27.33"),
];
