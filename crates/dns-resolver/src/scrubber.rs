//! Classifies a received DNS answer into cache-insertable entries.
//!
//! A reply from an upstream nameserver is not trusted as-is: every
//! RRset is checked for bailiwick before it is allowed to update the
//! cache, and a missing or malformed authority section is patched
//! with a synthetic "invalid SOA" so that a negative answer still
//! gets *some* negative-caching TTL.

use dns_types::protocol::types::*;
use dns_types::zones::types::SOA;

use crate::cache::Rank;

/// The synthetic SOA substituted in when a server returns a negative
/// answer without a usable SOA in the authority section.
fn invalid_soa(name: &DomainName) -> SOA {
    SOA {
        mname: make_invalid(name, "ns"),
        rname: make_invalid(name, "hostmaster"),
        serial: 1,
        refresh: 16384,
        retry: 2048,
        expire: 1_048_576,
        minimum: 300,
    }
}

fn make_invalid(name: &DomainName, label: &str) -> DomainName {
    DomainName::from_dotted_string(&format!("{label}.invalid.{}", name.to_dotted_string()))
        .expect("valid name")
}

/// A single scrubbed, cache-ready fact extracted from a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scrubbed {
    Rr { rr: ResourceRecord, rank: Rank },
    Alias { name: DomainName, ttl: u32, target: DomainName, rank: Rank },
    NoData { name: DomainName, tag: RecordType, soa: SOA, rank: Rank },
    NoDomain { name: DomainName, soa: SOA, rank: Rank },
    ServFail { name: DomainName, tag: RecordType, rank: Rank },
}

/// `name` is in the bailiwick of `zone` if it is equal to, or a
/// subdomain of, `zone`.
pub fn in_bailiwick(zone: &DomainName, name: &DomainName) -> bool {
    name == zone || name.is_subdomain_of(zone)
}

/// Find the first usable SOA in `authority` for `zone`, or invent one.
fn find_soa(zone: &DomainName, authority: &[ResourceRecord]) -> SOA {
    for rr in authority {
        if let RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } = &rr.rtype_with_data
        {
            if in_bailiwick(zone, &rr.name) {
                return SOA {
                    mname: mname.clone(),
                    rname: rname.clone(),
                    serial: *serial,
                    refresh: *refresh,
                    retry: *retry,
                    expire: *expire,
                    minimum: *minimum,
                };
            }
        }
    }
    invalid_soa(zone)
}

/// Scrub a reply to `question`, sent from authority zone `zone`
/// (the deepest NS delegation the resolver followed to reach the
/// server that produced this reply), keeping only in-bailiwick data
/// and classifying it for insertion into the cache.
pub fn scrub(
    zone: &DomainName,
    question: &Question,
    rcode: Rcode,
    answer: &[ResourceRecord],
    authority: &[ResourceRecord],
    is_authoritative: bool,
) -> Vec<Scrubbed> {
    let rank = if is_authoritative {
        Rank::AuthoritativeAnswer
    } else {
        Rank::NonAuthoritativeAnswer
    };

    let mut out = Vec::new();

    match rcode {
        Rcode::NameError => {
            let soa = find_soa(zone, authority);
            out.push(Scrubbed::NoDomain {
                name: question.name.clone(),
                soa,
                rank,
            });
            return out;
        }
        Rcode::NoError => {}
        Rcode::ServerFailure => {
            out.push(Scrubbed::ServFail {
                name: question.name.clone(),
                tag: RecordType::CNAME,
                rank,
            });
            return out;
        }
        _ => return out,
    }

    let mut cname_target: Option<(DomainName, u32)> = None;
    let mut answered_tag = false;

    for rr in answer {
        if !in_bailiwick(zone, &rr.name) {
            continue;
        }
        if rr.rtype_with_data.rtype() == RecordType::CNAME && rr.name == question.name {
            if let RecordTypeWithData::CNAME { cname } = &rr.rtype_with_data {
                cname_target = Some((cname.clone(), rr.ttl));
            }
        }
        if rr.rtype_with_data.matches(question.qtype) {
            answered_tag = true;
        }
        out.push(Scrubbed::Rr { rr: rr.clone(), rank });
    }

    if let Some((target, ttl)) = cname_target {
        out.push(Scrubbed::Alias {
            name: question.name.clone(),
            ttl,
            target,
            rank,
        });
    } else if !answered_tag {
        if let QueryType::Record(tag) = question.qtype {
            let soa = find_soa(zone, authority);
            out.push(Scrubbed::NoData {
                name: question.name.clone(),
                tag,
                soa,
                rank,
            });
        }
    }

    for rr in authority {
        if in_bailiwick(zone, &rr.name) && rr.rtype_with_data.rtype() == RecordType::NS {
            out.push(Scrubbed::Rr {
                rr: rr.clone(),
                rank: Rank::NonAuthoritativeAnswer,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use dns_types::protocol::types::test_util::*;

    fn question(name: &str, qtype: QueryType) -> Question {
        Question {
            name: domain(name),
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    fn soa_rr() -> ResourceRecord {
        ResourceRecord {
            name: domain("example.com."),
            rtype_with_data: RecordTypeWithData::SOA {
                mname: domain("ns1.example.com."),
                rname: domain("hostmaster.example.com."),
                serial: 1,
                refresh: 3600,
                retry: 600,
                expire: 604_800,
                minimum: 300,
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    #[test]
    fn nxdomain_uses_authority_soa_when_present() {
        let zone = domain("example.com.");
        let q = question("missing.example.com.", QueryType::Record(RecordType::A));
        let authority = vec![soa_rr()];

        let result = scrub(&zone, &q, Rcode::NameError, &[], &authority, true);
        match &result[0] {
            Scrubbed::NoDomain { soa, .. } => assert_eq!(1, soa.serial),
            other => panic!("expected NoDomain, got {other:?}"),
        }
    }

    #[test]
    fn nxdomain_without_soa_synthesises_invalid_soa() {
        let zone = domain("example.com.");
        let q = question("missing.example.com.", QueryType::Record(RecordType::A));

        let result = scrub(&zone, &q, Rcode::NameError, &[], &[], true);
        match &result[0] {
            Scrubbed::NoDomain { soa, .. } => {
                assert_eq!(domain("ns.invalid.example.com."), soa.mname);
                assert_eq!(1, soa.serial);
            }
            other => panic!("expected NoDomain, got {other:?}"),
        }
    }

    #[test]
    fn out_of_bailiwick_records_are_dropped() {
        let zone = domain("example.com.");
        let q = question("www.example.com.", QueryType::Record(RecordType::A));
        let answer = vec![
            a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1)),
            a_record("attacker.evil.com.", Ipv4Addr::new(6, 6, 6, 6)),
        ];

        let result = scrub(&zone, &q, Rcode::NoError, &answer, &[], true);
        assert_eq!(1, result.len());
    }

    #[test]
    fn cname_chain_is_recorded_as_alias() {
        let zone = domain("example.com.");
        let q = question("www.example.com.", QueryType::Record(RecordType::A));
        let answer = vec![cname_record("www.example.com.", "target.example.com.")];

        let result = scrub(&zone, &q, Rcode::NoError, &answer, &[], true);
        assert!(result
            .iter()
            .any(|s| matches!(s, Scrubbed::Alias { target, .. } if *target == domain("target.example.com."))));
    }

    #[test]
    fn servfail_is_recorded_under_cname_tag() {
        let zone = domain("example.com.");
        let q = question("www.example.com.", QueryType::Record(RecordType::A));

        let result = scrub(&zone, &q, Rcode::ServerFailure, &[], &[], true);
        assert_eq!(1, result.len());
        match &result[0] {
            Scrubbed::ServFail { name, tag, .. } => {
                assert_eq!(domain("www.example.com."), *name);
                assert_eq!(RecordType::CNAME, *tag);
            }
            other => panic!("expected ServFail, got {other:?}"),
        }
    }
}
