//! Turns a decoded DNS message into a response, dispatching on
//! opcode against the zone trie.

use dns_types::protocol::types::*;
use dns_types::zones::trie::{LookupFailure, Trie};
use dns_types::zones::types::{SOA, ZoneRecord};

use crate::auth::{Keys, Operation};

/// Tags a `Query` may ask for; anything else is `NotImp`.
const ALLOWED_QUERY_TAGS: &[RecordType] = &[
    RecordType::A,
    RecordType::NS,
    RecordType::CNAME,
    RecordType::SOA,
    RecordType::PTR,
    RecordType::MX,
    RecordType::TXT,
    RecordType::AAAA,
    RecordType::SRV,
    RecordType::CAA,
    RecordType::SSHFP,
    RecordType::TLSA,
    RecordType::DNSKEY,
];

/// A side effect the caller must carry out after `handle` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// A zone changed; compute and send NOTIFYs.
    ZoneChanged { zone: DomainName, soa: SOA },
    /// Record `peer` as a NOTIFY subscriber for `zone`'s SOA changes.
    Subscribe {
        zone: DomainName,
        peer_ip: std::net::IpAddr,
        peer_port: u16,
    },
    KeyChanged(crate::auth::KeyAction),
}

/// Process one decoded message against `trie`/`keys`.
///
/// Returns the reply to send (if any) and the side effects to apply.
/// Multi-message transcripts (AXFR) are represented as a `Vec` of
/// `ResourceRecord` to stream, rather than a single `Message`, since
/// wire framing is an external concern.
pub fn handle(
    trie: &mut Trie,
    keys: &mut Keys,
    key_name: Option<&DomainName>,
    over_tcp: bool,
    peer_ip: std::net::IpAddr,
    peer_port: u16,
    msg: &Message,
) -> (Option<Message>, Vec<ResourceRecord>, Vec<SideEffect>) {
    match msg.header.opcode {
        Opcode::Standard => {
            let reply = handle_query(trie, msg);
            (Some(reply), Vec::new(), Vec::new())
        }
        Opcode::Update => {
            let (reply, effects) = handle_update(trie, keys, key_name, msg);
            (Some(reply), Vec::new(), effects)
        }
        Opcode::Status if is_axfr(msg) => {
            let (reply, records, effects) =
                handle_axfr(trie, keys, key_name, over_tcp, peer_ip, peer_port, msg);
            (reply, records, effects)
        }
        Opcode::Notify => {
            let reply = make_basic_reply(msg, Rcode::NoError, true);
            (Some(reply), Vec::new(), Vec::new())
        }
        _ => (Some(make_basic_reply(msg, Rcode::NotImplemented, false)), Vec::new(), Vec::new()),
    }
}

fn is_axfr(msg: &Message) -> bool {
    msg.questions
        .first()
        .is_some_and(|q| q.qtype == QueryType::AXFR)
}

fn make_basic_reply(msg: &Message, rcode: Rcode, authoritative: bool) -> Message {
    let mut reply = msg.make_response();
    reply.header.rcode = rcode;
    reply.header.is_authoritative = authoritative;
    reply
}

fn handle_query(trie: &Trie, msg: &Message) -> Message {
    let mut reply = msg.make_response();
    reply.header.is_authoritative = true;

    let Some(question) = msg.questions.first() else {
        reply.header.rcode = Rcode::FormatError;
        return reply;
    };

    let tag = match question.qtype {
        QueryType::Wildcard => None,
        QueryType::Record(tag) if ALLOWED_QUERY_TAGS.contains(&tag) => Some(tag),
        _ => {
            reply.header.rcode = Rcode::Refused;
            return reply;
        }
    };

    let result = match tag {
        Some(tag) => trie.lookup(&question.name, tag).map(|(zrs, auth)| {
            (
                zrs.iter().map(|zr| zr.to_rr(&question.name)).collect::<Vec<_>>(),
                auth,
            )
        }),
        None => trie.lookup_any(&question.name).map(|(map, auth)| {
            (
                map.values()
                    .flatten()
                    .map(|zr| zr.to_rr(&question.name))
                    .collect::<Vec<_>>(),
                auth,
            )
        }),
    };

    match result {
        Ok((rrs, _auth)) => {
            reply.answers = rrs;
            add_glue(trie, &mut reply);
        }
        Err(LookupFailure::Delegation { apex, ttl, ns }) => {
            reply.header.is_authoritative = false;
            reply.authority = ns
                .iter()
                .map(|nsdname| ResourceRecord {
                    name: apex.clone(),
                    rtype_with_data: RecordTypeWithData::NS {
                        nsdname: nsdname.clone(),
                    },
                    rclass: RecordClass::IN,
                    ttl,
                })
                .collect();
            add_glue(trie, &mut reply);
        }
        Err(LookupFailure::EmptyNonTerminal { apex, soa }) => {
            reply.authority = vec![soa.to_rr(&apex)];
        }
        Err(LookupFailure::NotFound { apex, soa }) => {
            reply.header.rcode = Rcode::NameError;
            reply.authority = vec![soa.to_rr(&apex)];
        }
        Err(LookupFailure::NotAuthoritative) => {
            reply.header.rcode = Rcode::Refused;
        }
    }

    reply
}

/// Populate the additional section with A/AAAA glue for any
/// in-bailiwick name referenced by the answer or authority sections.
fn add_glue(trie: &Trie, reply: &mut Message) {
    let mut targets = Vec::new();
    for rr in reply.answers.iter().chain(reply.authority.iter()) {
        match &rr.rtype_with_data {
            RecordTypeWithData::NS { nsdname } => targets.push(nsdname.clone()),
            RecordTypeWithData::MX { exchange, .. } => targets.push(exchange.clone()),
            RecordTypeWithData::SRV { target, .. } => targets.push(target.clone()),
            _ => {}
        }
    }

    for target in targets {
        for tag in [RecordType::A, RecordType::AAAA] {
            if let Ok((zrs, _)) = trie.lookup(&target, tag) {
                for zr in zrs {
                    reply.additional.push(zr.to_rr(&target));
                }
            }
        }
    }
}

fn handle_update(
    trie: &mut Trie,
    keys: &Keys,
    key_name: Option<&DomainName>,
    msg: &Message,
) -> (Message, Vec<SideEffect>) {
    let mut reply = msg.make_response();
    reply.header.is_authoritative = true;

    let Some(zone_q) = msg.questions.first() else {
        reply.header.rcode = Rcode::FormatError;
        return (reply, Vec::new());
    };
    let zone = zone_q.name.clone();

    let authorised = key_name.is_some_and(|k| {
        keys.authorise(k, &zone, Operation::Update) || keys.authorise(k, &zone, Operation::KeyManagement)
    });
    if !authorised {
        reply.header.rcode = Rcode::Refused;
        return (reply, Vec::new());
    }

    for rr in msg.answers.iter().chain(msg.authority.iter()) {
        if !(rr.name == zone || rr.name.is_subdomain_of(&zone)) {
            reply.header.rcode = Rcode::NotZone;
            return (reply, Vec::new());
        }
    }

    for rr in &msg.answers {
        if let Err(rcode) = check_prereq(trie, rr) {
            reply.header.rcode = rcode;
            return (reply, Vec::new());
        }
    }

    let old_soa = trie.entries(&zone).ok().map(|(soa, _)| soa);

    let mut shadow = trie.clone();
    for rr in &msg.authority {
        apply_update(&mut shadow, rr);
    }

    if let Err(_err) = shadow.check() {
        reply.header.rcode = Rcode::FormatError;
        return (reply, Vec::new());
    }

    if let (Some(old), Ok((new_soa, _))) = (&old_soa, shadow.entries(&zone)) {
        if !serial_gt(new_soa.serial, old.serial) {
            let mut bumped = new_soa;
            bumped.serial = bumped.serial.wrapping_add(1);
            shadow.insert_soa(&zone, bumped);
        }
    }

    *trie = shadow;

    let mut effects = Vec::new();
    if let Ok((soa, _)) = trie.entries(&zone) {
        effects.push(SideEffect::ZoneChanged { zone, soa });
    }

    (reply, effects)
}

/// RFC 1982 serial number comparison: is `a` strictly newer than `b`?
fn serial_gt(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) < (1 << 31))
}

fn check_prereq(trie: &Trie, rr: &ResourceRecord) -> Result<(), Rcode> {
    let class: u16 = rr.rclass.into();
    match class {
        255 if rr.ttl == 0 => {
            // NameInUse / Exists
            let tag = rr.rtype_with_data.rtype();
            let ok = if u16::from(tag) == 255 {
                trie.lookup_any(&rr.name).is_ok()
            } else {
                trie.lookup(&rr.name, tag).is_ok()
            };
            if ok {
                Ok(())
            } else {
                Err(Rcode::NXRRSet)
            }
        }
        254 => {
            // NotNameInUse / NotExists
            let tag = rr.rtype_with_data.rtype();
            let absent = if u16::from(tag) == 255 {
                trie.lookup_any(&rr.name).is_err()
            } else {
                trie.lookup(&rr.name, tag).is_err()
            };
            if absent {
                Ok(())
            } else {
                Err(Rcode::YXRRSet)
            }
        }
        _ => {
            // ExistsData(name, tag, exact)
            match trie.lookup(&rr.name, rr.rtype_with_data.rtype()) {
                Ok((zrs, _)) if zrs.iter().any(|zr| zr.rtype_with_data == rr.rtype_with_data) => Ok(()),
                _ => Err(Rcode::NXRRSet),
            }
        }
    }
}

fn apply_update(trie: &mut Trie, rr: &ResourceRecord) {
    let class: u16 = rr.rclass.into();
    let tag = rr.rtype_with_data.rtype();

    match class {
        255 => {
            // Remove(name, tag) / Remove(name, ANY)
            if u16::from(tag) == 255 {
                trie.remove_all(&rr.name);
            } else {
                trie.remove(&rr.name, tag);
            }
        }
        254 => {
            // RemoveSingle(name, tag, value)
            trie.remove_value(&rr.name, tag, &rr.rtype_with_data);
        }
        _ => {
            let zr = ZoneRecord {
                rtype_with_data: rr.rtype_with_data.clone(),
                ttl: rr.ttl,
            };
            trie.insert(&rr.name, tag, zr);
        }
    }
}

fn handle_axfr(
    trie: &Trie,
    keys: &Keys,
    key_name: Option<&DomainName>,
    over_tcp: bool,
    peer_ip: std::net::IpAddr,
    peer_port: u16,
    msg: &Message,
) -> (Option<Message>, Vec<ResourceRecord>, Vec<SideEffect>) {
    if !over_tcp {
        return (Some(make_basic_reply(msg, Rcode::Refused, true)), Vec::new(), Vec::new());
    }

    let Some(question) = msg.questions.first() else {
        return (Some(make_basic_reply(msg, Rcode::FormatError, true)), Vec::new(), Vec::new());
    };
    let zone = question.name.clone();

    let authorised = key_name.is_some_and(|k| {
        keys.authorise(k, &zone, Operation::Transfer) || keys.authorise(k, &zone, Operation::KeyManagement)
    });
    if !authorised {
        return (Some(make_basic_reply(msg, Rcode::Refused, true)), Vec::new(), Vec::new());
    }

    let Ok((soa, map)) = trie.entries(&zone) else {
        return (Some(make_basic_reply(msg, Rcode::NameError, true)), Vec::new(), Vec::new());
    };

    let mut records = vec![soa.to_rr(&zone)];
    for (name, tags) in &map {
        for zrs in tags.values() {
            for zr in zrs {
                records.push(zr.to_rr(name));
            }
        }
    }
    records.push(soa.to_rr(&zone));

    let mut effects = Vec::new();
    if key_name.is_some() {
        effects.push(SideEffect::Subscribe {
            zone,
            peer_ip,
            peer_port,
        });
    }

    (None, records, effects)
}
