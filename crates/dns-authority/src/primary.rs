//! NOTIFY fan-out and retransmission for a primary server.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dns_types::protocol::types::*;
use dns_types::zones::trie::Trie;
use dns_types::zones::types::SOA;

use crate::auth::Keys;

/// Delays, from the previous send, at which a NOTIFY is retried.
pub const RETRANSMIT_SCHEDULE: &[u64] = &[5, 12, 25, 40, 60];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct Pending {
    zone: DomainName,
    soa: SOA,
    peer: Peer,
    query_id: u16,
    last_sent: Instant,
    attempt: usize,
}

/// State the primary carries across timer ticks: the TCP SOA
/// subscriber list and the queue of outstanding NOTIFYs.
#[derive(Debug, Clone, Default)]
pub struct PrimaryState {
    subscribers: Vec<(DomainName, Peer)>,
    pending: Vec<Pending>,
}

impl PrimaryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, zone: DomainName, peer: Peer) {
        if !self.subscribers.iter().any(|(z, p)| z == &zone && p == &peer) {
            self.subscribers.push((zone, peer));
        }
    }

    /// Compute the peer set for `zone` and enqueue a NOTIFY to each,
    /// using `now` as the first send time and `query_id` to number
    /// the outgoing packets (caller supplies randomness).
    pub fn notify<R: rand::Rng>(
        &mut self,
        trie: &Trie,
        keys: &Keys,
        rng: &mut R,
        now: Instant,
        zone: DomainName,
        soa: SOA,
        own_ns: &DomainName,
    ) {
        let mut peers = Vec::new();

        if let Ok((zrs, _)) = trie.lookup(&zone, RecordType::NS) {
            for zr in zrs {
                if let RecordTypeWithData::NS { nsdname } = &zr.rtype_with_data {
                    if nsdname == own_ns {
                        continue;
                    }
                    for tag in [RecordType::A, RecordType::AAAA] {
                        if let Ok((addrs, _)) = trie.lookup(nsdname, tag) {
                            for a in addrs {
                                if let Some(ip) = addr_of(&a.rtype_with_data) {
                                    peers.push(Peer { ip, port: 53 });
                                }
                            }
                        }
                    }
                }
            }
        }

        for (ip, port) in keys.secondaries(&zone) {
            peers.push(Peer {
                ip,
                port: port.unwrap_or(53),
            });
        }

        for (z, peer) in &self.subscribers {
            if z == &zone {
                peers.push(peer.clone());
            }
        }

        peers.sort_by_key(|p| (p.ip, p.port));
        peers.dedup();

        for peer in peers {
            self.pending.push(Pending {
                zone: zone.clone(),
                soa: soa.clone(),
                peer,
                query_id: rng.gen(),
                last_sent: now,
                attempt: 0,
            });
        }
    }

    /// A NOTIFY response matching `(peer_ip, query_id)` arrived;
    /// remove the corresponding pending entry.
    pub fn ack(&mut self, peer_ip: IpAddr, query_id: u16) {
        self.pending.retain(|p| !(p.peer.ip == peer_ip && p.query_id == query_id));
    }

    /// Return the NOTIFY packets due to be (re)sent at `now`, and
    /// advance their retry counters. Entries that have exhausted the
    /// schedule are dropped.
    pub fn timer(&mut self, now: Instant) -> Vec<(Peer, Message)> {
        let mut out = Vec::new();
        let mut keep = Vec::new();

        for mut p in std::mem::take(&mut self.pending) {
            let Some(&delay) = RETRANSMIT_SCHEDULE.get(p.attempt) else {
                tracing::warn!(zone = %p.zone, peer = ?p.peer, "giving up on NOTIFY after exhausting retransmit schedule");
                continue;
            };
            if now.saturating_duration_since(p.last_sent) >= Duration::from_secs(delay) {
                out.push((p.peer.clone(), notify_message(p.query_id, &p.zone, &p.soa)));
                p.last_sent = now;
                p.attempt += 1;
            }
            keep.push(p);
        }

        self.pending = keep;
        out
    }
}

fn addr_of(rd: &RecordTypeWithData) -> Option<IpAddr> {
    match rd {
        RecordTypeWithData::A { address } => Some(IpAddr::V4(*address)),
        RecordTypeWithData::AAAA { address } => Some(IpAddr::V6(*address)),
        _ => None,
    }
}

fn notify_message(id: u16, zone: &DomainName, soa: &SOA) -> Message {
    Message {
        header: Header {
            id,
            is_response: false,
            opcode: Opcode::Notify,
            is_authoritative: true,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        },
        questions: vec![Question {
            name: zone.clone(),
            qtype: QueryType::Record(RecordType::SOA),
            qclass: QueryClass::Record(RecordClass::IN),
        }],
        answers: vec![soa.to_rr(zone)],
        authority: Vec::new(),
        additional: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;
    use rand::rngs::mock::StepRng;

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
    fn retransmit_schedule_is_followed_then_dropped() {
        let mut state = PrimaryState::new();
        let mut trie = Trie::new();
        trie.insert_soa(&domain("example.com."), soa());
        let keys = Keys::new();
        let mut rng = StepRng::new(0, 1);
        let start = Instant::now();

        state.subscribe(
            domain("example.com."),
            Peer {
                ip: "192.0.2.1".parse().unwrap(),
                port: 53,
            },
        );
        state.notify(&trie, &keys, &mut rng, start, domain("example.com."), soa(), &domain("ns0.example.com."));

        assert!(state.timer(start).is_empty());
        assert_eq!(1, state.timer(start + Duration::from_secs(5)).len());
        assert_eq!(1, state.timer(start + Duration::from_secs(5 + 12)).len());
        assert_eq!(1, state.timer(start + Duration::from_secs(5 + 12 + 25)).len());
        assert_eq!(1, state.timer(start + Duration::from_secs(5 + 12 + 25 + 40)).len());
        assert_eq!(1, state.timer(start + Duration::from_secs(5 + 12 + 25 + 40 + 60)).len());
        assert!(state.timer(start + Duration::from_secs(10_000)).is_empty());
    }

    #[test]
    fn ack_removes_pending_notify() {
        let mut state = PrimaryState::new();
        let trie = Trie::new();
        let keys = Keys::new();
        let mut rng = StepRng::new(42, 1);
        let start = Instant::now();

        state.subscribe(
            domain("example.com."),
            Peer {
                ip: "192.0.2.1".parse().unwrap(),
                port: 53,
            },
        );
        state.notify(&trie, &keys, &mut rng, start, domain("example.com."), soa(), &domain("ns0.example.com."));
        state.ack("192.0.2.1".parse().unwrap(), 42);

        assert!(state.timer(start + Duration::from_secs(5)).is_empty());
    }
}
