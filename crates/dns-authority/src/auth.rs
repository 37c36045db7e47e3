//! Key storage and authorization.
//!
//! A TSIG key name encodes both the zone it grants rights over and
//! the operation it grants, by embedding one of `_key-management`,
//! `_update`, or `_transfer` as a label: everything to the right of
//! that label (exclusive) is the zone name, everything to the left
//! is free-form (and, for transfer keys, encodes the primary/
//! secondary peer addresses).

use std::collections::HashMap;
use std::net::IpAddr;

use dns_types::protocol::types::*;

/// The three operations a key can be authorized for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Operation {
    Update,
    Transfer,
    KeyManagement,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Update => "_update",
            Operation::Transfer => "_transfer",
            Operation::KeyManagement => "_key-management",
        }
    }
}

/// A parsed key name: the operation it grants, the zone it grants
/// rights over, and anything to the left of the operation label.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ParsedKeyName {
    operation: Operation,
    zone: DomainName,
    prefix: Vec<Label>,
}

fn parse_key_name(name: &DomainName) -> Option<ParsedKeyName> {
    for (idx, label) in name.labels.iter().enumerate() {
        let text = String::from_utf8_lossy(label.octets()).to_lowercase();
        let operation = match text.as_str() {
            "_update" => Operation::Update,
            "_transfer" => Operation::Transfer,
            "_key-management" => Operation::KeyManagement,
            _ => continue,
        };
        let zone = DomainName::from_labels(name.labels[idx + 1..].to_vec())?;
        let prefix = name.labels[..idx].to_vec();
        return Some(ParsedKeyName {
            operation,
            zone,
            prefix,
        });
    }
    None
}

/// Actions emitted by `handle_update`, driving secondary bootstrap.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KeyAction {
    AddedKey(DomainName),
    RemovedKey(DomainName),
}

/// A single DNSKEY, keyed by name. Only one key is permitted per
/// name; a second insert at the same name makes lookups for that
/// name fail (with a warning logged), rather than picking one
/// arbitrarily.
#[derive(Debug, Clone, Default)]
pub struct Keys {
    by_name: HashMap<DomainName, Vec<RecordTypeWithData>>,
}

impl Keys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the single key at `name`.
    ///
    /// Returns `None` if there is no key, or if there is more than
    /// one (ambiguous).
    pub fn find_key(&self, name: &DomainName) -> Option<&RecordTypeWithData> {
        match self.by_name.get(name) {
            Some(keys) if keys.len() == 1 => keys.first(),
            Some(keys) if keys.len() > 1 => {
                tracing::warn!(%name, count = keys.len(), "multiple DNSKEYs for name, refusing to pick one");
                None
            }
            _ => None,
        }
    }

    /// Is `key_name` authorized for `op` on `zone` (or any ancestor
    /// of `zone`, if it holds `KeyManagement`)?
    pub fn authorise(&self, key_name: &DomainName, zone: &DomainName, op: Operation) -> bool {
        let Some(parsed) = parse_key_name(key_name) else {
            return false;
        };
        if self.find_key(key_name).is_none() {
            return false;
        }

        let in_scope = zone == &parsed.zone || zone.is_subdomain_of(&parsed.zone);
        if !in_scope {
            return false;
        }

        parsed.operation == op || parsed.operation == Operation::KeyManagement
    }

    /// Apply a DNSKEY add/remove to the keys trie.
    pub fn handle_update(&mut self, name: &DomainName, value: RecordTypeWithData, add: bool) -> KeyAction {
        let entries = self.by_name.entry(name.clone()).or_default();
        if add {
            if !entries.contains(&value) {
                entries.push(value);
            }
            KeyAction::AddedKey(name.clone())
        } else {
            entries.retain(|v| v != &value);
            if entries.is_empty() {
                self.by_name.remove(name);
            }
            KeyAction::RemovedKey(name.clone())
        }
    }

    /// Parse the `primaryip[_port].secondaryip[_port]._transfer.zone`
    /// shape out of every transfer key for `zone`, returning the
    /// primary-side addresses.
    pub fn primaries(&self, zone: &DomainName) -> Vec<(IpAddr, Option<u16>)> {
        self.transfer_peers(zone).into_iter().map(|(p, _)| p).collect()
    }

    /// As `primaries`, but the secondary-side addresses.
    pub fn secondaries(&self, zone: &DomainName) -> Vec<(IpAddr, Option<u16>)> {
        self.transfer_peers(zone).into_iter().map(|(_, s)| s).collect()
    }

    fn transfer_peers(
        &self,
        zone: &DomainName,
    ) -> Vec<((IpAddr, Option<u16>), (IpAddr, Option<u16>))> {
        let mut out = Vec::new();
        for name in self.by_name.keys() {
            let Some(parsed) = parse_key_name(name) else {
                continue;
            };
            if parsed.operation != Operation::Transfer || &parsed.zone != zone {
                continue;
            }
            if parsed.prefix.len() < 2 {
                continue;
            }
            let primary_text = String::from_utf8_lossy(parsed.prefix[0].octets()).to_string();
            let secondary_text = String::from_utf8_lossy(parsed.prefix[1].octets()).to_string();
            if let (Some(primary), Some(secondary)) =
                (parse_ip_port(&primary_text), parse_ip_port(&secondary_text))
            {
                out.push((primary, secondary));
            }
        }
        out
    }
}

/// Each label can only contain one component of a dotted name, so an
/// embedded IPv4/IPv6 address spells its dots as dashes (`192-0-2-1`
/// rather than `192.0.2.1`); an optional `_port` suffix follows.
fn parse_ip_port(text: &str) -> Option<(IpAddr, Option<u16>)> {
    let (ip_part, port) = match text.split_once('_') {
        Some((ip, port)) => (ip, Some(port.parse().ok()?)),
        None => (text, None),
    };
    let dotted = ip_part.replace('-', ".");
    Some((dotted.parse().ok()?, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;

    fn dnskey() -> RecordTypeWithData {
        RecordTypeWithData::DNSKEY {
            flags: 257,
            protocol: 3,
            algorithm: 8,
            public_key: bytes::Bytes::from_static(b"fake-key"),
        }
    }

    #[test]
    fn authorises_update_key_on_its_own_zone() {
        let mut keys = Keys::new();
        let key_name = domain("mykey._update.example.com.");
        keys.handle_update(&key_name, dnskey(), true);

        assert!(keys.authorise(&key_name, &domain("example.com."), Operation::Update));
        assert!(!keys.authorise(&key_name, &domain("example.com."), Operation::Transfer));
        assert!(!keys.authorise(&key_name, &domain("other.com."), Operation::Update));
    }

    #[test]
    fn key_management_authorises_everything_on_subzones() {
        let mut keys = Keys::new();
        let key_name = domain("mykey._key-management.example.com.");
        keys.handle_update(&key_name, dnskey(), true);

        assert!(keys.authorise(&key_name, &domain("sub.example.com."), Operation::Transfer));
    }

    #[test]
    fn ambiguous_key_name_is_refused() {
        let mut keys = Keys::new();
        let key_name = domain("mykey._update.example.com.");
        keys.handle_update(&key_name, dnskey(), true);
        keys.handle_update(
            &key_name,
            RecordTypeWithData::DNSKEY {
                flags: 256,
                protocol: 3,
                algorithm: 8,
                public_key: bytes::Bytes::from_static(b"other-key"),
            },
            true,
        );

        assert!(keys.find_key(&key_name).is_none());
    }

    #[test]
    fn transfer_peers_parse_ip_and_optional_port() {
        let mut keys = Keys::new();
        let key_name = domain("192-0-2-1_5353.192-0-2-2._transfer.example.com.");
        keys.handle_update(&key_name, dnskey(), true);

        let primaries = keys.primaries(&domain("example.com."));
        assert_eq!(1, primaries.len());
        assert_eq!(Some(5353), primaries[0].1);
    }
}
