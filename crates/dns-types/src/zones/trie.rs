//! The authoritative zone store: a radix tree keyed by reversed label
//! sequence, enforcing RFC 1034/1035 lookup semantics (delegation,
//! empty non-terminals, NXDOMAIN-with-SOA).
//!
//! This is the structure the authority engine mutates directly; it is
//! distinct from `Zone`/`Zones` (used for loading and serialising
//! zone files), though a whole `Zone` can be bulk-loaded into a
//! `Trie` with `Trie::insert_zone`.

use std::collections::HashMap;

use crate::protocol::types::*;
use crate::zones::types::{Zone, ZoneRecord, SOA};

/// The NS RRset of the nearest enclosing zone cut, used to populate
/// the authority section of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub apex: DomainName,
    pub soa: SOA,
}

/// Ways a lookup can fail to find an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    /// `name` lies below a zone cut not owned by this trie.
    Delegation {
        apex: DomainName,
        ttl: u32,
        ns: Vec<DomainName>,
    },
    /// `name` exists as an interior node but holds no RRset of any
    /// tag.
    EmptyNonTerminal { apex: DomainName, soa: SOA },
    /// `name` is absent entirely.
    NotFound { apex: DomainName, soa: SOA },
    /// No enclosing zone apex was found at all.
    NotAuthoritative,
}

pub type LookupResult<T> = Result<T, LookupFailure>;

/// Global invariant violations caught by `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// A node has NS records below an apex but does not itself carry
    /// a SOA and is not a genuine delegation (its parent zone has no
    /// SOA either, so no zone owns this data).
    NsWithoutEnclosingZone { name: DomainName },
    /// A name holds both a CNAME and some other RRset.
    CnameCoexistence { name: DomainName },
    /// A non-apex name carries an NS RRset but the trie has no SOA
    /// anywhere above it.
    DanglingDelegation { name: DomainName },
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CheckError::NsWithoutEnclosingZone { name } => {
                write!(f, "'{name}' has NS records but no enclosing zone")
            }
            CheckError::CnameCoexistence { name } => {
                write!(f, "'{name}' has a CNAME alongside other record types")
            }
            CheckError::DanglingDelegation { name } => {
                write!(f, "'{name}' delegates but is not under any zone")
            }
        }
    }
}

impl std::error::Error for CheckError {}

#[derive(Debug, Clone, Default)]
struct Node {
    /// `Some` iff this name is a zone apex.
    soa: Option<SOA>,
    rrs: HashMap<RecordType, Vec<ZoneRecord>>,
    children: HashMap<Label, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.soa.is_none() && self.rrs.is_empty() && self.children.is_empty()
    }

    fn ns_rrset(&self) -> Option<(u32, Vec<DomainName>)> {
        let zrs = self.rrs.get(&RecordType::NS)?;
        if zrs.is_empty() {
            return None;
        }
        let ttl = zrs.iter().map(|zr| zr.ttl).min().unwrap_or(0);
        let names = zrs
            .iter()
            .filter_map(|zr| match &zr.rtype_with_data {
                RecordTypeWithData::NS { nsdname } => Some(nsdname.clone()),
                _ => None,
            })
            .collect();
        Some((ttl, names))
    }
}

/// The authoritative zone store.
#[derive(Debug, Clone, Default)]
pub struct Trie {
    root: Node,
}

/// Domain names store their labels most-specific-first, ending in the
/// empty root label: `labels[len(labels)-1-k..]` is the name `k`
/// labels up from the root.
fn ancestor_at_depth(labels: &[Label], depth: usize) -> DomainName {
    let start = labels.len() - depth;
    DomainName::from_labels(labels[start..].to_vec()).expect("suffix of a valid name is valid")
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single RRset tag at `name`.
    ///
    /// # Errors
    ///
    /// See `LookupFailure`.
    pub fn lookup(
        &self,
        name: &DomainName,
        tag: RecordType,
    ) -> LookupResult<(Vec<ZoneRecord>, Authority)> {
        let (node, apex, soa) = self.walk(name, Some(tag))?;

        if let Some(zrs) = node.rrs.get(&tag) {
            if !zrs.is_empty() {
                return Ok((zrs.clone(), Authority { apex, soa }));
            }
        }

        if node.rrs.is_empty() && node.children.is_empty() && node.soa.is_none() {
            Err(LookupFailure::NotFound { apex, soa })
        } else {
            Err(LookupFailure::EmptyNonTerminal { apex, soa })
        }
    }

    /// Look up every RRset tag held at `name`.
    ///
    /// # Errors
    ///
    /// See `LookupFailure`.
    pub fn lookup_any(
        &self,
        name: &DomainName,
    ) -> LookupResult<(HashMap<RecordType, Vec<ZoneRecord>>, Authority)> {
        let (node, apex, soa) = self.walk(name, None)?;

        if node.rrs.is_empty() {
            if node.children.is_empty() && node.soa.is_none() {
                Err(LookupFailure::NotFound { apex, soa })
            } else {
                Err(LookupFailure::EmptyNonTerminal { apex, soa })
            }
        } else {
            Ok((node.rrs.clone(), Authority { apex, soa }))
        }
    }

    /// Walk from the root towards `name`, applying the delegation
    /// rule at every node (including the target, unless `bypass_tag`
    /// is `NS`). Returns the target node plus the nearest enclosing
    /// zone's apex and SOA.
    fn walk(
        &self,
        name: &DomainName,
        bypass_tag: Option<RecordType>,
    ) -> LookupResult<(&Node, DomainName, SOA)> {
        let labels = &name.labels;
        let mut node = &self.root;
        let mut enclosing: Option<(DomainName, SOA)> = self
            .root
            .soa
            .clone()
            .map(|soa| (DomainName::root_domain(), soa));

        for depth in 1..=labels.len() {
            let path_name = ancestor_at_depth(labels, depth);
            let is_target = depth == labels.len();

            if !is_target {
                if let Some((ttl, ns)) = node.ns_rrset() {
                    if node.soa.is_none() {
                        let apex = ancestor_at_depth(labels, depth - 1);
                        return Err(LookupFailure::Delegation { apex, ttl, ns });
                    }
                }
            }

            let label = &labels[labels.len() - depth];
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    if let Some(soa) = &node.soa {
                        enclosing = Some((path_name.clone(), soa.clone()));
                    }
                }
                None => {
                    return match enclosing {
                        Some((apex, soa)) => Err(LookupFailure::NotFound { apex, soa }),
                        None => Err(LookupFailure::NotAuthoritative),
                    };
                }
            }
        }

        if bypass_tag != Some(RecordType::NS) {
            if let Some((ttl, ns)) = node.ns_rrset() {
                if node.soa.is_none() {
                    let apex = ancestor_at_depth(labels, labels.len() - 1);
                    return Err(LookupFailure::Delegation { apex, ttl, ns });
                }
            }
        }

        match enclosing {
            Some((apex, soa)) => Ok((node, apex, soa)),
            None => Err(LookupFailure::NotAuthoritative),
        }
    }

    fn node_mut(&mut self, name: &DomainName) -> &mut Node {
        let mut node = &mut self.root;
        for depth in (0..name.labels.len()).rev() {
            let label = name.labels[depth].clone();
            node = node.children.entry(label).or_default();
        }
        node
    }

    fn node(&self, name: &DomainName) -> Option<&Node> {
        let mut node = &self.root;
        for depth in (0..name.labels.len()).rev() {
            node = node.children.get(&name.labels[depth])?;
        }
        Some(node)
    }

    /// Insert (union into) an RRset at `name`.
    pub fn insert(&mut self, name: &DomainName, tag: RecordType, value: ZoneRecord) {
        let node = self.node_mut(name);
        let entries = node.rrs.entry(tag).or_default();
        if !entries.iter().any(|e| e == &value) {
            entries.push(value);
        }
    }

    /// Mark `name` as a zone apex with the given SOA. Does not
    /// clear existing records at `name`.
    pub fn insert_soa(&mut self, name: &DomainName, soa: SOA) {
        self.node_mut(name).soa = Some(soa);
    }

    /// Remove the RRset for `tag` at `name`. Removing `SOA` removes
    /// the whole zone (equivalent to `remove_zone`).
    pub fn remove(&mut self, name: &DomainName, tag: RecordType) {
        if tag == RecordType::SOA {
            self.remove_zone(name);
            return;
        }
        if let Some(node) = self.find_mut(name) {
            node.rrs.remove(&tag);
        }
        self.prune(name);
    }

    /// Subtract a single value from the RRset for `tag` at `name`;
    /// if nothing is left, the RRset (and, if now empty, the node)
    /// is removed.
    pub fn remove_value(&mut self, name: &DomainName, tag: RecordType, value: &RecordTypeWithData) {
        if let Some(node) = self.find_mut(name) {
            if let Some(entries) = node.rrs.get_mut(&tag) {
                entries.retain(|zr| &zr.rtype_with_data != value);
                if entries.is_empty() {
                    node.rrs.remove(&tag);
                }
            }
        }
        self.prune(name);
    }

    /// Remove every RRset (but not the SOA marker) at `name`.
    pub fn remove_all(&mut self, name: &DomainName) {
        if let Some(node) = self.find_mut(name) {
            node.rrs.clear();
        }
        self.prune(name);
    }

    /// Erase the whole subtree rooted at `apex`, except for any
    /// re-rooted sub-zone (a descendant with its own SOA).
    pub fn remove_zone(&mut self, apex: &DomainName) {
        fn strip_subzones(node: &mut Node) {
            node.soa = None;
            node.rrs.clear();
            node.children.retain(|_, child| {
                if child.soa.is_some() {
                    true
                } else {
                    strip_subzones(child);
                    !child.is_empty()
                }
            });
        }

        if let Some(node) = self.find_mut(apex) {
            strip_subzones(node);
        }
        self.prune(apex);
    }

    fn find_mut(&mut self, name: &DomainName) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for depth in (0..name.labels.len()).rev() {
            node = node.children.get_mut(&name.labels[depth])?;
        }
        Some(node)
    }

    /// Drop now-empty nodes along the path to `name`, except the
    /// root.
    fn prune(&mut self, name: &DomainName) {
        fn go(node: &mut Node, labels: &[Label], depth: usize) -> bool {
            if depth == 0 {
                return node.is_empty();
            }
            let label = &labels[depth - 1];
            let should_remove = if let Some(child) = node.children.get_mut(label) {
                go(child, labels, depth - 1)
            } else {
                false
            };
            if should_remove {
                node.children.remove(label);
            }
            node.is_empty()
        }

        let labels = &name.labels;
        let len = labels.len();
        if len == 0 {
            return;
        }
        let _ = go(&mut self.root, labels, len);
    }

    /// Bulk-load a whole zone file's worth of records, rooted at its
    /// apex. Existing data under the apex which is not present in
    /// `zone` is left untouched; this is additive, matching the
    /// external zone-file-parser contract ("merged into the trie").
    pub fn insert_zone(&mut self, zone: &Zone) {
        if let Some(soa) = zone.get_soa() {
            self.insert_soa(zone.get_apex(), soa.clone());
        }
        for (name, zrs) in zone.all_records() {
            for zr in zrs {
                self.insert(name, zr.rtype_with_data.rtype(), zr.clone());
            }
        }
    }

    /// Yield the SOA and the full per-name record map for every name
    /// under `apex`, for zone transfer or serialisation.
    ///
    /// # Errors
    ///
    /// If `apex` is not a zone apex.
    pub fn entries(
        &self,
        apex: &DomainName,
    ) -> Result<(SOA, HashMap<DomainName, HashMap<RecordType, Vec<ZoneRecord>>>), LookupFailure>
    {
        let node = self.node(apex).ok_or(LookupFailure::NotAuthoritative)?;
        let soa = node.soa.clone().ok_or(LookupFailure::NotAuthoritative)?;

        let mut out = HashMap::new();
        fn walk(node: &Node, name: &DomainName, out: &mut HashMap<DomainName, HashMap<RecordType, Vec<ZoneRecord>>>) {
            if !node.rrs.is_empty() {
                out.insert(name.clone(), node.rrs.clone());
            }
            for (label, child) in &node.children {
                let mut labels = vec![label.clone()];
                labels.extend(name.labels.iter().cloned());
                let child_name = DomainName::from_labels(labels).expect("valid child name");
                // stop descending into re-rooted sub-zones
                if child.soa.is_none() {
                    walk(child, &child_name, out);
                } else {
                    out.insert(child_name, child.rrs.clone());
                }
            }
        }
        walk(node, apex, &mut out);

        Ok((soa, out))
    }

    /// Fold over every RRset of `tag` under `apex`, for zone
    /// serialisation.
    ///
    /// # Errors
    ///
    /// If `apex` is not a zone apex.
    pub fn fold<A, F>(&self, apex: &DomainName, tag: RecordType, mut f: F, init: A) -> Result<A, LookupFailure>
    where
        F: FnMut(A, &DomainName, &ZoneRecord) -> A,
    {
        let (_, entries) = self.entries(apex)?;
        let mut acc = init;
        for (name, map) in &entries {
            if let Some(zrs) = map.get(&tag) {
                for zr in zrs {
                    acc = f(acc, name, zr);
                }
            }
        }
        Ok(acc)
    }

    /// Check global invariants after a mutation (typically an
    /// UPDATE). Does not check anything about names outside any
    /// zone: those are simply invisible to lookups.
    ///
    /// # Errors
    ///
    /// See `CheckError`.
    pub fn check(&self) -> Result<(), CheckError> {
        fn go(node: &Node, name: &DomainName, under_zone: bool) -> Result<(), CheckError> {
            let under_zone = under_zone || node.soa.is_some();

            if node.rrs.contains_key(&RecordType::CNAME) && node.rrs.len() > 1 {
                return Err(CheckError::CnameCoexistence { name: name.clone() });
            }

            if node.soa.is_none() && node.rrs.contains_key(&RecordType::NS) && !under_zone {
                return Err(CheckError::DanglingDelegation { name: name.clone() });
            }

            for (label, child) in &node.children {
                let mut labels = vec![label.clone()];
                labels.extend(name.labels.iter().cloned());
                let child_name = DomainName::from_labels(labels).expect("valid child name");
                go(child, &child_name, under_zone)?;
            }

            Ok(())
        }

        go(&self.root, &DomainName::root_domain(), false)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    fn soa(minimum: u32) -> SOA {
        SOA {
            mname: domain("ns1.example.com."),
            rname: domain("hostmaster.example.com."),
            serial: 1,
            refresh: 3600,
            retry: 600,
            expire: 604_800,
            minimum,
        }
    }

    fn a_zr(addr: Ipv4Addr) -> ZoneRecord {
        ZoneRecord {
            rtype_with_data: RecordTypeWithData::A { address: addr },
            ttl: 300,
        }
    }

    fn ns_zr(target: &str) -> ZoneRecord {
        ZoneRecord {
            rtype_with_data: RecordTypeWithData::NS {
                nsdname: domain(target),
            },
            ttl: 300,
        }
    }

    #[test]
    fn s1_positive_lookup() {
        let mut trie = Trie::new();
        let apex = domain("example.com.");
        trie.insert_soa(&apex, soa(300));
        trie.insert(&apex, RecordType::NS, ns_zr("ns1.example.com."));
        trie.insert(
            &domain("ns1.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(192, 0, 2, 1)),
        );

        let (zrs, authority) = trie
            .lookup(&domain("ns1.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(vec![a_zr(Ipv4Addr::new(192, 0, 2, 1))], zrs);
        assert_eq!(apex, authority.apex);
    }

    #[test]
    fn s2_nxdomain() {
        let mut trie = Trie::new();
        let apex = domain("example.com.");
        trie.insert_soa(&apex, soa(300));

        match trie.lookup(&domain("absent.example.com."), RecordType::A) {
            Err(LookupFailure::NotFound { apex: got_apex, .. }) => assert_eq!(apex, got_apex),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn s3_delegation() {
        let mut trie = Trie::new();
        let apex = domain("example.com.");
        trie.insert_soa(&apex, soa(300));
        trie.insert(
            &domain("sub.example.com."),
            RecordType::NS,
            ns_zr("ns.sub.example.com."),
        );
        trie.insert(
            &domain("ns.sub.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(192, 0, 2, 53)),
        );

        match trie.lookup(&domain("host.sub.example.com."), RecordType::A) {
            Err(LookupFailure::Delegation { apex: got_apex, ns, .. }) => {
                assert_eq!(domain("sub.example.com."), got_apex);
                assert_eq!(vec![domain("ns.sub.example.com.")], ns);
            }
            other => panic!("expected Delegation, got {other:?}"),
        }

        // the delegation point itself, queried for something other
        // than NS, is also a referral
        match trie.lookup(&domain("sub.example.com."), RecordType::A) {
            Err(LookupFailure::Delegation { .. }) => {}
            other => panic!("expected Delegation, got {other:?}"),
        }

        // but querying NS there answers directly
        let (zrs, _) = trie
            .lookup(&domain("sub.example.com."), RecordType::NS)
            .unwrap();
        assert_eq!(vec![ns_zr("ns.sub.example.com.")], zrs);
    }

    #[test]
    fn empty_non_terminal() {
        let mut trie = Trie::new();
        let apex = domain("example.com.");
        trie.insert_soa(&apex, soa(300));
        trie.insert(
            &domain("a.b.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(1, 1, 1, 1)),
        );

        match trie.lookup(&domain("b.example.com."), RecordType::A) {
            Err(LookupFailure::EmptyNonTerminal { apex: got_apex, .. }) => {
                assert_eq!(apex, got_apex);
            }
            other => panic!("expected EmptyNonTerminal, got {other:?}"),
        }
    }

    #[test]
    fn not_authoritative_with_no_zones() {
        let trie = Trie::new();
        assert_eq!(
            Err(LookupFailure::NotAuthoritative),
            trie.lookup(&domain("example.com."), RecordType::A)
        );
    }

    #[test]
    fn remove_zone_keeps_subzones() {
        let mut trie = Trie::new();
        trie.insert_soa(&domain("example.com."), soa(300));
        trie.insert_soa(&domain("sub.example.com."), soa(300));
        trie.insert(
            &domain("host.sub.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(1, 1, 1, 1)),
        );

        trie.remove_zone(&domain("example.com."));

        assert!(matches!(
            trie.lookup(&domain("example.com."), RecordType::SOA),
            Err(LookupFailure::NotAuthoritative)
        ));
        let (zrs, _) = trie
            .lookup(&domain("host.sub.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(vec![a_zr(Ipv4Addr::new(1, 1, 1, 1))], zrs);
    }

    #[test]
    fn check_detects_cname_coexistence() {
        let mut trie = Trie::new();
        trie.insert_soa(&domain("example.com."), soa(300));
        trie.insert(
            &domain("www.example.com."),
            RecordType::CNAME,
            ZoneRecord {
                rtype_with_data: RecordTypeWithData::CNAME {
                    cname: domain("example.com."),
                },
                ttl: 300,
            },
        );
        trie.insert(
            &domain("www.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(1, 1, 1, 1)),
        );

        assert!(trie.check().is_err());
    }

    #[test]
    fn check_passes_for_well_formed_zone() {
        let mut trie = Trie::new();
        trie.insert_soa(&domain("example.com."), soa(300));
        trie.insert(
            &domain("example.com."),
            RecordType::NS,
            ns_zr("ns1.example.com."),
        );
        trie.insert(
            &domain("ns1.example.com."),
            RecordType::A,
            a_zr(Ipv4Addr::new(192, 0, 2, 1)),
        );

        assert_eq!(Ok(()), trie.check());
    }
}
