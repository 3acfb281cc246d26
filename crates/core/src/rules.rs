#![forbid(unsafe_code)]

use crate::error::RuleError;
use arc_swap::ArcSwap;
use packet_types::{AddrFamily, IpProtocol, PacketHeader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Zero-based position of a rule within its set.
pub type RuleId = u64;

/// The pass/block subset of actions; both the verdict decision and the
/// process-wide default policy use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePolicy {
    Pass,
    Block,
}

/// What a matched rule does. `Skip(n)` jumps over the next `n` rules and
/// never becomes a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Pass,
    Block,
    Skip(u32),
}

/// Address predicate: the packet address masked by `mask` must equal the
/// rule address masked the same way. An all-zero mask matches anything of
/// the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMatch {
    V4 { addr: Ipv4Addr, mask: Ipv4Addr },
    V6 { addr: Ipv6Addr, mask: Ipv6Addr },
}

impl AddrMatch {
    pub fn any_v4() -> Self {
        AddrMatch::V4 {
            addr: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn any_v6() -> Self {
        AddrMatch::V6 {
            addr: Ipv6Addr::UNSPECIFIED,
            mask: Ipv6Addr::UNSPECIFIED,
        }
    }

    pub fn any(family: AddrFamily) -> Self {
        match family {
            AddrFamily::V4 => Self::any_v4(),
            AddrFamily::V6 => Self::any_v6(),
        }
    }

    /// IPv4 prefixes are the only mask shape rules use for that family.
    pub fn v4_prefix(addr: Ipv4Addr, prefix: u8) -> Self {
        AddrMatch::V4 {
            addr,
            mask: Ipv4Addr::from(mask_v4(prefix)),
        }
    }

    pub fn v6_prefix(addr: Ipv6Addr, prefix: u8) -> Self {
        AddrMatch::V6 {
            addr,
            mask: Ipv6Addr::from(mask_v6(prefix)),
        }
    }

    /// IPv6 additionally allows arbitrary (non-prefix) masks.
    pub fn v6_mask(addr: Ipv6Addr, mask: Ipv6Addr) -> Self {
        AddrMatch::V6 { addr, mask }
    }

    pub fn family(&self) -> AddrFamily {
        match self {
            AddrMatch::V4 { .. } => AddrFamily::V4,
            AddrMatch::V6 { .. } => AddrFamily::V6,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (AddrMatch::V4 { addr: net, mask }, IpAddr::V4(ip)) => {
                let net = u32::from_be_bytes(net.octets());
                let ip = u32::from_be_bytes(ip.octets());
                let mask = u32::from_be_bytes(mask.octets());
                (net & mask) == (ip & mask)
            }
            (AddrMatch::V6 { addr: net, mask }, IpAddr::V6(ip)) => {
                let net = u128::from_be_bytes(net.octets());
                let ip = u128::from_be_bytes(ip.octets());
                let mask = u128::from_be_bytes(mask.octets());
                (net & mask) == (ip & mask)
            }
            _ => false,
        }
    }
}

/// Inclusive port interval; a single port is the degenerate range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMatch {
    pub start: u16,
    pub end: u16,
}

impl PortMatch {
    pub fn new(start: u16, end: u16) -> Self {
        let (start, end) = if start <= end {
            (start, end)
        } else {
            (end, start)
        };
        PortMatch { start, end }
    }

    pub fn single(port: u16) -> Self {
        PortMatch {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn overlaps(&self, other: &PortMatch) -> bool {
        !(self.end < other.start || other.end < self.start)
    }
}

/// TCP flag predicate: `(packet_flags & mask) == (set & mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMatch {
    pub set: u16,
    pub mask: u16,
}

impl FlagMatch {
    pub fn matches(&self, packet_flags: u16) -> bool {
        (packet_flags & self.mask) == (self.set & self.mask)
    }
}

/// One filter rule. Absent predicates are wildcards; a rule matches only
/// when every present predicate matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub family: AddrFamily,
    pub src: AddrMatch,
    pub dst: AddrMatch,
    pub protocol: Option<IpProtocol>,
    pub src_ports: Option<PortMatch>,
    pub dst_ports: Option<PortMatch>,
    pub flags: Option<FlagMatch>,
    pub action: FilterAction,
    pub quick: bool,
    pub log: bool,
    pub keep_state: bool,
}

impl Rule {
    /// Wildcard rule for `family` with the given action; narrow it with the
    /// builder setters.
    pub fn build(family: AddrFamily, action: FilterAction) -> RuleBuilder {
        RuleBuilder {
            rule: Rule {
                family,
                src: AddrMatch::any(family),
                dst: AddrMatch::any(family),
                protocol: None,
                src_ports: None,
                dst_ports: None,
                flags: None,
                action,
                quick: false,
                log: false,
                keep_state: false,
            },
        }
    }

    pub fn matches(&self, header: &PacketHeader) -> bool {
        if header.family() != self.family {
            return false;
        }
        if !self.src.matches(&header.src_addr) || !self.dst.matches(&header.dst_addr) {
            return false;
        }
        if let Some(proto) = self.protocol
            && proto != header.protocol
        {
            return false;
        }
        if let Some(range) = &self.src_ports {
            match header.src_port {
                Some(port) if range.contains(port) => {}
                _ => return false,
            }
        }
        if let Some(range) = &self.dst_ports {
            match header.dst_port {
                Some(port) if range.contains(port) => {}
                _ => return false,
            }
        }
        if let Some(flag_match) = &self.flags {
            match header.tcp_flags {
                Some(flags) if flag_match.matches(flags) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Builder for constructing rules.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    rule: Rule,
}

impl RuleBuilder {
    pub fn src(mut self, m: AddrMatch) -> Self {
        self.rule.src = m;
        self
    }

    pub fn dst(mut self, m: AddrMatch) -> Self {
        self.rule.dst = m;
        self
    }

    pub fn protocol(mut self, proto: IpProtocol) -> Self {
        self.rule.protocol = Some(proto);
        self
    }

    pub fn src_ports(mut self, range: PortMatch) -> Self {
        self.rule.src_ports = Some(range);
        self
    }

    pub fn dst_ports(mut self, range: PortMatch) -> Self {
        self.rule.dst_ports = Some(range);
        self
    }

    pub fn flags(mut self, set: u16, mask: u16) -> Self {
        self.rule.flags = Some(FlagMatch { set, mask });
        self
    }

    pub fn quick(mut self) -> Self {
        self.rule.quick = true;
        self
    }

    pub fn log(mut self) -> Self {
        self.rule.log = true;
        self
    }

    pub fn keep_state(mut self) -> Self {
        self.rule.keep_state = true;
        self
    }

    pub fn finish(self) -> Rule {
        self.rule
    }
}

/// Load-time validation; the matcher itself has no failure conditions.
pub fn validate_rules(rules: &[Rule]) -> Result<(), RuleError> {
    for (index, rule) in rules.iter().enumerate() {
        if rule.src.family() != rule.family || rule.dst.family() != rule.family {
            return Err(RuleError::MixedFamilies { index });
        }
        if let Some(flag_match) = &rule.flags {
            if rule.protocol != Some(IpProtocol::Tcp) {
                return Err(RuleError::FlagsOnNonTcp { index });
            }
            if flag_match.mask == 0 && flag_match.set != 0 {
                return Err(RuleError::EmptyMaskWithFlags {
                    index,
                    set: flag_match.set,
                });
            }
        }
        if let FilterAction::Skip(count) = rule.action
            && index + 1 + count as usize > rules.len()
        {
            return Err(RuleError::SkipOutOfRange { index, count });
        }
    }
    Ok(())
}

/// The decision produced for one packet: the policy to apply and, when a
/// rule (rather than the default policy) produced it, that rule's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: RulePolicy,
    pub rule: Option<RuleId>,
}

/// Stable handle to a rule in a specific snapshot. Resolution fails once
/// the snapshot is replaced, so holders fall back to the default policy
/// instead of touching a rule the id no longer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleToken {
    pub generation: u64,
    pub id: RuleId,
}

/// One immutable generation of the rule list plus its hit counters.
/// Counters are monotonic for the snapshot's lifetime.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    hits: Vec<AtomicU64>,
    generation: u64,
}

impl RuleSet {
    fn new(rules: Vec<Rule>, generation: u64) -> Self {
        let hits = rules.iter().map(|_| AtomicU64::new(0)).collect();
        RuleSet {
            rules,
            hits,
            generation,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(id as usize)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self, id: RuleId) -> RuleToken {
        RuleToken {
            generation: self.generation,
            id,
        }
    }

    /// `Some(id)` only while the token's snapshot is still the live one.
    pub fn resolve(&self, token: RuleToken) -> Option<RuleId> {
        if token.generation == self.generation && (token.id as usize) < self.rules.len() {
            Some(token.id)
        } else {
            None
        }
    }

    pub fn hits(&self) -> Vec<u64> {
        self.hits
            .iter()
            .map(|h| h.load(Ordering::Relaxed))
            .collect()
    }

    /// Walk the rules in stored order. The last matching rule governs
    /// unless a matching rule is marked quick, which ends the walk at once.
    /// A matched skip rule jumps the walk forward without deciding.
    pub fn evaluate(&self, header: &PacketHeader, default_policy: RulePolicy) -> Verdict {
        let mut matched: Option<(RuleId, RulePolicy)> = None;
        let mut index = 0usize;
        while index < self.rules.len() {
            let rule = &self.rules[index];
            if rule.matches(header) {
                if let Some(counter) = self.hits.get(index) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                match rule.action {
                    FilterAction::Skip(count) => {
                        index += 1 + count as usize;
                        continue;
                    }
                    FilterAction::Pass => matched = Some((index as RuleId, RulePolicy::Pass)),
                    FilterAction::Block => matched = Some((index as RuleId, RulePolicy::Block)),
                }
                if rule.quick {
                    break;
                }
            }
            index += 1;
        }
        match matched {
            Some((id, action)) => Verdict {
                action,
                rule: Some(id),
            },
            None => Verdict {
                action: default_policy,
                rule: None,
            },
        }
    }
}

/// Shared handle to the active rule set. Readers load an immutable
/// snapshot; a reload validates the new list and swaps it in whole, so a
/// reader sees either the old generation or the new one, never a mix.
#[derive(Debug)]
pub struct RuleStore {
    inner: ArcSwap<RuleSet>,
    next_generation: AtomicU64,
}

impl RuleStore {
    pub fn new() -> Self {
        RuleStore {
            inner: ArcSwap::from_pointee(RuleSet::new(Vec::new(), 0)),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_rules(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let store = Self::new();
        store.replace(rules)?;
        Ok(store)
    }

    pub fn load(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    pub fn replace(&self, rules: Vec<Rule>) -> Result<u64, RuleError> {
        validate_rules(&rules)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.store(Arc::new(RuleSet::new(rules, generation)));
        Ok(generation)
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32))
    }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix.min(128) as u32)
    }
}
