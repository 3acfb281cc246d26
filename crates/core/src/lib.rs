#![forbid(unsafe_code)]

use packet_types::{FragmentHeader, IpProtocol, PacketHeader, tcp_flags};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

mod cksum;
mod error;
mod flags;
mod frag;
mod reaper;
mod rules;
mod state;
mod tunables;

pub use cksum::*;
pub use error::*;
pub use flags::*;
pub use frag::*;
pub use reaper::*;
pub use rules::*;
pub use state::*;
pub use tunables::*;

/// Construction-time settings for an `Engine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_policy: RulePolicy,
    pub frag_shards: u16,
    pub frag_capacity_per_shard: u32,
    pub frag_idle_window: Duration,
    pub state_max: u32,
    pub log_verdicts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_policy: RulePolicy::Block,
            frag_shards: DEFAULT_FRAG_SHARDS,
            frag_capacity_per_shard: DEFAULT_FRAG_CAPACITY,
            frag_idle_window: Duration::from_secs(DEFAULT_FRAG_TTL_SECS as u64),
            state_max: DEFAULT_STATE_MAX,
            log_verdicts: false,
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Verdicts issued, over every entry point.
    pub evaluated: u64,
    pub passed: u64,
    pub blocked: u64,
    /// Verdicts where no rule matched and the default policy applied.
    pub defaulted: u64,
    /// Fragment verdict tokens that no longer resolved against the live
    /// rule snapshot.
    pub stale_tokens: u64,
}

#[derive(Debug, Default)]
struct Counters {
    evaluated: AtomicU64,
    passed: AtomicU64,
    blocked: AtomicU64,
    defaulted: AtomicU64,
    stale_tokens: AtomicU64,
}

/// The filter core behind one shared handle: rule snapshots, fragment
/// correlation, connection state counts, and runtime knobs. Every
/// operation takes `&self`, so one `Arc<Engine>` serves any number of
/// receive contexts concurrently.
#[derive(Debug)]
pub struct Engine {
    rules: RuleStore,
    fragments: FragmentCache,
    states: TcpStateTable,
    tunables: TunableTable,
    default_pass: AtomicBool,
    log_verdicts: AtomicBool,
    state_max: AtomicU64,
    counters: Counters,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let frag_ttl_secs = config.frag_idle_window.as_secs().clamp(1, 86400) as u32;
        Engine {
            rules: RuleStore::new(),
            fragments: FragmentCache::new(
                config.frag_shards as usize,
                config.frag_capacity_per_shard as usize,
                config.frag_idle_window,
            ),
            states: TcpStateTable::new(),
            tunables: TunableTable::for_engine(
                frag_ttl_secs,
                config.frag_capacity_per_shard,
                config.frag_shards,
                config.state_max,
                config.log_verdicts,
                config.default_policy == RulePolicy::Pass,
            ),
            default_pass: AtomicBool::new(config.default_policy == RulePolicy::Pass),
            log_verdicts: AtomicBool::new(config.log_verdicts),
            state_max: AtomicU64::new(config.state_max as u64),
            counters: Counters::default(),
        }
    }

    pub fn default_policy(&self) -> RulePolicy {
        if self.default_pass.load(Ordering::Relaxed) {
            RulePolicy::Pass
        } else {
            RulePolicy::Block
        }
    }

    /// Walk the live rule snapshot for one packet.
    pub fn evaluate(&self, header: &PacketHeader) -> Verdict {
        let snapshot = self.rules.load();
        self.evaluate_in(&snapshot, header)
    }

    /// Verdict for one fragment. The first fragment of a datagram gets a
    /// full rule walk and, when a rule passes it, leaves a token for the
    /// rest; a non-initial fragment inherits that verdict if its datagram
    /// is tracked and the token still resolves, and falls back to the
    /// default policy otherwise. Fragments carry no ports, so port rules
    /// never match them.
    pub fn filter_fragment(&self, header: &FragmentHeader, now: Instant) -> Verdict {
        if header.is_first_fragment {
            let packet = fragment_packet(header);
            let snapshot = self.rules.load();
            let verdict = self.evaluate_in(&snapshot, &packet);
            if let Some(id) = verdict.rule
                && verdict.action == RulePolicy::Pass
            {
                self.fragments.record(header, snapshot.token(id), now);
            }
            return verdict;
        }
        let verdict = match self.fragments.lookup_or_admit(header, now) {
            Some(token) => {
                let snapshot = self.rules.load();
                match snapshot.resolve(token) {
                    Some(id) => Verdict {
                        action: RulePolicy::Pass,
                        rule: Some(id),
                    },
                    None => {
                        self.counters.stale_tokens.fetch_add(1, Ordering::Relaxed);
                        Verdict {
                            action: self.default_policy(),
                            rule: None,
                        }
                    }
                }
            }
            None => Verdict {
                action: self.default_policy(),
                rule: None,
            },
        };
        self.note_verdict(&verdict);
        verdict
    }

    /// Validate and atomically swap in a new rule list. Readers in flight
    /// keep the old snapshot; nothing changes on error.
    pub fn reload(&self, rules: Vec<Rule>) -> Result<u64, RuleError> {
        let previous = self.rules.load().len();
        let generation = self.rules.replace(rules)?;
        let current = self.rules.load();
        log::info!(
            target: "palisade",
            "rule set replaced: {previous} -> {} rules (generation {generation})",
            current.len()
        );
        Ok(generation)
    }

    /// Drop idle fragment entries, honoring the live `frag_ttl_secs` knob.
    /// Runs off the packet path, normally from the reaper thread.
    pub fn sweep_fragments(&self, now: Instant) -> usize {
        if let Ok(ttl) = self.tunables.get(names::FRAG_TTL_SECS) {
            self.fragments
                .set_idle_window(Duration::from_secs(ttl.value.widen()));
        }
        let removed = self.fragments.reap(now);
        if removed > 0 {
            log::debug!(target: "palisade::reaper", "swept {removed} idle fragment entries");
        }
        removed
    }

    pub fn get_tunable(&self, name: &str) -> Result<Tunable, FilterError> {
        self.tunables.get(name)
    }

    /// Bounds-checked knob write, then applied to the running engine.
    pub fn set_tunable(&self, name: &str, value: u64) -> Result<(), FilterError> {
        self.tunables.set(name, value)?;
        match name {
            names::FRAG_TTL_SECS => self.fragments.set_idle_window(Duration::from_secs(value)),
            names::FRAG_CAPACITY => self.fragments.set_capacity_per_shard(value as usize),
            names::STATE_MAX => self.state_max.store(value, Ordering::Relaxed),
            names::LOG_VERDICTS => self.log_verdicts.store(value != 0, Ordering::Relaxed),
            names::DEFAULT_PASS => self.default_pass.store(value != 0, Ordering::Relaxed),
            _ => {}
        }
        Ok(())
    }

    pub fn format_tunables(&self) -> String {
        self.tunables.format_all()
    }

    pub fn snapshot(&self) -> std::sync::Arc<RuleSet> {
        self.rules.load()
    }

    pub fn rule_hits(&self) -> Vec<u64> {
        self.rules.load().hits()
    }

    pub fn fragments(&self) -> &FragmentCache {
        &self.fragments
    }

    pub fn frag_stats(&self) -> FragStats {
        self.fragments.stats()
    }

    pub fn states(&self) -> &TcpStateTable {
        &self.states
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            passed: self.counters.passed.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            defaulted: self.counters.defaulted.load(Ordering::Relaxed),
            stale_tokens: self.counters.stale_tokens.load(Ordering::Relaxed),
        }
    }

    fn evaluate_in(&self, snapshot: &RuleSet, header: &PacketHeader) -> Verdict {
        let verdict = snapshot.evaluate(header, self.default_policy());
        self.note_verdict(&verdict);
        if let Some(id) = verdict.rule
            && let Some(rule) = snapshot.rule(id)
        {
            if rule.log && self.log_verdicts.load(Ordering::Relaxed) {
                log::debug!(
                    target: "palisade::verdict",
                    "rule {id} {:?} {:?} {} -> {}",
                    verdict.action,
                    header.protocol,
                    header.src_addr,
                    header.dst_addr
                );
            }
            if rule.keep_state && verdict.action == RulePolicy::Pass {
                self.track_connection(header);
            }
        }
        verdict
    }

    /// Seed a connection slot for a passed SYN, within the `state_max`
    /// budget. Later transitions come from an external tracker.
    fn track_connection(&self, header: &PacketHeader) {
        let handshake = tcp_flags::SYN | tcp_flags::ACK | tcp_flags::RST | tcp_flags::FIN;
        if header.protocol == IpProtocol::Tcp
            && let Some(flags) = header.tcp_flags
            && flags & handshake == tcp_flags::SYN
            && self.states.total() < self.state_max.load(Ordering::Relaxed)
        {
            self.states.transition(None, TcpState::SynSent);
        }
    }

    fn note_verdict(&self, verdict: &Verdict) {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
        let bucket = match verdict.action {
            RulePolicy::Pass => &self.counters.passed,
            RulePolicy::Block => &self.counters.blocked,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        if verdict.rule.is_none() {
            self.counters.defaulted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

fn fragment_packet(header: &FragmentHeader) -> PacketHeader {
    PacketHeader {
        src_addr: header.src_addr,
        dst_addr: header.dst_addr,
        protocol: header.protocol,
        src_port: None,
        dst_port: None,
        tcp_flags: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_types::AddrFamily;

    fn udp_packet() -> PacketHeader {
        PacketHeader {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            protocol: IpProtocol::Udp,
            src_port: Some(4000),
            dst_port: Some(53),
            tcp_flags: None,
        }
    }

    fn syn_packet(dst_port: u16) -> PacketHeader {
        PacketHeader {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            protocol: IpProtocol::Tcp,
            src_port: Some(49152),
            dst_port: Some(dst_port),
            tcp_flags: Some(tcp_flags::SYN),
        }
    }

    fn udp_fragment(ip_id: u16, first: bool) -> FragmentHeader {
        FragmentHeader {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            protocol: IpProtocol::Udp,
            ip_id,
            is_first_fragment: first,
            ttl: 64,
            len: 1480,
        }
    }

    fn pass_udp() -> Rule {
        Rule::build(AddrFamily::V4, FilterAction::Pass)
            .protocol(IpProtocol::Udp)
            .finish()
    }

    #[test]
    fn an_empty_engine_applies_its_default_policy() {
        let engine = Engine::default();
        let verdict = engine.evaluate(&udp_packet());
        assert_eq!(verdict.action, RulePolicy::Block);
        assert_eq!(verdict.rule, None);

        engine.set_tunable(names::DEFAULT_PASS, 1).unwrap();
        assert_eq!(engine.evaluate(&udp_packet()).action, RulePolicy::Pass);

        let stats = engine.stats();
        assert_eq!(stats.evaluated, 2);
        assert_eq!(stats.defaulted, 2);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.passed, 1);
    }

    #[test]
    fn reload_takes_effect_for_later_packets() {
        let engine = Engine::default();
        assert_eq!(engine.evaluate(&udp_packet()).action, RulePolicy::Block);

        let generation = engine.reload(vec![pass_udp()]).unwrap();
        assert_eq!(generation, 1);
        let verdict = engine.evaluate(&udp_packet());
        assert_eq!(verdict.action, RulePolicy::Pass);
        assert_eq!(verdict.rule, Some(0));
        assert_eq!(engine.rule_hits(), vec![1]);
    }

    #[test]
    fn first_fragment_verdict_carries_to_the_tail() {
        let engine = Engine::default();
        engine.reload(vec![pass_udp()]).unwrap();
        let now = Instant::now();

        let first = engine.filter_fragment(&udp_fragment(7, true), now);
        assert_eq!(first.action, RulePolicy::Pass);
        assert_eq!(first.rule, Some(0));

        let tail = engine.filter_fragment(&udp_fragment(7, false), now);
        assert_eq!(tail.action, RulePolicy::Pass);
        assert_eq!(tail.rule, Some(0));
        assert_eq!(engine.frag_stats().hits, 1);
    }

    #[test]
    fn blocked_first_fragment_leaves_no_trail() {
        let engine = Engine::default();
        engine
            .reload(vec![
                Rule::build(AddrFamily::V4, FilterAction::Block)
                    .protocol(IpProtocol::Udp)
                    .quick()
                    .finish(),
            ])
            .unwrap();
        let now = Instant::now();

        assert_eq!(
            engine.filter_fragment(&udp_fragment(8, true), now).action,
            RulePolicy::Block
        );
        let tail = engine.filter_fragment(&udp_fragment(8, false), now);
        assert_eq!(tail.action, RulePolicy::Block);
        assert_eq!(tail.rule, None);
        assert_eq!(engine.frag_stats().orphans, 1);
    }

    #[test]
    fn a_reload_strands_recorded_fragments() {
        let engine = Engine::default();
        engine.reload(vec![pass_udp()]).unwrap();
        let now = Instant::now();
        engine.filter_fragment(&udp_fragment(9, true), now);

        engine.reload(vec![pass_udp()]).unwrap();
        let tail = engine.filter_fragment(&udp_fragment(9, false), now);
        assert_eq!(tail.action, RulePolicy::Block);
        assert_eq!(tail.rule, None);
        assert_eq!(engine.stats().stale_tokens, 1);
    }

    #[test]
    fn knob_writes_reach_the_running_engine() {
        let engine = Engine::default();
        engine.set_tunable(names::FRAG_TTL_SECS, 5).unwrap();
        assert_eq!(engine.fragments().idle_window(), Duration::from_secs(5));

        engine.set_tunable(names::FRAG_CAPACITY, 2).unwrap();
        assert_eq!(engine.fragments().capacity_per_shard(), 2);

        assert!(engine.set_tunable(names::FRAG_SHARDS, 4).is_err());
    }

    #[test]
    fn sweep_honors_the_ttl_knob() {
        let engine = Engine::default();
        engine.reload(vec![pass_udp()]).unwrap();
        let now = Instant::now();
        engine.filter_fragment(&udp_fragment(10, true), now);

        engine.set_tunable(names::FRAG_TTL_SECS, 1).unwrap();
        assert_eq!(engine.sweep_fragments(now + Duration::from_secs(2)), 1);

        let tail = engine.filter_fragment(&udp_fragment(10, false), now + Duration::from_secs(2));
        assert_eq!(tail.rule, None);
    }

    #[test]
    fn connection_tracking_respects_state_max() {
        let engine = Engine::default();
        engine
            .reload(vec![
                Rule::build(AddrFamily::V4, FilterAction::Pass)
                    .protocol(IpProtocol::Tcp)
                    .keep_state()
                    .finish(),
            ])
            .unwrap();
        engine.set_tunable(names::STATE_MAX, 1).unwrap();

        engine.evaluate(&syn_packet(22));
        engine.evaluate(&syn_packet(80));
        assert_eq!(engine.states().count(TcpState::SynSent), 1);

        // an established-flags packet does not seed a slot
        let mut ack = syn_packet(443);
        ack.tcp_flags = Some(tcp_flags::SYN | tcp_flags::ACK);
        engine.evaluate(&ack);
        assert_eq!(engine.states().total(), 1);
    }
}
