use sitefence_domain::event::EventRecord;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Builds the set of domains recognized as the target: the domain itself
/// plus its `www.` variant when the target does not already carry one.
pub fn build_target_aliases(target_domain: &str) -> BTreeSet<String> {
    let base = target_domain.trim().to_lowercase();
    let base = base.trim_matches('.').to_string();
    let mut aliases = BTreeSet::new();
    if !base.starts_with("www.") {
        aliases.insert(format!("www.{base}"));
    }
    aliases.insert(base);
    aliases
}

/// Everything the synchronizer knows, mutated single-threaded by the poll
/// loop. `enforced_ips` tracks what the firewall currently holds; whenever
/// it differs from `target_ips` a convergence is due.
#[derive(Debug)]
pub struct BlockerState {
    pub target_domain: String,
    pub target_aliases: BTreeSet<String>,
    pub events_log: PathBuf,
    /// Byte offset of the first unconsumed event log byte. Advances only
    /// past fully terminated lines.
    pub cursor: u64,
    pub total_events: u64,
    pub target_query_seen: bool,
    pub target_answer_seen: bool,
    pub target_events: Vec<EventRecord>,
    pub target_ips: BTreeSet<String>,
    pub enforced_ips: BTreeSet<String>,
    pub observed_domains: BTreeSet<String>,
    pub unblocked_domains: BTreeSet<String>,
    pub cumulative_blocked_packets: u64,
}

impl BlockerState {
    pub fn new(target_domain: &str, events_log: PathBuf) -> Self {
        let normalized = target_domain.trim().to_lowercase();
        let normalized = normalized.trim_matches('.').to_string();
        Self {
            target_aliases: build_target_aliases(&normalized),
            target_domain: normalized,
            events_log,
            cursor: 0,
            total_events: 0,
            target_query_seen: false,
            target_answer_seen: false,
            target_events: Vec::new(),
            target_ips: BTreeSet::new(),
            enforced_ips: BTreeSet::new(),
            observed_domains: BTreeSet::new(),
            unblocked_domains: BTreeSet::new(),
            cumulative_blocked_packets: 0,
        }
    }

    pub fn is_target(&self, domain: &str) -> bool {
        let normalized = domain.trim().to_lowercase();
        self.target_aliases
            .contains(normalized.trim_matches('.'))
    }

    /// True when the enforced rule set no longer matches what we know.
    pub fn needs_convergence(&self) -> bool {
        self.target_ips != self.enforced_ips
    }
}
