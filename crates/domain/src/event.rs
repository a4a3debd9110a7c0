//! The event log line grammar shared by the proxy (writer) and the blocker
//! (reader).
//!
//! One line per completed DNS exchange:
//!
//! ```text
//! [<domain>] @ [<UTC YYYYMMDD-HH:MM:SS>] using [<ip, ip, ...>]
//! ```
//!
//! The bracket/keyword grammar is the sole contract between the two
//! processes; both sides must agree on it exactly.

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

const STAMP_FORMAT: &str = "%Y%m%d-%H:%M:%S";

/// Timestamp-derived identifier namespacing one session's output artifacts.
pub fn run_stamp() -> String {
    Local::now().format(STAMP_FORMAT).to_string()
}

/// UTC timestamp for a single observed DNS exchange.
pub fn event_timestamp() -> String {
    Utc::now().format(STAMP_FORMAT).to_string()
}

/// One `(domain, time, resolved IPs)` observation, immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub domain: String,
    pub observed_at: String,
    pub ips: Vec<String>,
}

impl EventRecord {
    pub fn new(domain: impl Into<String>, ips: Vec<String>) -> Self {
        Self {
            domain: domain.into(),
            observed_at: event_timestamp(),
            ips,
        }
    }

    /// Renders the record in the line grammar, without a trailing newline.
    pub fn render_line(&self) -> String {
        format!(
            "[{}] @ [{}] using [{}]",
            self.domain,
            self.observed_at,
            self.ips.join(", ")
        )
    }
}

fn take_bracketed(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('[')?;
    let end = rest.find(']')?;
    Some((&rest[..end], &rest[end + 1..]))
}

/// Parses one event log line. Returns `None` for anything that does not
/// match the grammar exactly; IP tokens that fail to parse as addresses are
/// dropped, the rest are canonicalized and deduplicated preserving order.
pub fn parse_line(line: &str) -> Option<EventRecord> {
    let s = line.trim();
    let (domain_raw, s) = take_bracketed(s)?;
    let s = s.trim_start().strip_prefix('@')?;
    let (time_raw, s) = take_bracketed(s.trim_start())?;
    let s = s.trim_start().strip_prefix("using")?;
    let (ips_raw, s) = take_bracketed(s.trim_start())?;
    if !s.trim().is_empty() {
        return None;
    }

    let domain = domain_raw
        .trim()
        .to_lowercase()
        .trim_matches('.')
        .to_string();
    let observed_at = time_raw.trim().to_string();

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut ips: Vec<String> = Vec::new();
    for part in ips_raw.split(',') {
        let token = part.trim();
        if token.is_empty() {
            continue;
        }
        if let Ok(ip) = token.parse::<IpAddr>() {
            let canonical = ip.to_string();
            if seen.insert(canonical.clone()) {
                ips.push(canonical);
            }
        }
    }

    Some(EventRecord {
        domain,
        observed_at,
        ips,
    })
}
