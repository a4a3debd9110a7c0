//! Progress snapshots and the final run summary.
//!
//! The synchronizer persists a JSON snapshot after every poll cycle and a
//! JSON plus plain-text summary at shutdown, so a run's outcome survives
//! the process.

use crate::state::BlockerState;
use chrono::Utc;
use serde::Serialize;
use sitefence_domain::event::EventRecord;
use sitefence_domain::BlockerError;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub updated_at_utc: String,
    pub run_stamp: String,
    pub target_domain: String,
    pub target_domains: Vec<String>,
    pub events_log: String,
    pub total_dns_events: u64,
    pub target_query_seen: bool,
    pub target_answer_seen: bool,
    pub target_events: Vec<EventRecord>,
    pub target_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
    pub observed_domain_count: usize,
    pub observed_domains: Vec<String>,
    pub unblocked_domain_count: usize,
    pub unblocked_domains: Vec<String>,
    pub pf_anchor: String,
    pub pf_label: String,
    pub pf_ready: bool,
    pub pf_status: String,
    pub blocked_packets_so_far: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at_utc: Option<String>,
}

impl StatusSnapshot {
    pub fn capture(
        state: &BlockerState,
        run_stamp: &str,
        anchor: &str,
        label: &str,
        pf_ready: bool,
        pf_status: &str,
        blocked_packets: u64,
    ) -> Self {
        Self {
            updated_at_utc: Utc::now().to_rfc3339(),
            run_stamp: run_stamp.to_string(),
            target_domain: state.target_domain.clone(),
            target_domains: sorted(&state.target_aliases),
            events_log: state.events_log.display().to_string(),
            total_dns_events: state.total_events,
            target_query_seen: state.target_query_seen,
            target_answer_seen: state.target_answer_seen,
            target_events: state.target_events.clone(),
            target_ips: sorted(&state.target_ips),
            blocked_ips: sorted(&state.enforced_ips),
            observed_domain_count: state.observed_domains.len(),
            observed_domains: sorted(&state.observed_domains),
            unblocked_domain_count: state.unblocked_domains.len(),
            unblocked_domains: sorted(&state.unblocked_domains),
            pf_anchor: anchor.to_string(),
            pf_label: label.to_string(),
            pf_ready,
            pf_status: pf_status.to_string(),
            blocked_packets_so_far: blocked_packets,
            finalized_at_utc: None,
        }
    }

    pub fn finalize(mut self) -> Self {
        self.finalized_at_utc = Some(Utc::now().to_rfc3339());
        self
    }

    pub async fn write_json(&self, path: &Path) -> Result<(), BlockerError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BlockerError::ArtifactWrite(path.display().to_string(), e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| BlockerError::ArtifactWrite(path.display().to_string(), e.to_string()))?;
        debug!(path = %path.display(), "Wrote status snapshot");
        Ok(())
    }

    pub async fn write_text(&self, path: &Path) -> Result<(), BlockerError> {
        tokio::fs::write(path, self.render_text())
            .await
            .map_err(|e| BlockerError::ArtifactWrite(path.display().to_string(), e.to_string()))
    }

    /// Human-readable run summary, written next to the JSON one.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str("=== sitefence block summary ===\n");
        out.push_str(&format!("run stamp:          {}\n", self.run_stamp));
        out.push_str(&format!("target domain:      {}\n", self.target_domain));
        out.push_str(&format!(
            "matched as target:  {}\n",
            self.target_domains.join(", ")
        ));
        out.push_str(&format!("events log:         {}\n", self.events_log));
        out.push_str(&format!("total dns events:   {}\n", self.total_dns_events));
        out.push_str(&format!(
            "target queried:     {}\n",
            yes_no(self.target_query_seen)
        ));
        out.push_str(&format!(
            "target resolved:    {}\n",
            yes_no(self.target_answer_seen)
        ));
        out.push_str(&format!(
            "target ips ({}):     {}\n",
            self.target_ips.len(),
            join_or_none(&self.target_ips)
        ));
        out.push_str(&format!(
            "blocked ips ({}):    {}\n",
            self.blocked_ips.len(),
            join_or_none(&self.blocked_ips)
        ));
        out.push_str(&format!(
            "other domains seen: {}\n",
            self.unblocked_domain_count
        ));
        out.push_str(&format!("pf anchor:          {}\n", self.pf_anchor));
        out.push_str(&format!("pf label:           {}\n", self.pf_label));
        out.push_str(&format!("pf status:          {}\n", self.pf_status));
        out.push_str(&format!(
            "blocked packets:    {}\n",
            self.blocked_packets_so_far
        ));
        if let Some(finalized) = &self.finalized_at_utc {
            out.push_str(&format!("finalized at:       {finalized}\n"));
        }
        out
    }
}

fn sorted(set: &BTreeSet<String>) -> Vec<String> {
    set.iter().cloned().collect()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
