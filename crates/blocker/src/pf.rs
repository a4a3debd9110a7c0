//! Packet filter port and the `pfctl` adapter.
//!
//! The synchronizer talks to PF only through [`FirewallPort`], so tests can
//! substitute a scripted firewall. Every operation is a fallible external
//! call whose textual output is the only feedback channel.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Name of the PF table holding the blocked addresses.
pub const BLOCK_TABLE: &str = "sitefence_block_ips";

/// Failure of an external packet filter call, carrying the tool's reason.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FirewallError(pub String);

#[async_trait]
pub trait FirewallPort: Send + Sync {
    /// Whether the packet filter is currently enabled.
    async fn is_enabled(&self) -> Result<bool, FirewallError>;

    /// Attempts to enable the packet filter; returns the tool's message.
    async fn enable(&self) -> Result<String, FirewallError>;

    /// Replaces the anchor's rules and tables with `rules`.
    async fn load_anchor(&self, rules: &str) -> Result<(), FirewallError>;

    /// Flushes the anchor's rules and tables.
    async fn flush_anchor(&self) -> Result<(), FirewallError>;

    /// Raw verbose rule listing for the anchor (`pfctl -vvs rules`).
    async fn rule_stats(&self) -> Result<String, FirewallError>;

    /// Raw label counter listing for the anchor (`pfctl -s labels`).
    async fn label_stats(&self) -> Result<String, FirewallError>;
}

/// Renders the anchor rule set: one persistent table of the sorted IPs and
/// one labeled outbound drop rule referencing it.
pub fn build_anchor_rules<'a>(ips: impl IntoIterator<Item = &'a String>, label: &str) -> String {
    let joined = ips
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "table <{BLOCK_TABLE}> persist {{ {joined} }}\n\
         block drop out quick to <{BLOCK_TABLE}> label \"{label}\"\n"
    )
}

/// Sums `Packets: N` counters for rules tagged with `label` in a verbose
/// rule listing. `None` when no packet data is present for the label, in
/// which case the caller falls back to the label counters.
pub fn parse_rule_packet_count(listing: &str, label: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut in_labeled_rule = false;
    let mut saw_packet_data = false;

    for raw_line in listing.lines() {
        let line = raw_line.trim();
        if line.starts_with("block") {
            in_labeled_rule = line.contains(label);
        }
        if !in_labeled_rule {
            continue;
        }
        if let Some(count) = find_packet_count(line) {
            total += count;
            saw_packet_data = true;
        }
    }

    saw_packet_data.then_some(total)
}

/// Fallback for platforms exposing label counters separately: sums every
/// packet figure when the label appears in the listing at all.
pub fn parse_label_packet_count(listing: &str, label: &str) -> u64 {
    if !listing.contains(label) {
        return 0;
    }
    listing.lines().filter_map(find_packet_count).sum()
}

fn find_packet_count(line: &str) -> Option<u64> {
    let lower = line.to_lowercase();
    let start = lower.find("packets:")? + "packets:".len();
    let rest = line[start..].trim_start();
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Reads the cumulative matched-packet count for the labeled rule,
/// degrading to 0 when the filter cannot be queried.
pub async fn read_blocked_packet_count(firewall: &dyn FirewallPort, label: &str) -> u64 {
    match firewall.rule_stats().await {
        Ok(listing) => {
            if let Some(count) = parse_rule_packet_count(&listing, label) {
                return count;
            }
        }
        Err(e) => {
            debug!(error = %e, "Rule stats query failed");
            return 0;
        }
    }
    match firewall.label_stats().await {
        Ok(listing) => parse_label_packet_count(&listing, label),
        Err(e) => {
            debug!(error = %e, "Label stats query failed");
            0
        }
    }
}

/// Adapter shelling out to `pfctl` for one anchor.
pub struct PfctlFirewall {
    anchor: String,
}

struct PfctlOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl PfctlFirewall {
    pub fn new(anchor: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
        }
    }

    async fn run(&self, args: &[&str], input: Option<&str>) -> Result<PfctlOutput, FirewallError> {
        let mut command = Command::new("pfctl");
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| FirewallError(format!("failed to spawn pfctl: {e}")))?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(text.as_bytes())
                    .await
                    .map_err(|e| FirewallError(format!("failed to feed pfctl stdin: {e}")))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FirewallError(format!("failed to wait for pfctl: {e}")))?;

        Ok(PfctlOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn failure_reason(output: &PfctlOutput, fallback: &str) -> String {
        let stderr = output.stderr.trim();
        let stdout = output.stdout.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !stdout.is_empty() {
            stdout.to_string()
        } else {
            fallback.to_string()
        }
    }
}

#[async_trait]
impl FirewallPort for PfctlFirewall {
    async fn is_enabled(&self) -> Result<bool, FirewallError> {
        let output = self.run(&["-s", "info"], None).await?;
        Ok(output.success && output.stdout.contains("Status: Enabled"))
    }

    async fn enable(&self) -> Result<String, FirewallError> {
        let output = self.run(&["-E"], None).await?;
        if output.success {
            let message = Self::failure_reason(&output, "pf enabled");
            Ok(message)
        } else {
            Err(FirewallError(Self::failure_reason(
                &output,
                "pfctl -E failed",
            )))
        }
    }

    async fn load_anchor(&self, rules: &str) -> Result<(), FirewallError> {
        let output = self
            .run(&["-a", &self.anchor, "-f", "-"], Some(rules))
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(FirewallError(Self::failure_reason(
                &output,
                "pfctl rule load failed",
            )))
        }
    }

    async fn flush_anchor(&self) -> Result<(), FirewallError> {
        // Flush failures are logged, not propagated: flushing an anchor
        // that never held rules complains and that is fine.
        if let Err(e) = self.run(&["-a", &self.anchor, "-F", "rules"], None).await {
            warn!(error = %e, anchor = %self.anchor, "Failed to flush anchor rules");
        }
        if let Err(e) = self.run(&["-a", &self.anchor, "-F", "Tables"], None).await {
            warn!(error = %e, anchor = %self.anchor, "Failed to flush anchor tables");
        }
        Ok(())
    }

    async fn rule_stats(&self) -> Result<String, FirewallError> {
        let output = self.run(&["-a", &self.anchor, "-vvs", "rules"], None).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(FirewallError(Self::failure_reason(
                &output,
                "pfctl rule stats failed",
            )))
        }
    }

    async fn label_stats(&self) -> Result<String, FirewallError> {
        let output = self.run(&["-a", &self.anchor, "-s", "labels"], None).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(FirewallError(Self::failure_reason(
                &output,
                "pfctl label stats failed",
            )))
        }
    }
}
