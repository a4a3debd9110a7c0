//! Convergence loop between the event log and the packet filter.
//!
//! Each poll cycle consumes new events, reconciles the anchor when the
//! accumulated target IPs drift from what is enforced, and persists a
//! progress snapshot. The firewall is treated as sticky: if it cannot be
//! made ready at startup, rule operations are skipped for the whole run
//! while observation continues.

use crate::pf::{build_anchor_rules, read_blocked_packet_count, FirewallPort};
use crate::snapshot::StatusSnapshot;
use crate::state::BlockerState;
use crate::tailer::consume_new_events;
use sitefence_domain::BlockerError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BlockSynchronizer {
    state: BlockerState,
    firewall: Arc<dyn FirewallPort>,
    anchor: String,
    label: String,
    poll: Duration,
    intermediate_json: PathBuf,
    final_json: PathBuf,
    final_txt: PathBuf,
    pid_file: Option<PathBuf>,
    stop: CancellationToken,
    run_stamp: String,
    pf_ready: bool,
    pf_message: String,
}

impl BlockSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_domain: &str,
        events_log: PathBuf,
        log_dir: &Path,
        run_stamp: &str,
        anchor: &str,
        label: &str,
        poll: Duration,
        pid_file: Option<PathBuf>,
        firewall: Arc<dyn FirewallPort>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            state: BlockerState::new(target_domain, events_log),
            firewall,
            anchor: anchor.to_string(),
            label: label.to_string(),
            poll,
            intermediate_json: log_dir.join(format!("block_intermediate_{run_stamp}.json")),
            final_json: log_dir.join(format!("block_summary_{run_stamp}.json")),
            final_txt: log_dir.join(format!("block_summary_{run_stamp}.txt")),
            pid_file,
            stop,
            run_stamp: run_stamp.to_string(),
            pf_ready: false,
            pf_message: "not checked".to_string(),
        }
    }

    pub fn state(&self) -> &BlockerState {
        &self.state
    }

    pub fn pf_ready(&self) -> bool {
        self.pf_ready
    }

    /// Writes the liveness marker and probes the firewall once. A filter
    /// that cannot be enabled leaves the run in observe-only mode.
    pub async fn startup(&mut self) -> Result<(), BlockerError> {
        if let Some(path) = &self.pid_file {
            write_pid_file(path).await?;
        }

        match self.ensure_firewall_ready().await {
            Ok(message) => {
                self.pf_ready = true;
                self.pf_message = message;
                info!(anchor = %self.anchor, status = %self.pf_message, "Packet filter ready");
            }
            Err(e) => {
                self.pf_ready = false;
                self.pf_message = format!("pf unavailable: {e}");
                warn!(error = %e, "Packet filter unavailable, observing without enforcement");
            }
        }

        info!(
            target = %self.state.target_domain,
            events_log = %self.state.events_log.display(),
            poll_ms = self.poll.as_millis() as u64,
            "Block synchronizer started"
        );
        Ok(())
    }

    async fn ensure_firewall_ready(&self) -> Result<String, crate::pf::FirewallError> {
        if self.firewall.is_enabled().await? {
            return Ok("pf already enabled".to_string());
        }
        self.firewall.enable().await
    }

    /// One observation and convergence pass.
    pub async fn poll_cycle(&mut self) {
        match consume_new_events(&mut self.state).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Event log read failed, retrying next cycle"),
        }

        if self.pf_ready && self.state.needs_convergence() {
            // Reloading the anchor resets PF's counters, so fold the
            // current reading into the cumulative total first.
            self.state.cumulative_blocked_packets +=
                read_blocked_packet_count(self.firewall.as_ref(), &self.label).await;
            self.converge().await;
        }

        let snapshot = self.capture_snapshot().await;
        if let Err(e) = snapshot.write_json(&self.intermediate_json).await {
            warn!(error = %e, "Failed to write intermediate snapshot");
        }
    }

    /// Every outcome lands in `pf_message` so the next snapshot carries
    /// the reason for the current enforcement state.
    async fn converge(&mut self) {
        if self.state.target_ips.is_empty() {
            match self.firewall.flush_anchor().await {
                Ok(()) => {
                    info!(anchor = %self.anchor, "Cleared anchor rules");
                    self.state.enforced_ips.clear();
                    self.pf_message = format!("cleared anchor {}", self.anchor);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to clear anchor rules");
                    self.pf_message = format!("failed to clear anchor rules: {e}");
                }
            }
            return;
        }

        let rules = build_anchor_rules(&self.state.target_ips, &self.label);
        match self.firewall.load_anchor(&rules).await {
            Ok(()) => {
                self.state.enforced_ips = self.state.target_ips.clone();
                info!(
                    anchor = %self.anchor,
                    ips = self.state.enforced_ips.len(),
                    "Anchor rules converged"
                );
                self.pf_message = format!(
                    "loaded {} blocked IPs into {}",
                    self.state.enforced_ips.len(),
                    self.anchor
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to load anchor rules");
                self.pf_message = format!("failed to load anchor rules: {e}");
            }
        }
    }

    async fn capture_snapshot(&self) -> StatusSnapshot {
        let current = if self.pf_ready {
            read_blocked_packet_count(self.firewall.as_ref(), &self.label).await
        } else {
            0
        };
        StatusSnapshot::capture(
            &self.state,
            &self.run_stamp,
            &self.anchor,
            &self.label,
            self.pf_ready,
            &self.pf_message,
            self.state.cumulative_blocked_packets + current,
        )
    }

    /// Final drain, summary artifacts, anchor cleanup, pid file removal.
    pub async fn shutdown(&mut self) {
        if let Err(e) = consume_new_events(&mut self.state).await {
            warn!(error = %e, "Final event log read failed");
        }

        let snapshot = self.capture_snapshot().await.finalize();
        if let Err(e) = snapshot.write_json(&self.final_json).await {
            warn!(error = %e, "Failed to write final summary json");
        }
        if let Err(e) = snapshot.write_text(&self.final_txt).await {
            warn!(error = %e, "Failed to write final summary text");
        }

        // Cleanup is attempted even when the filter never came up; a
        // flush against a missing anchor only warns.
        if let Err(e) = self.firewall.flush_anchor().await {
            warn!(error = %e, "Failed to flush anchor at shutdown");
        } else {
            info!(anchor = %self.anchor, "Anchor flushed at shutdown");
        }

        if let Some(path) = &self.pid_file {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(error = %e, path = %path.display(), "Pid file removal failed");
            }
        }

        info!(
            total_events = self.state.total_events,
            target_ips = self.state.target_ips.len(),
            blocked_packets = snapshot.blocked_packets_so_far,
            "Block synchronizer stopped"
        );
    }

    /// Drives poll cycles until cancellation, then shuts down.
    pub async fn run(&mut self) -> Result<(), BlockerError> {
        self.startup().await?;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => self.poll_cycle().await,
            }
        }
        self.shutdown().await;
        Ok(())
    }
}

async fn write_pid_file(path: &Path) -> Result<(), BlockerError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| BlockerError::ArtifactWrite(path.display().to_string(), e.to_string()))?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .await
        .map_err(|e| BlockerError::ArtifactWrite(path.display().to_string(), e.to_string()))?;
    Ok(())
}
