use serde::Serialize;
use sitefence_domain::event::EventRecord;
use sitefence_domain::ProxyError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-domain aggregates flushed to the history map at shutdown.
#[derive(Debug, Default, Serialize)]
struct DomainHistory {
    times: Vec<String>,
    ips: BTreeSet<String>,
}

struct StateInner {
    event_log: File,
    history: BTreeMap<String, DomainHistory>,
    query_count: u64,
}

/// Shared proxy aggregate state: the open event log plus per-domain
/// timestamp and IP histories, all mutated under one lock so no two event
/// emissions interleave their writes.
pub struct ProxyState {
    inner: Mutex<StateInner>,
    events_path: PathBuf,
    history_path: PathBuf,
}

impl ProxyState {
    /// Creates the log directory and the session's event log file.
    pub async fn create(log_dir: &Path, run_stamp: &str) -> Result<Self, ProxyError> {
        fs::create_dir_all(log_dir).await.map_err(|e| {
            ProxyError::LogCreate(log_dir.display().to_string(), e.to_string())
        })?;

        let events_path = log_dir.join(format!("dns_events_{run_stamp}.log"));
        let history_path = log_dir.join(format!("domain_history_{run_stamp}.json"));
        let event_log = File::create(&events_path).await.map_err(|e| {
            ProxyError::LogCreate(events_path.display().to_string(), e.to_string())
        })?;

        info!(events_log = %events_path.display(), "Event log created");

        Ok(Self {
            inner: Mutex::new(StateInner {
                event_log,
                history: BTreeMap::new(),
                query_count: 0,
            }),
            events_path,
            history_path,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Appends one event line and folds the record into the aggregates.
    ///
    /// A failed log write is non-fatal: the client already got its answer
    /// and the in-memory aggregates still advance.
    pub async fn record_event(&self, domain: &str, ips: &[String]) {
        let record = EventRecord::new(domain, ips.to_vec());
        let mut line = record.render_line();
        line.push('\n');

        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.event_log.write_all(line.as_bytes()).await {
            warn!(error = %e, domain, "Failed to append event log line");
        } else if let Err(e) = inner.event_log.flush().await {
            warn!(error = %e, domain, "Failed to flush event log");
        }

        let entry = inner.history.entry(domain.to_string()).or_default();
        entry.times.push(record.observed_at);
        entry.ips.extend(ips.iter().cloned());
        inner.query_count += 1;

        debug!(domain, ips = ips.len(), "DNS exchange recorded");
    }

    pub async fn query_count(&self) -> u64 {
        self.inner.lock().await.query_count
    }

    /// Flushes the per-domain history map and closes out the session.
    pub async fn finalize(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.event_log.flush().await {
            warn!(error = %e, "Final event log flush failed");
        }

        let json = serde_json::to_string_pretty(&inner.history).map_err(|e| {
            ProxyError::ArtifactWrite(self.history_path.display().to_string(), e.to_string())
        })?;
        fs::write(&self.history_path, json).await.map_err(|e| {
            ProxyError::ArtifactWrite(self.history_path.display().to_string(), e.to_string())
        })?;

        info!(
            queries = inner.query_count,
            history = %self.history_path.display(),
            "Proxy session finalized"
        );
        Ok(())
    }
}
