//! Incremental event log consumption.
//!
//! The proxy is the only writer and this tailer holds the only read cursor.
//! The cursor advances strictly past fully `\n`-terminated lines: a partial
//! line at EOF stays unconsumed until the terminator lands, so a record is
//! never observed as a truncated fragment.

use crate::state::BlockerState;
use sitefence_domain::event::{parse_line, EventRecord};
use sitefence_domain::BlockerError;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace};

/// Reads and classifies every newly appended, fully terminated event line.
///
/// A missing log file is not an error: the proxy may start after the
/// blocker. Malformed lines are skipped silently, advancing only past
/// their bytes. Returns the number of parsed events.
pub async fn consume_new_events(state: &mut BlockerState) -> Result<usize, BlockerError> {
    let mut file = match File::open(&state.events_log).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(BlockerError::LogRead(
                state.events_log.display().to_string(),
                e.to_string(),
            ))
        }
    };

    file.seek(SeekFrom::Start(state.cursor)).await.map_err(|e| {
        BlockerError::LogRead(state.events_log.display().to_string(), e.to_string())
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.map_err(|e| {
        BlockerError::LogRead(state.events_log.display().to_string(), e.to_string())
    })?;

    let mut consumed = 0usize;
    let mut parsed = 0usize;
    while let Some(newline) = buf[consumed..].iter().position(|&b| b == b'\n') {
        let line_bytes = &buf[consumed..consumed + newline];
        consumed += newline + 1;

        let line = String::from_utf8_lossy(line_bytes);
        match parse_line(&line) {
            Some(record) => {
                apply_event(state, record);
                parsed += 1;
            }
            None => trace!(line = %line, "Skipping malformed event line"),
        }
    }

    state.cursor += consumed as u64;
    if parsed > 0 {
        debug!(
            parsed,
            cursor = state.cursor,
            target_ips = state.target_ips.len(),
            "Consumed new events"
        );
    }
    Ok(parsed)
}

fn apply_event(state: &mut BlockerState, record: EventRecord) {
    state.total_events += 1;
    state.observed_domains.insert(record.domain.clone());

    if state.is_target(&record.domain) {
        state.target_query_seen = true;
        if !record.ips.is_empty() {
            state.target_answer_seen = true;
        }
        state.target_ips.extend(record.ips.iter().cloned());
        state.target_events.push(record);
    } else {
        state.unblocked_domains.insert(record.domain);
    }
}
