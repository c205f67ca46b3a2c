//! Structured pipeline events.
//!
//! Every state transition the controller wants to surface becomes an
//! [`Event`] with a closed [`EventKind`]. The [`EventEmitter`] fans each event
//! out to the log, an optional append-only JSONL file and an optional
//! in-process channel. Consumers re-derive progress from the typed payloads
//! ([`ProgressSnapshot::from_events`]) instead of matching on message text.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened. Serialized lower-case (`"download"`, `"pass"`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Search,
    Info,
    Download,
    Analysis,
    Fail,
    Pass,
    Progress,
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Search => "search",
            Self::Info => "info",
            Self::Download => "download",
            Self::Analysis => "analysis",
            Self::Fail => "fail",
            Self::Pass => "pass",
            Self::Progress => "progress",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter snapshot attached to `start`, `progress` and `complete` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub checked: usize,
    pub accepted: usize,
    pub target: usize,
}

/// One record of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Emission order within one emitter, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
    /// Run accession the event is about, when item-scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
}

/// Single-writer event fan-out. Owned by the controller thread.
#[derive(Debug, Default)]
pub struct EventEmitter {
    seq: u64,
    file: Option<(PathBuf, BufWriter<File>)>,
    channel: Option<Sender<Event>>,
}

impl EventEmitter {
    /// Emitter that only writes to the log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also append every event as one JSON line to `path` (created if missing).
    pub fn with_log_file(mut self, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some((path.to_path_buf(), BufWriter::new(file)));
        Ok(self)
    }

    /// Also forward every event to an in-process consumer.
    pub fn with_channel(mut self, sender: Sender<Event>) -> Self {
        self.channel = Some(sender);
        self
    }

    /// Number of events emitted so far
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    pub fn emit(&mut self, kind: EventKind, message: impl Into<String>) {
        self.push(kind, message.into(), None, None);
    }

    /// Event about one item (download, analysis, pass, fail).
    pub fn emit_item(&mut self, kind: EventKind, identifier: &str, message: impl Into<String>) {
        self.push(kind, message.into(), Some(identifier.to_string()), None);
    }

    /// Event carrying the current counters.
    pub fn emit_counters(&mut self, kind: EventKind, counters: Counters, message: impl Into<String>) {
        self.push(kind, message.into(), None, Some(counters));
    }

    fn push(
        &mut self,
        kind: EventKind,
        message: String,
        identifier: Option<String>,
        counters: Option<Counters>,
    ) {
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            timestamp: Utc::now(),
            kind,
            message,
            identifier,
            counters,
        };

        match kind {
            EventKind::Fail => log::warn!("[{kind}] {}", event.message),
            _ => log::info!("[{kind}] {}", event.message),
        }

        if let Some((path, writer)) = &mut self.file {
            if let Err(e) = write_line(writer, &event) {
                log::warn!(
                    "Event log {} unwritable, disabling it: {e}",
                    path.display()
                );
                self.file = None;
            }
        }

        if let Some(sender) = &self.channel {
            if sender.send(event).is_err() {
                log::debug!("Event receiver dropped, disabling channel");
                self.channel = None;
            }
        }
    }
}

fn write_line(writer: &mut BufWriter<File>, event: &Event) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, event).map_err(io::Error::other)?;
    writer.write_all(b"\n")?;
    // Flushed per event so a tailing monitor sees it immediately
    writer.flush()
}

/// Read a JSONL event log, skipping lines that don't parse.
pub fn read_event_log(path: &Path) -> io::Result<Vec<Event>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => log::debug!("{}:{}: skipping malformed event: {e}", path.display(), lineno + 1),
        }
    }
    Ok(events)
}

/// Progress folded from an event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub counters: Counters,
    pub passed: usize,
    /// `fail` events for items the gate inspected; download failures and
    /// run-level failures are not verdicts
    pub failed: usize,
    pub complete: bool,
    pub last_message: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    /// Fold the most recent run in `events` (everything from the last `start`).
    pub fn from_events(events: &[Event]) -> Self {
        let run_start = events
            .iter()
            .rposition(|e| e.kind == EventKind::Start)
            .unwrap_or(0);

        let mut snapshot = Self::default();
        let mut analysed = HashSet::new();
        for event in &events[run_start..] {
            match event.kind {
                EventKind::Analysis => {
                    if let Some(id) = &event.identifier {
                        analysed.insert(id.as_str());
                    }
                }
                EventKind::Pass => snapshot.passed += 1,
                EventKind::Fail => {
                    if event
                        .identifier
                        .as_deref()
                        .is_some_and(|id| analysed.contains(id))
                    {
                        snapshot.failed += 1;
                    }
                }
                EventKind::Complete => snapshot.complete = true,
                _ => {}
            }
            if let Some(counters) = event.counters {
                snapshot.counters = counters;
            }
            snapshot.last_message = Some(event.message.clone());
            snapshot.last_timestamp = Some(event.timestamp);
        }
        snapshot
    }

    /// Accepted share of checked items, in percent
    pub fn success_rate(&self) -> f64 {
        if self.counters.checked == 0 {
            0.0
        } else {
            self.counters.accepted as f64 / self.counters.checked as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn kind_serializes_lowercase() {
        let json = serde_json::to_string(&EventKind::Analysis).unwrap();
        assert_eq!(json, "\"analysis\"");
        let kind: EventKind = serde_json::from_str("\"complete\"").unwrap();
        assert_eq!(kind, EventKind::Complete);
    }

    #[test]
    fn channel_receives_in_emission_order() {
        let (tx, rx) = mpsc::channel();
        let mut emitter = EventEmitter::new().with_channel(tx);
        emitter.emit(EventKind::Start, "starting");
        emitter.emit_item(EventKind::Download, "SRR1", "downloaded SRR1.fastq.gz");
        emitter.emit_counters(
            EventKind::Progress,
            Counters {
                checked: 1,
                accepted: 0,
                target: 5,
            },
            "0/5",
        );
        drop(emitter);

        let events: Vec<Event> = rx.iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(events[1].identifier.as_deref(), Some("SRR1"));
        assert_eq!(events[2].counters.unwrap().target, 5);
    }

    #[test]
    fn dropped_receiver_is_not_fatal() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut emitter = EventEmitter::new().with_channel(tx);
        emitter.emit(EventKind::Info, "nobody listening");
        emitter.emit(EventKind::Info, "still fine");
        assert_eq!(emitter.emitted(), 2);
    }

    #[test]
    fn log_file_round_trip_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        {
            let mut emitter = EventEmitter::new().with_log_file(&path).unwrap();
            emitter.emit(EventKind::Start, "go");
            emitter.emit_item(EventKind::Pass, "SRR2", "passed");
        }
        // a monitor must tolerate partial / foreign lines
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "not json").unwrap();

        let events = read_event_log(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Start);
        assert_eq!(events[1].kind, EventKind::Pass);
    }

    #[test]
    fn log_file_appends_across_emitters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        for _ in 0..2 {
            let mut emitter = EventEmitter::new().with_log_file(&path).unwrap();
            emitter.emit(EventKind::Start, "run");
        }
        assert_eq!(read_event_log(&path).unwrap().len(), 2);
    }

    fn event(seq: u64, kind: EventKind, counters: Option<Counters>) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind,
            message: format!("event {seq}"),
            identifier: None,
            counters,
        }
    }

    fn item_event(seq: u64, kind: EventKind, id: &str) -> Event {
        Event {
            identifier: Some(id.to_string()),
            ..event(seq, kind, None)
        }
    }

    #[test]
    fn snapshot_uses_latest_run_only() {
        let c = |checked, accepted| {
            Some(Counters {
                checked,
                accepted,
                target: 4,
            })
        };
        let events = vec![
            event(1, EventKind::Start, c(0, 0)),
            event(2, EventKind::Pass, None),
            event(3, EventKind::Complete, c(10, 9)),
            event(1, EventKind::Start, c(0, 0)),
            item_event(2, EventKind::Analysis, "SRR1"),
            item_event(3, EventKind::Pass, "SRR1"),
            item_event(4, EventKind::Analysis, "SRR2"),
            item_event(5, EventKind::Fail, "SRR2"),
            event(6, EventKind::Progress, c(2, 1)),
        ];
        let snap = ProgressSnapshot::from_events(&events);
        assert_eq!(snap.passed, 1);
        assert_eq!(snap.failed, 1);
        assert!(!snap.complete);
        assert_eq!(snap.counters.checked, 2);
        assert_eq!(snap.counters.accepted, 1);
        assert!((snap.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_counts_only_gate_failures() {
        let events = vec![
            event(1, EventKind::Start, None),
            item_event(2, EventKind::Fail, "SRR1"),
            item_event(3, EventKind::Analysis, "SRR2"),
            item_event(4, EventKind::Fail, "SRR2"),
            event(5, EventKind::Fail, None),
        ];
        let snap = ProgressSnapshot::from_events(&events);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.passed, 0);
    }

    #[test]
    fn snapshot_of_empty_stream() {
        let snap = ProgressSnapshot::from_events(&[]);
        assert_eq!(snap, ProgressSnapshot::default());
        assert_eq!(snap.success_rate(), 0.0);
    }
}
