//! Append-only, bounded, time-indexed event log.
//!
//! Events live in memory in id order. When a log path is configured every
//! event is also appended to a JSON-lines file and the store is rebuilt from
//! that file on open.

use crate::recovery::Severity;
use crate::utils::fs::{append_line, write_atomic};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_MAX_EVENTS: usize = 10_000;
pub const DEFAULT_MAX_BYTES: usize = 10_000_000;

const HIGH_FAILURE_RATE_LIMIT: usize = 5;
const SYSTEM_ERROR_LIMIT: usize = 2;
const CONTRADICTION_LIMIT: usize = 3;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EventType {
    Decision,
    Error,
    Contradiction,
    CircuitTransition,
    SystemError,
    CallBlocked,
    Recovery,
    ModeChange,
    ThresholdAdjusted,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnomalyKind {
    HighFailureRate,
    SystemErrors,
    HighContradictions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub count: usize,
    pub window_minutes: u64,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    exported_at: DateTime<Utc>,
    filter: Option<EventType>,
    count: usize,
    events: &'a [Event],
}

struct StoredEvent {
    event: Event,
    bytes: usize,
}

#[derive(Default)]
struct Inner {
    events: VecDeque<StoredEvent>,
    total_bytes: usize,
    next_id: u64,
    evicted_since_compaction: usize,
}

impl Inner {
    fn push(&mut self, event: Event, bytes: usize, max_events: usize, max_bytes: usize) -> usize {
        self.next_id = self.next_id.max(event.id.0 + 1);
        self.total_bytes += bytes;
        self.events.push_back(StoredEvent { event, bytes });

        let mut evicted = 0;
        while self.events.len() > max_events
            || (self.total_bytes > max_bytes && self.events.len() > 1)
        {
            let Some(oldest) = self.events.pop_front() else {
                break;
            };
            self.total_bytes -= oldest.bytes;
            evicted += 1;
        }
        self.evicted_since_compaction += evicted;
        evicted
    }

    fn cloned_where<F>(&self, keep: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        self.events
            .iter()
            .map(|stored| &stored.event)
            .filter(|event| keep(event))
            .cloned()
            .collect()
    }
}

/// Bounded FIFO event log shared by every kernel component.
pub struct EventStore {
    inner: Mutex<Inner>,
    max_events: usize,
    max_bytes: usize,
    log_path: Option<PathBuf>,
}

impl EventStore {
    /// Memory-only store.
    pub fn in_memory(max_events: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
            max_events: max_events.max(1),
            max_bytes: max_bytes.max(1),
            log_path: None,
        }
    }

    /// Store backed by a JSON-lines file, replaying whatever it already holds.
    pub fn open(path: impl Into<PathBuf>, max_events: usize, max_bytes: usize) -> io::Result<Self> {
        let path = path.into();
        let mut store = Self::in_memory(max_events, max_bytes);

        match fs::read_to_string(&path) {
            Ok(raw) => {
                let mut skipped = 0usize;
                let inner = store.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
                for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<Event>(line) {
                        Ok(event) => {
                            inner.push(event, line.len() + 1, store.max_events, store.max_bytes);
                        }
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    tracing::warn!(
                        path = %path.display(),
                        skipped,
                        "skipped unparseable event log lines"
                    );
                }
                tracing::debug!(
                    path = %path.display(),
                    events = inner.events.len(),
                    "event log replayed"
                );
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }

        store.log_path = Some(path);
        Ok(store)
    }

    pub fn from_config(config: &crate::config::Config) -> io::Result<Self> {
        let events = &config.events;
        if events.persist {
            Self::open(config.events_file(), events.max_events, events.max_bytes)
        } else {
            Ok(Self::in_memory(events.max_events, events.max_bytes))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Append an event and return its id. Non-object payloads are wrapped
    /// under a `value` key.
    pub fn append(&self, kind: EventType, source: &str, payload: Value) -> EventId {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };

        let mut inner = self.lock();
        let event = Event {
            id: EventId(inner.next_id),
            kind,
            timestamp: Utc::now(),
            source: source.to_string(),
            payload,
        };
        let id = event.id;
        let line = serde_json::to_string(&event).unwrap_or_default();

        if let Some(path) = &self.log_path
            && let Err(error) = append_line(path, &line)
        {
            tracing::warn!(path = %path.display(), %error, "event log append failed");
        }

        inner.push(event, line.len() + 1, self.max_events, self.max_bytes);
        if inner.evicted_since_compaction >= self.max_events.div_ceil(2) {
            self.compact_locked(&mut inner);
        }
        id
    }

    /// Events in ascending id order, optionally filtered by type and age.
    pub fn query(&self, kind: Option<EventType>, since_minutes: Option<u64>) -> Vec<Event> {
        let cutoff = since_minutes.map(minutes_ago);
        self.lock().cloned_where(|event| {
            kind.is_none_or(|k| event.kind == k) && cutoff.is_none_or(|c| event.timestamp >= c)
        })
    }

    /// Drop events older than `older_than_days` and record a maintenance
    /// summary. Returns the number of deleted events.
    pub fn cleanup(&self, older_than_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let deleted = {
            let mut inner = self.lock();
            let before = inner.events.len();
            inner.events.retain(|stored| stored.event.timestamp >= cutoff);
            inner.total_bytes = inner.events.iter().map(|s| s.bytes).sum();
            let deleted = before - inner.events.len();
            if deleted > 0 {
                self.compact_locked(&mut inner);
            }
            deleted
        };

        tracing::info!(deleted, older_than_days, "event retention cleanup");
        self.append(
            EventType::Maintenance,
            "events",
            serde_json::json!({
                "action": "cleanup",
                "deleted": deleted,
                "older_than_days": older_than_days,
            }),
        );
        deleted
    }

    pub fn count_contradictions(&self, window_minutes: u64) -> usize {
        self.count_since(EventType::Contradiction, window_minutes)
    }

    fn count_since(&self, kind: EventType, window_minutes: u64) -> usize {
        let cutoff = minutes_ago(window_minutes);
        self.lock()
            .events
            .iter()
            .filter(|s| s.event.kind == kind && s.event.timestamp >= cutoff)
            .count()
    }

    /// Last `n` decision events, oldest first.
    pub fn recent_decisions(&self, n: usize) -> Vec<Event> {
        let inner = self.lock();
        let mut recent: Vec<Event> = inner
            .events
            .iter()
            .rev()
            .filter(|s| s.event.kind == EventType::Decision)
            .take(n)
            .map(|s| s.event.clone())
            .collect();
        recent.reverse();
        recent
    }

    pub fn latest(&self, kind: EventType) -> Option<Event> {
        self.lock()
            .events
            .iter()
            .rev()
            .find(|s| s.event.kind == kind)
            .map(|s| s.event.clone())
    }

    pub fn detect_anomalies(&self, window_minutes: u64) -> Vec<Anomaly> {
        let rules = [
            (
                EventType::Error,
                HIGH_FAILURE_RATE_LIMIT,
                AnomalyKind::HighFailureRate,
                Severity::High,
            ),
            (
                EventType::SystemError,
                SYSTEM_ERROR_LIMIT,
                AnomalyKind::SystemErrors,
                Severity::Critical,
            ),
            (
                EventType::Contradiction,
                CONTRADICTION_LIMIT,
                AnomalyKind::HighContradictions,
                Severity::Medium,
            ),
        ];

        rules
            .into_iter()
            .filter_map(|(event_kind, limit, kind, severity)| {
                let count = self.count_since(event_kind, window_minutes);
                (count > limit).then_some(Anomaly {
                    kind,
                    severity,
                    count,
                    window_minutes,
                })
            })
            .collect()
    }

    /// Write a JSON export of the (optionally filtered) log to `path`.
    pub fn export(&self, path: &Path, kind: Option<EventType>) -> io::Result<usize> {
        let events = self.query(kind, None);
        let document = ExportDocument {
            exported_at: Utc::now(),
            filter: kind,
            count: events.len(),
            events: &events,
        };
        let rendered = serde_json::to_vec_pretty(&document).map_err(io::Error::other)?;
        write_atomic(path, &rendered)?;
        Ok(events.len())
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    fn compact_locked(&self, inner: &mut Inner) {
        inner.evicted_since_compaction = 0;
        let Some(path) = &self.log_path else {
            return;
        };
        let mut body = String::new();
        for stored in &inner.events {
            if let Ok(line) = serde_json::to_string(&stored.event) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        match write_atomic(path, body.as_bytes()) {
            Ok(()) => tracing::debug!(path = %path.display(), "event log compacted"),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "event log compaction failed");
            }
        }
    }
}

fn minutes_ago(minutes: u64) -> DateTime<Utc> {
    let minutes = i64::try_from(minutes).unwrap_or(i64::MAX / 60_000);
    Utc::now() - Duration::minutes(minutes)
}
