//! Session-correlated structured flow log.
//!
//! Every query emits a chronological series of [`FlowEvent`]s tagged with
//! the session UUID. Events are pushed through a bounded queue onto an
//! append-only text file, so the hot path never blocks on disk: when the
//! queue is full, events are dropped and a single `LOG_OVERFLOW` marker is
//! written once the queue drains.
//!
//! Detail levels:
//! - `minimal` — one header line per event.
//! - `normal` — full block with metadata values truncated to 500 chars.
//! - `verbose` — full content; a block parses back to an identical event.
//!
//! The [`analyzer`] submodule reads the file back for per-session
//! inspection, timing statistics, error and slow-operation extraction, and
//! JSON/CSV export.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

const BLOCK_RULE: &str =
    "================================================================================";
const FIELD_RULE: &str =
    "--------------------------------------------------------------------------------";

/// Queue capacity between emitters and the writer task.
const QUEUE_CAPACITY: usize = 1024;

/// Metadata value cap at `normal` detail.
const NORMAL_TRUNCATE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEventKind {
    QueryStart,
    QueryAnalysis,
    ToolSelection,
    ToolExecution,
    LlmCall,
    QueryComplete,
    Error,
    LogOverflow,
}

impl FlowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowEventKind::QueryStart => "QUERY_START",
            FlowEventKind::QueryAnalysis => "QUERY_ANALYSIS",
            FlowEventKind::ToolSelection => "TOOL_SELECTION",
            FlowEventKind::ToolExecution => "TOOL_EXECUTION",
            FlowEventKind::LlmCall => "LLM_CALL",
            FlowEventKind::QueryComplete => "QUERY_COMPLETE",
            FlowEventKind::Error => "ERROR",
            FlowEventKind::LogOverflow => "LOG_OVERFLOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUERY_START" => Some(FlowEventKind::QueryStart),
            "QUERY_ANALYSIS" => Some(FlowEventKind::QueryAnalysis),
            "TOOL_SELECTION" => Some(FlowEventKind::ToolSelection),
            "TOOL_EXECUTION" => Some(FlowEventKind::ToolExecution),
            "LLM_CALL" => Some(FlowEventKind::LlmCall),
            "QUERY_COMPLETE" => Some(FlowEventKind::QueryComplete),
            "ERROR" => Some(FlowEventKind::Error),
            "LOG_OVERFLOW" => Some(FlowEventKind::LogOverflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Success,
    Error,
    InProgress,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Success => "SUCCESS",
            FlowStatus::Error => "ERROR",
            FlowStatus::InProgress => "IN_PROGRESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(FlowStatus::Success),
            "ERROR" => Some(FlowStatus::Error),
            "IN_PROGRESS" => Some(FlowStatus::InProgress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Minimal,
    Normal,
    Verbose,
}

impl DetailLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minimal" => Some(DetailLevel::Minimal),
            "normal" => Some(DetailLevel::Normal),
            "verbose" => Some(DetailLevel::Verbose),
            _ => None,
        }
    }
}

/// One structured event on the query path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: FlowEventKind,
    /// Milliseconds since the session's `QUERY_START`.
    pub elapsed_ms: u64,
    /// Duration of the operation this event closes, if any.
    pub duration_ms: Option<u64>,
    pub status: FlowStatus,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FlowEvent {
    pub fn new(session_id: &str, kind: FlowEventKind, status: FlowStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            kind,
            elapsed_ms: 0,
            duration_ms: None,
            status,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn elapsed(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Bounded-queue, append-only flow logger.
pub struct FlowLogger {
    tx: mpsc::Sender<WriterMessage>,
    overflowed: Arc<AtomicBool>,
    path: PathBuf,
}

enum WriterMessage {
    Event(Box<FlowEvent>),
    Flush(oneshot::Sender<()>),
}

impl FlowLogger {
    /// Open (or create) the log file and start the writer task.
    pub fn start(path: &Path, detail: DetailLevel) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (tx, mut rx) = mpsc::channel::<WriterMessage>(QUEUE_CAPACITY);
        let file_path = path.to_path_buf();

        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(path = %file_path.display(), error = %e, "flow log unavailable");
                    // Drain so emitters never block.
                    while rx.recv().await.is_some() {}
                    return;
                }
            };

            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Event(event) => {
                        let block = format_event(&event, detail);
                        if let Err(e) = file.write_all(block.as_bytes()).await {
                            tracing::warn!(error = %e, "flow log write failed");
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        let _ = file.flush().await;
                        let _ = ack.send(());
                    }
                }
            }
            let _ = file.flush().await;
        });

        Ok(Self {
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue an event. Never blocks: a full queue drops the event and
    /// arranges for a single `LOG_OVERFLOW` marker.
    pub fn emit(&self, event: FlowEvent) {
        if self.overflowed.swap(false, Ordering::SeqCst) {
            let marker = FlowEvent::new(&event.session_id, FlowEventKind::LogOverflow, FlowStatus::Error)
                .meta("note", "events were dropped due to queue overflow");
            if self
                .tx
                .try_send(WriterMessage::Event(Box::new(marker)))
                .is_err()
            {
                self.overflowed.store(true, Ordering::SeqCst);
            }
        }

        if self.tx.try_send(WriterMessage::Event(Box::new(event))).is_err() {
            self.overflowed.store(true, Ordering::SeqCst);
        }
    }

    /// Wait until everything enqueued so far is on disk.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Render one event at the requested detail level.
pub fn format_event(event: &FlowEvent, detail: DetailLevel) -> String {
    let header = format!(
        "[{}] {} (Session: {}) [+{:.3}s]",
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.kind.as_str(),
        event.session_id,
        event.elapsed_ms as f64 / 1000.0,
    );

    if detail == DetailLevel::Minimal {
        return format!("{header} {}\n", event.status.as_str());
    }

    let mut out = String::new();
    out.push_str(BLOCK_RULE);
    out.push('\n');
    out.push_str(&header);
    out.push('\n');
    out.push_str(FIELD_RULE);
    out.push('\n');
    out.push_str(&format!("status: {}\n", event.status.as_str()));
    if let Some(duration) = event.duration_ms {
        out.push_str(&format!("duration_ms: {duration}\n"));
    }
    for (key, value) in &event.metadata {
        let rendered = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        let rendered = if detail == DetailLevel::Normal {
            truncate_chars(&rendered, NORMAL_TRUNCATE_CHARS)
        } else {
            rendered
        };
        out.push_str(&format!("{key}: {rendered}\n"));
    }
    out.push_str(BLOCK_RULE);
    out.push('\n');
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Parse a log file produced at `normal` or `verbose` detail back into
/// events. At `verbose`, parsing is lossless.
pub fn parse_log(text: &str) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if line != BLOCK_RULE {
            continue;
        }
        let Some(header) = lines.next() else { break };
        let Some(mut event) = parse_header(header) else {
            continue;
        };
        // Field rule line.
        if lines.peek() == Some(&FIELD_RULE) {
            lines.next();
        }
        for body_line in lines.by_ref() {
            if body_line == BLOCK_RULE {
                break;
            }
            let Some((key, value)) = body_line.split_once(": ") else {
                continue;
            };
            match key {
                "status" => {
                    if let Some(status) = FlowStatus::parse(value) {
                        event.status = status;
                    }
                }
                "duration_ms" => {
                    event.duration_ms = value.parse().ok();
                }
                _ => {
                    let parsed = serde_json::from_str(value)
                        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
                    event.metadata.insert(key.to_string(), parsed);
                }
            }
        }
        events.push(event);
    }
    events
}

fn parse_header(line: &str) -> Option<FlowEvent> {
    let rest = line.strip_prefix('[')?;
    let (timestamp_str, rest) = rest.split_once("] ")?;
    let (kind_str, rest) = rest.split_once(" (Session: ")?;
    let (session_id, rest) = rest.split_once(')')?;
    let elapsed_str = rest.trim().strip_prefix("[+")?.strip_suffix("s]")?;

    let naive = NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.3f").ok()?;
    let elapsed_s: f64 = elapsed_str.parse().ok()?;

    Some(FlowEvent {
        timestamp: naive.and_utc(),
        session_id: session_id.to_string(),
        kind: FlowEventKind::parse(kind_str)?,
        elapsed_ms: (elapsed_s * 1000.0).round() as u64,
        duration_ms: None,
        status: FlowStatus::InProgress,
        metadata: serde_json::Map::new(),
    })
}

// ============ Analyzer ============

pub mod analyzer {
    use super::*;
    use std::collections::BTreeMap;

    /// Timing summary for one event kind.
    #[derive(Debug, Clone, Serialize)]
    pub struct TimingStats {
        pub count: usize,
        pub avg_ms: f64,
        pub min_ms: u64,
        pub max_ms: u64,
        pub p95_ms: u64,
    }

    /// Post-hoc view over a parsed flow log.
    pub struct FlowAnalyzer {
        events: Vec<FlowEvent>,
    }

    impl FlowAnalyzer {
        pub fn from_file(path: &Path) -> Result<Self> {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Internal(format!("{}: {e}", path.display())))?;
            Ok(Self {
                events: parse_log(&text),
            })
        }

        pub fn from_events(events: Vec<FlowEvent>) -> Self {
            Self { events }
        }

        pub fn events(&self) -> &[FlowEvent] {
            &self.events
        }

        /// Chronological events of one session.
        pub fn session(&self, session_id: &str) -> Vec<&FlowEvent> {
            self.events
                .iter()
                .filter(|e| e.session_id == session_id)
                .collect()
        }

        /// Per-kind timing statistics over events carrying a duration.
        pub fn timing_stats(&self) -> BTreeMap<&'static str, TimingStats> {
            let mut grouped: BTreeMap<&'static str, Vec<u64>> = BTreeMap::new();
            for event in &self.events {
                if let Some(duration) = event.duration_ms {
                    grouped.entry(event.kind.as_str()).or_default().push(duration);
                }
            }

            grouped
                .into_iter()
                .map(|(kind, mut durations)| {
                    durations.sort_unstable();
                    let count = durations.len();
                    let sum: u64 = durations.iter().sum();
                    let p95_index = ((count as f64 * 0.95).ceil() as usize).saturating_sub(1);
                    (
                        kind,
                        TimingStats {
                            count,
                            avg_ms: sum as f64 / count as f64,
                            min_ms: durations[0],
                            max_ms: durations[count - 1],
                            p95_ms: durations[p95_index],
                        },
                    )
                })
                .collect()
        }

        pub fn errors(&self) -> Vec<&FlowEvent> {
            self.events
                .iter()
                .filter(|e| e.status == FlowStatus::Error)
                .collect()
        }

        /// Events whose duration exceeds the threshold, slowest first.
        pub fn slow_operations(&self, threshold_ms: u64) -> Vec<&FlowEvent> {
            let mut slow: Vec<&FlowEvent> = self
                .events
                .iter()
                .filter(|e| e.duration_ms.map(|d| d > threshold_ms).unwrap_or(false))
                .collect();
            slow.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
            slow
        }

        pub fn export_json(&self) -> Result<String> {
            Ok(serde_json::to_string_pretty(&self.events)?)
        }

        pub fn export_csv(&self) -> String {
            let mut out =
                String::from("timestamp,session_id,event_type,elapsed_ms,duration_ms,status\n");
            for event in &self.events {
                out.push_str(&format!(
                    "{},{},{},{},{},{}\n",
                    event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    event.session_id,
                    event.kind.as_str(),
                    event.elapsed_ms,
                    event
                        .duration_ms
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    event.status.as_str(),
                ));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::analyzer::FlowAnalyzer;
    use super::*;
    use tempfile::TempDir;

    fn sample_event(session: &str) -> FlowEvent {
        FlowEvent {
            timestamp: DateTime::parse_from_rfc3339("2026-08-01T10:30:00.123Z")
                .unwrap()
                .with_timezone(&Utc),
            session_id: session.to_string(),
            kind: FlowEventKind::ToolExecution,
            elapsed_ms: 1234,
            duration_ms: Some(456),
            status: FlowStatus::Success,
            metadata: {
                let mut m = serde_json::Map::new();
                m.insert("tool".to_string(), serde_json::json!("search_knowledge_base"));
                m.insert("hits".to_string(), serde_json::json!(3));
                m.insert("query".to_string(), serde_json::json!("李小勇 partner\nsecond line"));
                m
            },
        }
    }

    #[test]
    fn verbose_block_roundtrip_is_lossless() {
        let event = sample_event("sess-1");
        let block = format_event(&event, DetailLevel::Verbose);
        let parsed = parse_log(&block);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], event);
    }

    #[test]
    fn minimal_is_single_line() {
        let event = sample_event("sess-1");
        let line = format_event(&event, DetailLevel::Minimal);
        assert_eq!(line.lines().count(), 1);
        assert!(line.contains("TOOL_EXECUTION"));
        assert!(line.contains("SUCCESS"));
        assert!(line.contains("(Session: sess-1)"));
    }

    #[test]
    fn normal_truncates_long_values() {
        let mut event = sample_event("sess-1");
        event
            .metadata
            .insert("answer".to_string(), serde_json::json!("x".repeat(2000)));
        let block = format_event(&event, DetailLevel::Normal);
        let answer_line = block
            .lines()
            .find(|l| l.starts_with("answer: "))
            .unwrap();
        assert!(answer_line.chars().count() <= 500 + "answer: ".len());
        assert!(answer_line.ends_with("..."));

        // Verbose keeps the full value.
        let verbose = format_event(&event, DetailLevel::Verbose);
        let full_line = verbose
            .lines()
            .find(|l| l.starts_with("answer: "))
            .unwrap();
        assert!(full_line.chars().count() > 2000);
    }

    #[test]
    fn block_layout_matches_persisted_format() {
        let block = format_event(&sample_event("sess-1"), DetailLevel::Verbose);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines[0], BLOCK_RULE);
        assert!(lines[1].starts_with("[2026-08-01 10:30:00.123] TOOL_EXECUTION (Session: sess-1) [+1.234s]"));
        assert_eq!(lines[2], FIELD_RULE);
        assert_eq!(*lines.last().unwrap(), BLOCK_RULE);
    }

    #[tokio::test]
    async fn logger_appends_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.log");
        let logger = FlowLogger::start(&path, DetailLevel::Verbose).unwrap();

        logger.emit(sample_event("sess-a"));
        logger.emit(sample_event("sess-b"));
        logger.flush().await;

        let text = std::fs::read_to_string(&path).unwrap();
        let events = parse_log(&text);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].session_id, "sess-a");
        assert_eq!(events[1].session_id, "sess-b");
    }

    #[test]
    fn analyzer_session_filter_and_errors() {
        let mut failed = sample_event("sess-b");
        failed.kind = FlowEventKind::Error;
        failed.status = FlowStatus::Error;

        let analyzer = FlowAnalyzer::from_events(vec![
            sample_event("sess-a"),
            sample_event("sess-a"),
            failed,
        ]);

        assert_eq!(analyzer.session("sess-a").len(), 2);
        assert_eq!(analyzer.session("sess-b").len(), 1);
        assert_eq!(analyzer.errors().len(), 1);
        assert_eq!(analyzer.errors()[0].session_id, "sess-b");
    }

    #[test]
    fn analyzer_timing_stats() {
        let durations = [100u64, 200, 300, 400, 1000];
        let events: Vec<FlowEvent> = durations
            .iter()
            .map(|d| {
                let mut e = sample_event("sess-a");
                e.duration_ms = Some(*d);
                e
            })
            .collect();

        let analyzer = FlowAnalyzer::from_events(events);
        let stats = analyzer.timing_stats();
        let tool = &stats["TOOL_EXECUTION"];
        assert_eq!(tool.count, 5);
        assert_eq!(tool.min_ms, 100);
        assert_eq!(tool.max_ms, 1000);
        assert!((tool.avg_ms - 400.0).abs() < 1e-9);
        assert_eq!(tool.p95_ms, 1000);
    }

    #[test]
    fn analyzer_slow_operations_sorted() {
        let durations = [50u64, 500, 5000];
        let events: Vec<FlowEvent> = durations
            .iter()
            .map(|d| {
                let mut e = sample_event("sess-a");
                e.duration_ms = Some(*d);
                e
            })
            .collect();

        let analyzer = FlowAnalyzer::from_events(events);
        let slow = analyzer.slow_operations(100);
        assert_eq!(slow.len(), 2);
        assert_eq!(slow[0].duration_ms, Some(5000));
        assert_eq!(slow[1].duration_ms, Some(500));
    }

    #[test]
    fn export_json_and_csv() {
        let analyzer = FlowAnalyzer::from_events(vec![sample_event("sess-a")]);

        let json = analyzer.export_json().unwrap();
        let parsed: Vec<FlowEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, FlowEventKind::ToolExecution);

        let csv = analyzer.export_csv();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,session_id,event_type,elapsed_ms,duration_ms,status"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("TOOL_EXECUTION"));
        assert!(row.contains("sess-a"));
        assert!(row.contains("456"));
    }

    #[test]
    fn parse_ignores_garbage_between_blocks() {
        let event = sample_event("sess-a");
        let block = format_event(&event, DetailLevel::Verbose);
        let noisy = format!("random preamble\n{block}trailing noise\n{block}");
        let parsed = parse_log(&noisy);
        assert_eq!(parsed.len(), 2);
    }
}
