//! Per-unit lifecycle events for an external orchestrator.

use crate::utils::errors::Phase;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Why a unit produced no upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Remote fingerprint matches and the archive is present
    Unchanged,
    /// No files in scope
    Empty,
    /// Dry run; nothing was contacted
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    #[serde(rename = "unit:started")]
    Started,

    #[serde(rename = "unit:succeeded")]
    Succeeded {
        fingerprint: String,
        files: usize,
        archive_bytes: u64,
    },

    #[serde(rename = "unit:skipped")]
    Skipped { reason: SkipReason },

    #[serde(rename = "unit:failed")]
    Failed { phase: Option<Phase>, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitEvent {
    pub unit: String,

    #[serde(flatten)]
    pub kind: EventKind,
}

impl UnitEvent {
    pub fn new(unit: impl Into<String>, kind: EventKind) -> Self {
        Self {
            unit: unit.into(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, EventKind::Started)
    }
}

/// Receives every unit event. Called once with `Started` and once with the
/// outcome for each unit.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &UnitEvent);
}

/// Send events to two sinks.
impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn emit(&self, event: &UnitEvent) {
        self.0.emit(event);
        self.1.emit(event);
    }
}

/// Logs events through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &UnitEvent) {
        match &event.kind {
            EventKind::Started => info!("Processing unit: {}", event.unit),
            EventKind::Succeeded {
                fingerprint,
                files,
                archive_bytes,
            } => info!(
                "Unit {} uploaded ({} files, {} bytes, fingerprint {})",
                event.unit, files, archive_bytes, fingerprint
            ),
            EventKind::Skipped { reason: SkipReason::Unchanged } => {
                info!("Unit {} unchanged, skipping", event.unit)
            }
            EventKind::Skipped { reason: SkipReason::Empty } => {
                warn!("Unit {} has no files, skipping", event.unit)
            }
            EventKind::Skipped { reason: SkipReason::DryRun } => {}
            EventKind::Failed { phase, error } => match phase {
                Some(phase) => error!("Unit {} failed during {}: {}", event.unit, phase, error),
                None => error!("Unit {} failed: {}", event.unit, error),
            },
        }
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &UnitEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize event for {}: {}", event.unit, e);
                return;
            }
        };

        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!("Failed to write event for {}: {}", event.unit, e);
        }
    }
}
