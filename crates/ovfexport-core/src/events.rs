//! Export events and their delivery point.
//!
//! Every notification raised while a job runs, from the orchestrator or from
//! deep inside the disk copy engine, is a [`TransferEvent`] handed to one
//! [`EventSink`]. The sink delivers events one at a time in emission order,
//! either into a crossbeam channel drained by the caller or into a callback.

use crossbeam_channel::{Receiver, Sender};

/// The kind of an export event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Bytes were moved for the subject.
    Progress,
    /// The subject entered a new transfer stage.
    StageChanged,
    /// Something was skipped or adjusted; the export continues.
    Warning,
    /// The subject failed; the export stops.
    Failure,
    /// The whole export completed.
    Complete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Progress => write!(f, "Progress"),
            EventKind::StageChanged => write!(f, "StageChanged"),
            EventKind::Warning => write!(f, "Warning"),
            EventKind::Failure => write!(f, "Failure"),
            EventKind::Complete => write!(f, "Complete"),
        }
    }
}

/// Stage of a single disk transfer.
///
/// Within one disk task stages are always reported in declaration order,
/// with `Verifying` present only when verification was requested and
/// `Teardown` always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Setup,
    Streaming,
    Verifying,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Streaming => write!(f, "streaming"),
            Stage::Verifying => write!(f, "verifying"),
            Stage::Teardown => write!(f, "teardown"),
        }
    }
}

/// Byte counters attached to progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteProgress {
    /// Bytes copied so far.
    pub bytes_done: u64,
    /// Bytes expected in total.
    pub bytes_total: u64,
}

impl ByteProgress {
    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
    }
}

/// A single notification about an export in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub kind: EventKind,
    /// What the event is about: an image filename, a VM, or the export.
    pub subject: String,
    pub message: String,
    /// Rendered underlying error, for failures.
    pub cause: Option<String>,
    /// Set on `StageChanged` events.
    pub stage: Option<Stage>,
    /// Set on `Progress` events.
    pub progress: Option<ByteProgress>,
}

impl TransferEvent {
    fn new(kind: EventKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
            cause: None,
            stage: None,
            progress: None,
        }
    }

    pub fn progress(subject: impl Into<String>, bytes_done: u64, bytes_total: u64) -> Self {
        let mut event = Self::new(
            EventKind::Progress,
            subject,
            format!("{} of {} bytes", bytes_done, bytes_total),
        );
        event.progress = Some(ByteProgress {
            bytes_done,
            bytes_total,
        });
        event
    }

    pub fn stage(subject: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::StageChanged, subject, message);
        event.stage = Some(stage);
        event
    }

    pub fn warning(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Warning, subject, message)
    }

    pub fn failure(
        subject: impl Into<String>,
        message: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        let mut event = Self::new(EventKind::Failure, subject, message);
        event.cause = Some(cause.to_string());
        event
    }

    pub fn complete(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Complete, subject, message)
    }
}

/// Type alias for callback-style event observers.
pub type EventCallback = Box<dyn Fn(&TransferEvent) + Send>;

enum Target {
    Channel(Sender<TransferEvent>),
    Callback(EventCallback),
    Discard,
}

/// The single delivery point for a job's events.
pub struct EventSink {
    target: Target,
}

impl EventSink {
    /// Create a sink backed by an unbounded channel, returning the receiving end.
    ///
    /// The receiver disconnects once the sink (and the exporter owning it)
    /// is dropped, so `receiver.iter()` ends when the job is over.
    pub fn channel() -> (Self, Receiver<TransferEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                target: Target::Channel(tx),
            },
            rx,
        )
    }

    /// Create a sink that invokes `callback` for each event on the emitting thread.
    pub fn callback(callback: impl Fn(&TransferEvent) + Send + 'static) -> Self {
        Self {
            target: Target::Callback(Box::new(callback)),
        }
    }

    /// Create a sink that only traces events.
    pub fn discard() -> Self {
        Self {
            target: Target::Discard,
        }
    }

    /// Deliver one event.
    pub fn emit(&self, event: TransferEvent) {
        match event.kind {
            EventKind::Progress => {
                tracing::trace!(subject = %event.subject, "{}", event.message)
            }
            EventKind::StageChanged => {
                tracing::debug!(subject = %event.subject, stage = ?event.stage, "{}", event.message)
            }
            EventKind::Warning => tracing::warn!(subject = %event.subject, "{}", event.message),
            EventKind::Failure => tracing::error!(
                subject = %event.subject,
                cause = event.cause.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            EventKind::Complete => tracing::info!(subject = %event.subject, "{}", event.message),
        }

        match &self.target {
            Target::Channel(tx) => {
                if tx.send(event).is_err() {
                    tracing::debug!("event receiver dropped; event discarded");
                }
            }
            Target::Callback(callback) => callback(&event),
            Target::Discard => {}
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match self.target {
            Target::Channel(_) => "channel",
            Target::Callback(_) => "callback",
            Target::Discard => "discard",
        };
        f.debug_struct("EventSink").field("target", &target).finish()
    }
}
