//! Structured reporting of internal invariant breaks.
//!
//! Invariant breaks are not errors the caller can act on, but they are worth
//! more than a free-form log line. [`report_violation!`] builds a [`Violation`]
//! and hands it to the [`TracingObserver`], which logs it with structured fields.
//! Tests can install nothing and use [`CollectingObserver`] directly.
//!
//! ```
//! use rollback_netplay::report_violation;
//! use rollback_netplay::telemetry::{ViolationKind, ViolationSeverity};
//!
//! report_violation!(
//!     ViolationSeverity::Warning,
//!     ViolationKind::InputQueue,
//!     "dropping input for frame {}",
//!     12
//! );
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable, the operation continued with a fallback.
    Warning,
    /// The operation was refused or degraded.
    Error,
    /// State may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Frame counters disagree.
    FrameSync,
    /// Input queue ordering or confirmation rules.
    InputQueue,
    /// Snapshot ring bookkeeping.
    StateManagement,
    /// Peer-to-peer protocol handling.
    NetworkProtocol,
    /// Rendezvous server exchange.
    Traversal,
    /// Invalid configuration values.
    Configuration,
}

impl ViolationKind {
    /// Returns a string representation suitable for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputQueue => "input_queue",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::Traversal => "traversal",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reported violation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it happened.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The frame involved, if any.
    pub frame: Option<i32>,
    /// Extra key/value context.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a new violation without frame or context.
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the frame the violation relates to.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = (!frame.is_null()).then_some(frame.as_i32());
        self
    }

    /// Attaches a key/value pair of context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {})",
            self.severity, self.kind, self.message, self.location
        )
    }
}

/// Receives reported violations.
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &Violation);
}

/// Logs violations through `tracing` with structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = violation.frame.unwrap_or(crate::NULL_FRAME);
        let context = format!("{:?}", violation.context);

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame,
                    context = %context,
                    "{}",
                    violation.message
                );
            }
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame,
                    context = %context,
                    "{}",
                    violation.message
                );
            }
        }
    }
}

/// Collects violations in memory, mostly for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Checks if any violation of the given kind was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a [`Violation`] with the current file and line through the [`TracingObserver`].
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}
