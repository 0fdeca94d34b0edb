//! Structured reporting of broken contracts.
//!
//! Most things that go wrong inside a netplay session are not errors the caller can act on:
//! a snapshot that should exist but was never captured, a frame simulated on input that can
//! never be corrected, a cursor that overtook another. The session keeps running, but the
//! condition is worth recording. Such conditions are reported as [`Violation`]s to a
//! [`ViolationObserver`]:
//!
//! - [`TracingObserver`] (the default) logs them through `tracing`,
//! - [`CollectingObserver`] stores them so tests can assert on them,
//! - anything else implementing the trait (metrics, crash reporting) can be installed with
//!   [`SessionBuilder::with_violation_observer`](crate::SessionBuilder::with_violation_observer).
//!
//! ```
//! use delta_rollback::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // ... hand a clone to the session builder, run some frames ...
//! assert!(!observer.has_violation(ViolationKind::StateManagement));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::sync::Arc;

/// Writes `Option<Frame>` as a plain integer, or `null` for `None` and [`Frame::NULL`].
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if !f.is_null() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// The session worked around the problem.
    Warning,
    /// The session continued, but peers may diverge.
    Error,
    /// Internal bookkeeping is inconsistent.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
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

/// The subsystem a violation belongs to.
///
/// This enum is `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// The timeline advanced in a way that cannot be reconciled, e.g. a frame simulated on
    /// predicted input while rollback is unavailable.
    FrameSync,
    /// A snapshot slot was missing, stale or still in use when it was needed.
    StateManagement,
    /// A type's internal invariants were broken. Only checked in debug builds or with the
    /// `paranoid` feature.
    Invariant,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::StateManagement => "state_management",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded violation.
///
/// Serializes with the frame as a plain integer (or `null`), which keeps JSON log lines
/// easy to query.
///
/// ```
/// use delta_rollback::telemetry::{Violation, ViolationKind, ViolationSeverity};
/// use delta_rollback::Frame;
///
/// let violation = Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::StateManagement,
///     "slot still holds an unverified frame",
///     "session.rs:10",
/// )
/// .with_frame(Frame::new(12));
///
/// assert_eq!(violation.frame, Some(Frame::new(12)));
/// assert!(violation.to_string().contains("frame=12"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The frame at which the violation occurred, if applicable.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
}

impl Violation {
    /// Creates a new violation.
    #[must_use]
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
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Serializes this violation to a single JSON line.
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
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        write!(f, ")")
    }
}

/// Receives violations reported by a session.
///
/// Observers are called synchronously from inside Pre-Step and Post-Step, so they
/// should return quickly.
///
/// ```
/// use delta_rollback::telemetry::{Violation, ViolationObserver};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl ViolationObserver for Counter {
///     fn on_violation(&self, _violation: &Violation) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &Violation);
}

/// Receives violations reported by a session.
///
/// Observers are called synchronously from inside Pre-Step and Post-Step, so they
/// should return quickly.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &Violation);
}

/// Default observer: logs through `tracing`.
///
/// `Warning` maps to `warn!`; `Error` and `Critical` map to `error!`, with severity, kind,
/// location and frame as structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame = violation
            .frame
            .filter(|f| !f.is_null())
            .map_or(-1, Frame::as_i32);

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(severity, kind, location, frame, "{}", violation.message);
            }
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(severity, kind, location, frame, "{}", violation.message);
            }
        }
    }
}

/// Observer that keeps every violation in memory, for tests.
///
/// ```
/// use delta_rollback::telemetry::{
///     CollectingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&Violation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::FrameSync,
///     "ran on predicted input",
///     "test.rs:1",
/// ));
///
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::FrameSync));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &Violation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through an `Option<Arc<dyn ViolationObserver>>`, falling back to
/// [`TracingObserver`] when it is `None`.
///
/// A trailing `; frame = <expr>` attaches the frame to the violation.
///
/// ```
/// use delta_rollback::report_violation_to;
/// use delta_rollback::telemetry::{
///     CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
/// use delta_rollback::Frame;
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
///
/// report_violation_to!(
///     &observer,
///     ViolationSeverity::Error,
///     ViolationKind::FrameSync,
///     "frame {} ran on predicted input", 7;
///     frame = Frame::new(7)
/// );
/// assert_eq!(collector.violations()[0].frame, Some(Frame::new(7)));
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $msg:literal; frame = $frame:expr) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:expr),+; frame = $frame:expr) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg),+),
            concat!(file!(), ":", line!()),
        )
        .with_frame($frame);
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:expr),+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg),+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that a [`CollectingObserver`] recorded nothing.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a [`CollectingObserver`] recorded a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// Describes a broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types whose internal consistency can be verified at runtime.
///
/// ```
/// use delta_rollback::telemetry::{InvariantChecker, InvariantViolation};
///
/// struct Window {
///     start: i32,
///     end: i32,
/// }
///
/// impl InvariantChecker for Window {
///     fn check_invariants(&self) -> Result<(), InvariantViolation> {
///         if self.start > self.end {
///             return Err(InvariantViolation::new("Window", "start after end")
///                 .with_details(format!("start={}, end={}", self.start, self.end)));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports a
/// `Critical` [`ViolationKind::Invariant`] on failure. Compiles to nothing otherwise.
///
/// ```text
/// debug_check_invariants!(expr, "context", to = observer);
/// ```
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr, to = $observer:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation_to!(
                $observer,
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid` feature.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr, to = $observer:expr) => {{}};
}
