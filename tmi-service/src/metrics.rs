//! Metrics definitions for the TMI collaboration service.
//!
//! This module defines all metrics keys used by the service and
//! provides a helper [`describe_metrics`] to set metadata for each
//! metric using the `metrics` crate.

/// Metrics key for currently open sessions (one per live diagram).
pub const METRICS_ID_SESSIONS_OPEN: &str = "tmi.sessions.open";
/// Metrics key for currently connected participants, across all sessions.
pub const METRICS_ID_PARTICIPANTS_OPEN: &str = "tmi.participants.open";
/// Metrics key for applied diagram operations.
pub const METRICS_ID_OPERATIONS_APPLIED: &str = "tmi.operations.applied";
/// Metrics key for operations rejected by validation.
pub const METRICS_ID_OPERATIONS_REJECTED: &str = "tmi.operations.rejected";
/// Metrics key for undo/redo requests resulting in `undo_conflict`.
pub const METRICS_ID_UNDO_CONFLICTS: &str = "tmi.undo.conflicts";
/// Metrics key for connections dropped for sending too many bad frames.
pub const METRICS_ID_PROTOCOL_ERRORS: &str = "tmi.connections.protocol_errors";
/// Metrics key for connections dropped as slow consumers.
pub const METRICS_ID_SLOW_CONSUMERS: &str = "tmi.connections.slow_consumers";
/// Metrics key for the duration of a persist call.
pub const METRICS_ID_PERSIST_DURATION: &str = "tmi.persist.duration";
/// Metrics key for persist failures.
pub const METRICS_ID_PERSIST_FAILURES: &str = "tmi.persist.failures";

/// Describe all metrics used by the service.
///
/// Calls the `describe_*` functions from the `metrics` crate to set
/// metadata on each metric.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_SESSIONS_OPEN,
        metrics::Unit::Count,
        "Number of live Session Hubs"
    );

    metrics::describe_gauge!(
        METRICS_ID_PARTICIPANTS_OPEN,
        metrics::Unit::Count,
        "Number of connected participants across all sessions"
    );

    metrics::describe_counter!(
        METRICS_ID_OPERATIONS_APPLIED,
        metrics::Unit::Count,
        "Number of diagram operations successfully applied"
    );

    metrics::describe_counter!(
        METRICS_ID_OPERATIONS_REJECTED,
        metrics::Unit::Count,
        "Number of diagram operations rejected by validation"
    );

    metrics::describe_counter!(
        METRICS_ID_UNDO_CONFLICTS,
        metrics::Unit::Count,
        "Number of undo/redo requests that could not be safely rebased"
    );

    metrics::describe_counter!(
        METRICS_ID_PROTOCOL_ERRORS,
        metrics::Unit::Count,
        "Number of connections dropped for too many malformed frames"
    );

    metrics::describe_counter!(
        METRICS_ID_SLOW_CONSUMERS,
        metrics::Unit::Count,
        "Number of connections dropped as slow consumers"
    );

    metrics::describe_histogram!(
        METRICS_ID_PERSIST_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of a DiagramStore persist call"
    );

    metrics::describe_counter!(
        METRICS_ID_PERSIST_FAILURES,
        metrics::Unit::Count,
        "Number of failed DiagramStore persist attempts"
    );
}
