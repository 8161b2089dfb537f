//! Configuration for the TMI collaboration service.
//!
//! Concrete implementations may have a more detailed config and can use
//! the exposed [`TmiServiceConfig`] and flatten it with `#[clap(flatten)]`.

use std::time::Duration;

use clap::Parser;

/// The configuration for the TMI real-time collaboration core.
///
/// Configurable via environment variables or command line arguments using
/// `clap`.
#[derive(Parser, Debug, Clone)]
pub struct TmiServiceConfig {
    /// Max message size a websocket connection accepts, per frame.
    #[clap(long, env = "TMI_MAX_MESSAGE_SIZE", default_value = "262144")]
    pub ws_max_message_size: usize,

    /// Consecutive malformed frames before a connection is dropped with
    /// `protocol_error`.
    #[clap(long, env = "TMI_PROTOCOL_ERROR_THRESHOLD", default_value = "10")]
    pub protocol_error_threshold: u32,

    /// Capacity of a session's inbound frame queue.
    #[clap(long, env = "TMI_INBOUND_QUEUE_CAPACITY", default_value = "1024")]
    pub inbound_queue_capacity: usize,

    /// Capacity of each participant's outbound frame queue.
    #[clap(long, env = "TMI_OUTBOUND_QUEUE_CAPACITY", default_value = "256")]
    pub outbound_queue_capacity: usize,

    /// Max time to wait while a participant's outbound queue is full
    /// before disconnecting it with `slow_consumer`.
    #[clap(
        long,
        env = "TMI_SLOW_CONSUMER_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub slow_consumer_timeout: Duration,

    /// Max time a `draining` session waits to flush before forcing
    /// `closed`.
    #[clap(
        long,
        env = "TMI_DRAIN_GRACE",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub drain_grace: Duration,

    /// Interval between periodic autosaves of a dirty diagram.
    #[clap(
        long,
        env = "TMI_AUTOSAVE_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub autosave_interval: Duration,

    /// Max time a persist call may run before it is considered failed.
    #[clap(
        long,
        env = "TMI_PERSIST_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub persist_timeout: Duration,

    /// Consecutive persist failures before `persistence_degraded` is
    /// broadcast to participants.
    #[clap(long, env = "TMI_PERSIST_FAILURE_THRESHOLD", default_value = "3")]
    pub persist_failure_threshold: u32,

    /// Time without any inbound frame from any participant before a
    /// session transitions to `draining`.
    #[clap(
        long,
        env = "TMI_SESSION_IDLE_TIMEOUT",
        default_value = "30min",
        value_parser = humantime::parse_duration,
    )]
    pub session_idle_timeout: Duration,
}
