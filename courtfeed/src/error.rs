use thiserror::Error;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors produced by the camera relay core.
///
/// Transient camera/network failures are handled internally by the proxy
/// engine (reconnect with backoff) and never appear here; they only show up
/// as a `connected=false` health flag.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The encoder binary could not be resolved or failed to launch.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No free loopback port within the configured scan window.
    #[error("no free port after scanning {window} ports from {start}")]
    NoFreePort {
        /// First port probed.
        start: u16,
        /// Number of ports scanned.
        window: u16,
    },

    /// Session or recording cap reached.
    #[error("capacity exceeded: {active} active {kind}, maximum is {max}")]
    CapacityExceeded {
        /// What ran out ("sessions" or "recordings").
        kind: &'static str,
        /// Currently active count.
        active: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A recording is already active for this court.
    #[error("court {court_id} already has an active recording")]
    AlreadyRecording {
        /// Court with the conflicting recording.
        court_id: u32,
    },

    /// The operation conflicts with an in-flight recording bound to the session.
    #[error("recording in progress for court {court_id}, source cannot change")]
    RecordingInProgress {
        /// Court whose session is being reconfigured.
        court_id: u32,
    },

    /// No session or recording with the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// No camera source is mapped for the court.
    #[error("no camera source configured for court {court_id}")]
    SourceUnavailable {
        /// Court without a mapping.
        court_id: u32,
    },

    /// The local stream listener could not be bound.
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        /// Port the engine tried to bind.
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// ffprobe invocation or output parsing failed.
    #[error("media probe failed: {0}")]
    Probe(String),

    /// I/O error outside the categories above.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
