//! Camera stream relay and recording core for court installations.
//!
//! One [`session::SessionManager`] per deployment owns a proxy engine per
//! court: the engine pulls the camera feed once (directly for HTTP MJPEG,
//! through an encoder child for RTSP), normalizes it, and fans it out to any
//! number of local viewers over `multipart/x-mixed-replace`. The
//! [`recording::RecordingOrchestrator`] records courts to MP4 through the
//! same encoder supervision, preferring the local relay as its source so a
//! flaky camera is handled in exactly one place.
//!
//! The HTTP control surface lives in the companion server crate; this crate
//! is usable headless.

pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod recording;
pub mod session;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use recording::{RecordingOrchestrator, RecordingOutcome, RecordingState, RecordingTask};
pub use session::{SessionInfo, SessionManager, SourceKind};
