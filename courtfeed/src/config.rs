use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay core.
///
/// All knobs have conservative defaults matching a small club installation;
/// the server binary exposes the interesting ones as CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum number of concurrently active camera sessions.
    pub max_sessions: usize,
    /// Maximum number of concurrently active recordings.
    pub max_recordings: usize,
    /// First loopback port probed for a new proxy instance.
    pub port_range_start: u16,
    /// Number of ports scanned before giving up with `NoFreePort`.
    pub port_scan_window: u16,
    /// Output cadence of the normalized MJPEG stream (frames per second).
    pub output_fps: u32,
    /// Seconds without an extracted frame before the connection is declared lost.
    pub frame_timeout_secs: u64,
    /// Ceiling for the exponential reconnect backoff (seconds).
    pub reconnect_max_delay_secs: u64,
    /// Pending-byte limit for the JPEG scanner before the buffer is discarded.
    pub frame_scan_limit: usize,
    /// Number of frames retained in the per-session ring buffer.
    pub ring_capacity: usize,
    /// Encoder binary.
    pub ffmpeg_path: String,
    /// Media inspection binary.
    pub ffprobe_path: String,
    /// Files below this size are flagged as corrupt recordings.
    pub min_recording_bytes: u64,
    /// Graceful-stop wait before the encoder is force-killed (seconds).
    pub stop_timeout_secs: u64,
    /// Additional wait for the kill to take effect (seconds).
    pub kill_grace_secs: u64,
    /// Wait after encoder exit before the output file is treated as final (seconds).
    pub finalize_grace_secs: u64,
    /// How long terminal recording tasks stay queryable before eviction (seconds).
    pub task_retention_secs: u64,
    /// Directory for recording output when the caller does not supply a path.
    pub recordings_dir: PathBuf,
    /// Court id -> camera source URL.
    pub camera_map: HashMap<u32, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            max_recordings: 3,
            port_range_start: 8090,
            port_scan_window: 200,
            output_fps: 25,
            frame_timeout_secs: 5,
            reconnect_max_delay_secs: 5,
            frame_scan_limit: 1024 * 1024,
            ring_capacity: 120,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            min_recording_bytes: 50 * 1024,
            stop_timeout_secs: 10,
            kill_grace_secs: 5,
            finalize_grace_secs: 2,
            task_retention_secs: 60,
            recordings_dir: PathBuf::from("recordings"),
            camera_map: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn finalize_grace(&self) -> Duration {
        Duration::from_secs(self.finalize_grace_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    /// Interval between two multipart parts for one viewer.
    pub fn output_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.output_fps.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = RelayConfig::default();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.port_scan_window, 200);
        assert_eq!(config.output_fps, 25);
        assert_eq!(config.frame_scan_limit, 1024 * 1024);
        assert_eq!(config.min_recording_bytes, 51200);
        assert_eq!(config.output_interval(), Duration::from_millis(40));
    }
}
