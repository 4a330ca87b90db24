//! External encoder process supervision.
//!
//! One ffmpeg invocation per logical job: a proxy session gets a normalizing
//! relay (camera feed in, MJPEG on stdout), a recording task gets an
//! encode-to-file run. The supervisor owns spawn, liveness, diagnostics and
//! the graceful-then-forced stop; it never retries — reconnect and restart
//! policy belongs to the caller.

use crate::error::{RelayError, RelayResult};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// How many trailing diagnostic lines are kept for post-mortem logging.
const DIAG_TAIL_LINES: usize = 40;

/// A fully resolved encoder invocation.
#[derive(Debug, Clone)]
pub struct EncoderPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Short label used in log lines ("proxy court 3", "rec abc123").
    pub label: String,
    /// Whether the caller will read stdout (relay jobs do, file jobs don't).
    pub capture_stdout: bool,
}

impl EncoderPlan {
    /// Relay invocation: normalize any camera feed to MJPEG on stdout.
    pub fn mjpeg_relay(ffmpeg: &str, source_url: &str, fps: u32, label: String) -> Self {
        let mut args = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];
        if source_url.starts_with("rtsp") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-fflags".into(),
            "+genpts".into(),
            "-i".into(),
            source_url.into(),
            "-f".into(),
            "mjpeg".into(),
            "-q:v".into(),
            "2".into(),
            "-r".into(),
            fps.to_string(),
            "-".into(),
        ]);
        Self {
            program: ffmpeg.to_string(),
            args,
            label,
            capture_stdout: true,
        }
    }

    /// Recording invocation: bounded-duration H.264 MP4, baseline profile for
    /// broad playback compatibility, faststart so the header lands up front.
    pub fn record_mp4(
        ffmpeg: &str,
        source_url: &str,
        duration_secs: u32,
        output: &std::path::Path,
        label: String,
    ) -> Self {
        let mut args = vec!["-hide_banner".into(), "-loglevel".into(), "info".into()];
        if source_url.starts_with("rtsp") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-i".into(),
            source_url.into(),
            "-t".into(),
            duration_secs.to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-crf".into(),
            "23".into(),
            "-profile:v".into(),
            "baseline".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-an".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            output.display().to_string(),
        ]);
        Self {
            program: ffmpeg.to_string(),
            args,
            label,
            capture_stdout: false,
        }
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Progress figures parsed best-effort from encoder diagnostics.
#[derive(Debug, Clone, Default)]
pub struct EncoderProgress {
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub bitrate_kbits: Option<f32>,
    pub last_line: Option<String>,
}

/// Parse one ffmpeg stderr line like
/// `frame=  123 fps= 25 q=2.0 size=1024KiB time=00:00:05 bitrate= 963.2kbits/s`.
/// A line that doesn't match leaves the progress untouched.
fn parse_progress(line: &str, progress: &mut EncoderProgress) {
    progress.last_line = Some(line.to_string());
    if !line.contains("frame=") {
        return;
    }
    if let Some(value) = field_after(line, "frame=") {
        if let Ok(frame) = value.parse() {
            progress.frame = Some(frame);
        }
    }
    if let Some(value) = field_after(line, "fps=") {
        if let Ok(fps) = value.parse() {
            progress.fps = Some(fps);
        }
    }
    if let Some(value) = field_after(line, "bitrate=") {
        if let Ok(rate) = value.trim_end_matches("kbits/s").parse() {
            progress.bitrate_kbits = Some(rate);
        }
    }
}

fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = &line[line.find(key)? + key.len()..];
    let rest = rest.trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Lifecycle of one encoder child as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Running,
    Stopping,
    Exited,
}

/// Outcome of a graceful stop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already gone before we asked.
    AlreadyExited,
    /// Exited within the graceful window.
    Graceful,
    /// Had to be force-killed.
    Killed,
}

/// One supervised encoder child.
///
/// Owned exclusively by whoever spawned it; liveness checks and the stop
/// sequence poll `try_wait` under a short-lived lock so a status query never
/// blocks behind a stop in progress.
pub struct EncoderProcess {
    id: u64,
    pid: Option<u32>,
    label: String,
    command_line: String,
    started_at: Instant,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<tokio::process::ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    progress: Arc<Mutex<EncoderProgress>>,
    stopping: std::sync::atomic::AtomicBool,
    live: Arc<Mutex<HashMap<u64, String>>>,
}

impl EncoderProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Take the stdout pipe (relay jobs). Returns `None` the second time or
    /// when the plan did not capture stdout.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().unwrap().take()
    }

    /// Current best-effort progress snapshot.
    pub fn progress(&self) -> EncoderProgress {
        self.progress.lock().unwrap().clone()
    }

    /// Trailing diagnostic lines, oldest first.
    pub fn diagnostic_tail(&self) -> Vec<String> {
        self.tail.lock().unwrap().iter().cloned().collect()
    }

    /// Whether the child is still running. Non-blocking.
    pub fn is_alive(&self) -> bool {
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            // Someone is mid-wait/kill on the child; treat as alive.
            Err(_) => true,
        }
    }

    /// Externally visible lifecycle state.
    pub fn state(&self) -> EncoderState {
        if !self.is_alive() {
            EncoderState::Exited
        } else if self.stopping.load(Ordering::Relaxed) {
            EncoderState::Stopping
        } else {
            EncoderState::Running
        }
    }

    /// Exit code if the child has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.child.try_lock() {
            Ok(mut child) => child.try_wait().ok().flatten().and_then(|s| s.code()),
            Err(_) => None,
        }
    }

    /// Ask the encoder to stop, escalating from the interactive quit to a
    /// kill. Returns within `timeout + kill_grace` wall-clock regardless of
    /// what the child does.
    pub async fn stop_gracefully(&self, timeout: Duration, kill_grace: Duration) -> StopOutcome {
        self.stopping.store(true, Ordering::Relaxed);
        if !self.is_alive() {
            self.deregister();
            return StopOutcome::AlreadyExited;
        }

        // ffmpeg finalizes the container on an interactive `q`; fall back to
        // a kill signal when stdin was not piped or the write fails.
        let quit_sent = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(pipe) => {
                    let ok = pipe.write_all(b"q\n").await.is_ok() && pipe.flush().await.is_ok();
                    if ok {
                        tracing::debug!("[{}] sent interactive quit", self.label);
                    }
                    ok
                }
                None => false,
            }
        };
        if !quit_sent {
            let mut child = self.child.lock().await;
            if let Err(e) = child.start_kill() {
                tracing::debug!("[{}] terminate failed: {e}", self.label);
            }
        }

        if self.wait_for_exit(timeout).await {
            tracing::info!("[{}] encoder stopped gracefully", self.label);
            self.deregister();
            return StopOutcome::Graceful;
        }

        tracing::warn!(
            "[{}] encoder unresponsive after {:?}, killing",
            self.label,
            timeout
        );
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill().await {
                tracing::warn!("[{}] kill failed: {e}", self.label);
            }
        }
        self.wait_for_exit(kill_grace).await;
        self.deregister();
        StopOutcome::Killed
    }

    /// Poll for process exit for at most `limit`. Returns true when exited.
    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            {
                let mut child = self.child.lock().await;
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::debug!("[{}] exited with {status}", self.label);
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn deregister(&self) {
        self.live.lock().unwrap().remove(&self.id);
    }
}

/// Spawns and tracks encoder children.
pub struct EncoderSupervisor {
    next_id: AtomicU64,
    live: Arc<Mutex<HashMap<u64, String>>>,
}

impl EncoderSupervisor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch one encoder child per the plan. The stderr pipe is drained
    /// continuously by a dedicated task so the child can never stall on a
    /// full pipe buffer.
    pub fn spawn(&self, plan: &EncoderPlan) -> RelayResult<EncoderProcess> {
        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdout(if plan.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|source| RelayError::Spawn {
            program: plan.program.clone(),
            source,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        tracing::info!("[{}] spawned encoder pid={:?}: {}", plan.label, pid, plan.command_line());

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(DIAG_TAIL_LINES)));
        let progress = Arc::new(Mutex::new(EncoderProgress::default()));
        if let Some(stderr) = child.stderr.take() {
            let tail = tail.clone();
            let progress = progress.clone();
            let label = plan.label.clone();
            let live = self.live.clone();
            tokio::spawn(async move {
                drain_diagnostics(stderr, label, tail, progress).await;
                // Pipe EOF means the child is gone; drop it from the live set
                // even when nobody called stop.
                live.lock().unwrap().remove(&id);
            });
        }

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        self.live.lock().unwrap().insert(id, plan.label.clone());

        Ok(EncoderProcess {
            id,
            pid,
            label: plan.label.clone(),
            command_line: plan.command_line(),
            started_at: Instant::now(),
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            tail,
            progress,
            stopping: std::sync::atomic::AtomicBool::new(false),
            live: self.live.clone(),
        })
    }

    /// Number of encoder children believed to be running.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl Default for EncoderSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_diagnostics(
    stderr: tokio::process::ChildStderr,
    label: String,
    tail: Arc<Mutex<VecDeque<String>>>,
    progress: Arc<Mutex<EncoderProgress>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let lowered = line.to_lowercase();
        if ["error", "failed", "invalid", "cannot"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            tracing::warn!("[{label}] encoder: {line}");
        } else if line.contains("frame=") {
            tracing::trace!("[{label}] encoder: {line}");
        } else {
            tracing::debug!("[{label}] encoder: {line}");
        }

        parse_progress(&line, &mut progress.lock().unwrap());

        let mut tail = tail.lock().unwrap();
        if tail.len() == DIAG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tracing::debug!("[{label}] encoder diagnostics closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_parsing() {
        let mut progress = EncoderProgress::default();
        parse_progress(
            "frame=  123 fps= 25 q=2.0 size=1024KiB time=00:00:05.00 bitrate= 963.2kbits/s",
            &mut progress,
        );
        assert_eq!(progress.frame, Some(123));
        assert_eq!(progress.fps, Some(25.0));
        assert_eq!(progress.bitrate_kbits, Some(963.2));
    }

    #[test]
    fn non_progress_line_only_updates_tail() {
        let mut progress = EncoderProgress::default();
        parse_progress("Input #0, mjpeg, from 'http://camera'", &mut progress);
        assert_eq!(progress.frame, None);
        assert!(progress.last_line.is_some());
    }

    #[test]
    fn relay_plan_shapes_the_pipeline() {
        let plan = EncoderPlan::mjpeg_relay("ffmpeg", "rtsp://cam/stream", 25, "t".into());
        assert!(plan.capture_stdout);
        assert!(plan.args.iter().any(|a| a == "-rtsp_transport"));
        assert_eq!(plan.args.last().map(String::as_str), Some("-"));

        let plan = EncoderPlan::mjpeg_relay("ffmpeg", "http://cam/video.mjpg", 25, "t".into());
        assert!(!plan.args.iter().any(|a| a == "-rtsp_transport"));
    }

    #[test]
    fn record_plan_uses_compatible_profile() {
        let out = std::path::Path::new("/tmp/rec.mp4");
        let plan = EncoderPlan::record_mp4("ffmpeg", "http://cam", 300, out, "t".into());
        assert!(!plan.capture_stdout);
        let args = plan.args.join(" ");
        assert!(args.contains("-t 300"));
        assert!(args.contains("-profile:v baseline"));
        assert!(args.contains("+faststart"));
    }
}
