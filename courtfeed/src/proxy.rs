//! Stream proxy engine: one camera feed in, any number of viewers out.
//!
//! The engine owns a capture loop that pulls bytes from the camera (directly
//! for HTTP MJPEG sources, via an encoder child for everything else),
//! extracts JPEG frames into a ring buffer, and serves them to HTTP clients
//! as a `multipart/x-mixed-replace` stream. A silent camera (connection held
//! open, no frames) is detected by a frame timeout and recovered with
//! exponential backoff.

use crate::config::RelayConfig;
use crate::encoder::{EncoderPlan, EncoderSupervisor};
use crate::error::{RelayError, RelayResult};
use crate::frame::{FrameExtractor, FrameRing};
use crate::session::{mask_credentials, SourceKind};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Boundary separating multipart MJPEG parts. Matches what browsers and
/// ffmpeg both accept when reading the relay back.
pub const MJPEG_BOUNDARY: &str = "frame";

/// Lifecycle of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Health snapshot reported to collaborators. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub running: bool,
    pub connected: bool,
    pub state: ProxyState,
    pub camera_url: String,
    pub frames_total: u64,
    pub reconnects: u64,
}

/// Why one capture connection ended.
enum CaptureEnd {
    Shutdown,
    SourceChanged,
    Lost { got_frames: bool },
}

struct EngineShared {
    config: Arc<RelayConfig>,
    supervisor: Arc<EncoderSupervisor>,
    ring: FrameRing,
    state: RwLock<ProxyState>,
    last_frame: Mutex<Option<Instant>>,
    frames_total: AtomicU64,
    reconnects: AtomicU64,
    source: RwLock<(String, SourceKind)>,
    shutdown: CancellationToken,
    /// Bumped by `change_source`; the capture loop watches it and restarts.
    epoch: watch::Sender<u64>,
    http: reqwest::Client,
    port: u16,
    label: String,
}

impl EngineShared {
    fn set_state(&self, state: ProxyState) {
        *self.state.write().unwrap() = state;
    }

    fn state(&self) -> ProxyState {
        *self.state.read().unwrap()
    }

    fn publish(&self, frame: Bytes) {
        self.ring.push(frame);
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        *self.last_frame.lock().unwrap() = Some(Instant::now());
        if self.state() != ProxyState::Streaming {
            self.set_state(ProxyState::Streaming);
        }
    }

    fn connected(&self) -> bool {
        if self.state() != ProxyState::Streaming {
            return false;
        }
        match *self.last_frame.lock().unwrap() {
            Some(at) => at.elapsed() <= self.config.frame_timeout(),
            None => false,
        }
    }

    fn health(&self) -> EngineHealth {
        let state = self.state();
        let (url, _) = self.source.read().unwrap().clone();
        EngineHealth {
            running: state != ProxyState::Stopped,
            connected: self.connected(),
            state,
            camera_url: mask_credentials(&url),
            frames_total: self.frames_total.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Reconnect delay for the given 1-based attempt: `min(2^(attempt-1), cap)`.
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(max_delay)
}

pub struct StreamProxyEngine {
    shared: Arc<EngineShared>,
    capture_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    server_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamProxyEngine {
    pub fn new(
        config: Arc<RelayConfig>,
        supervisor: Arc<EncoderSupervisor>,
        source_url: String,
        source_kind: SourceKind,
        port: u16,
        label: String,
    ) -> Self {
        let ring = FrameRing::new(config.ring_capacity);
        let (epoch, _) = watch::channel(0u64);
        Self {
            shared: Arc::new(EngineShared {
                config,
                supervisor,
                ring,
                state: RwLock::new(ProxyState::Idle),
                last_frame: Mutex::new(None),
                frames_total: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                source: RwLock::new((source_url, source_kind)),
                shutdown: CancellationToken::new(),
                epoch,
                http: reqwest::Client::new(),
                port,
                label,
            }),
            capture_task: Mutex::new(None),
            server_task: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Loopback address of the normalized stream.
    pub fn local_stream_url(&self) -> String {
        format!("http://127.0.0.1:{}/stream.mjpeg", self.shared.port)
    }

    pub fn health(&self) -> EngineHealth {
        self.shared.health()
    }

    /// Bind the local listener and start the capture loop.
    pub async fn start(&self) -> RelayResult<()> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.shared.port))
            .await
            .map_err(|source| RelayError::Bind {
                port: self.shared.port,
                source,
            })?;

        let shared = self.shared.clone();
        let router = engine_router(shared.clone());
        let token = shared.shutdown.clone();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned());
            if let Err(e) = serve.await {
                tracing::error!("local stream listener error: {e}");
            }
        });
        *self.server_task.lock().unwrap() = Some(server);

        let shared = self.shared.clone();
        let capture = tokio::spawn(async move {
            capture_loop(shared).await;
        });
        *self.capture_task.lock().unwrap() = Some(capture);

        tracing::info!(
            "[{}] proxy engine listening on {}",
            self.shared.label,
            self.local_stream_url()
        );
        Ok(())
    }

    /// Fetch a few bytes from the local endpoint to confirm the relay works.
    /// Advisory: a `false` result does not prevent session creation.
    pub async fn verify(&self, timeout: Duration) -> bool {
        let url = self.local_stream_url();
        for attempt in 1..=2u32 {
            match self.try_fetch_bytes(&url, timeout).await {
                Ok(received) if received >= 100 => {
                    tracing::info!("[{}] stream verified ({received} bytes)", self.shared.label);
                    return true;
                }
                Ok(received) => {
                    tracing::warn!(
                        "[{}] verify attempt {attempt}: only {received} bytes",
                        self.shared.label
                    );
                }
                Err(e) => {
                    tracing::warn!("[{}] verify attempt {attempt} failed: {e}", self.shared.label);
                }
            }
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        false
    }

    async fn try_fetch_bytes(&self, url: &str, timeout: Duration) -> Result<usize, reqwest::Error> {
        let fetch = async {
            let mut response = self.shared.http.get(url).send().await?;
            let mut received = 0usize;
            while received < 100 {
                match response.chunk().await? {
                    Some(chunk) => received += chunk.len(),
                    None => break,
                }
            }
            Ok(received)
        };
        match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    /// Swap the upstream camera. The capture loop tears the current
    /// connection down and reconnects against the new source with a fresh
    /// attempt counter. Recording conflicts are enforced by the session
    /// manager before this is called.
    pub fn change_source(&self, url: String, kind: SourceKind) {
        tracing::info!(
            "[{}] source changing to {}",
            self.shared.label,
            mask_credentials(&url)
        );
        *self.shared.source.write().unwrap() = (url, kind);
        self.shared.epoch.send_modify(|e| *e += 1);
    }

    /// Stop the capture loop and the local listener. Idempotent; bounded.
    pub async fn shutdown(&self) {
        if self.shared.state() == ProxyState::Stopped {
            return;
        }
        self.shared.shutdown.cancel();

        let capture = self.capture_task.lock().unwrap().take();
        if let Some(task) = capture {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("[{}] capture loop did not stop in time", self.shared.label);
            }
        }
        let server = self.server_task.lock().unwrap().take();
        if let Some(task) = server {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.shared.set_state(ProxyState::Stopped);
        tracing::info!("[{}] proxy engine stopped", self.shared.label);
    }

    /// Per-client multipart MJPEG response, paced at the configured cadence.
    pub fn mjpeg_response(&self) -> Response {
        mjpeg_response_from(self.shared.clone())
    }
}

async fn capture_loop(shared: Arc<EngineShared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        shared.set_state(ProxyState::Connecting);
        let (url, kind) = shared.source.read().unwrap().clone();

        let end = match kind {
            SourceKind::Mjpeg => direct_capture(&shared, &url).await,
            SourceKind::Rtsp | SourceKind::Unknown => encoder_capture(&shared, &url).await,
        };

        match end {
            CaptureEnd::Shutdown => break,
            CaptureEnd::SourceChanged => {
                attempt = 0;
                continue;
            }
            CaptureEnd::Lost { got_frames } => {
                // A connection that produced frames resets the counter; the
                // next failure starts the backoff ladder from the bottom.
                attempt = if got_frames { 1 } else { attempt + 1 };
                shared.reconnects.fetch_add(1, Ordering::Relaxed);
                shared.set_state(ProxyState::Reconnecting);

                let delay = backoff_delay(attempt, shared.config.reconnect_max_delay());
                tracing::warn!(
                    "[{}] connection lost, reconnect attempt {attempt} in {delay:?}",
                    shared.label
                );
                let mut epoch_rx = shared.epoch.subscribe();
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = epoch_rx.changed() => { attempt = 0; }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    shared.set_state(ProxyState::Stopped);
}

/// Pull a multipart MJPEG source over HTTP and demux it in-process.
async fn direct_capture(shared: &Arc<EngineShared>, url: &str) -> CaptureEnd {
    let mut epoch_rx = shared.epoch.subscribe();
    epoch_rx.mark_unchanged();

    let response = tokio::select! {
        _ = shared.shutdown.cancelled() => return CaptureEnd::Shutdown,
        _ = epoch_rx.changed() => return CaptureEnd::SourceChanged,
        result = shared.http.get(url).send() => match result {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!("[{}] camera returned {}", shared.label, response.status());
                return CaptureEnd::Lost { got_frames: false };
            }
            Err(e) => {
                tracing::warn!("[{}] camera connect failed: {e}", shared.label);
                return CaptureEnd::Lost { got_frames: false };
            }
        },
    };

    let mut response = response;
    let mut extractor = FrameExtractor::new(shared.config.frame_scan_limit);
    let mut got_frames = false;
    let frame_timeout = shared.config.frame_timeout();

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return CaptureEnd::Shutdown,
            _ = epoch_rx.changed() => return CaptureEnd::SourceChanged,
            read = tokio::time::timeout(frame_timeout, response.chunk()) => match read {
                Err(_) => {
                    tracing::warn!("[{}] no bytes for {frame_timeout:?}", shared.label);
                    return CaptureEnd::Lost { got_frames };
                }
                Ok(Err(e)) => {
                    tracing::warn!("[{}] camera read error: {e}", shared.label);
                    return CaptureEnd::Lost { got_frames };
                }
                Ok(Ok(None)) => {
                    tracing::warn!("[{}] camera closed the stream", shared.label);
                    return CaptureEnd::Lost { got_frames };
                }
                Ok(Ok(Some(chunk))) => {
                    for frame in extractor.push(&chunk) {
                        shared.publish(frame);
                        got_frames = true;
                    }
                }
            },
        }
    }
}

/// Normalize a non-HTTP source through an encoder child and demux its stdout.
async fn encoder_capture(shared: &Arc<EngineShared>, url: &str) -> CaptureEnd {
    let mut epoch_rx = shared.epoch.subscribe();
    epoch_rx.mark_unchanged();

    let plan = EncoderPlan::mjpeg_relay(
        &shared.config.ffmpeg_path,
        url,
        shared.config.output_fps,
        shared.label.clone(),
    );
    let process = match shared.supervisor.spawn(&plan) {
        Ok(process) => process,
        Err(e) => {
            tracing::error!("[{}] encoder spawn failed: {e}", shared.label);
            return CaptureEnd::Lost { got_frames: false };
        }
    };
    let Some(mut stdout) = process.take_stdout() else {
        tracing::error!("[{}] encoder stdout missing", shared.label);
        return CaptureEnd::Lost { got_frames: false };
    };

    let mut extractor = FrameExtractor::new(shared.config.frame_scan_limit);
    let mut got_frames = false;
    let mut chunk = BytesMut::with_capacity(8192);
    let frame_timeout = shared.config.frame_timeout();

    let end = loop {
        chunk.clear();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break CaptureEnd::Shutdown,
            _ = epoch_rx.changed() => break CaptureEnd::SourceChanged,
            read = tokio::time::timeout(frame_timeout, stdout.read_buf(&mut chunk)) => match read {
                Err(_) => {
                    tracing::warn!("[{}] encoder silent for {frame_timeout:?}", shared.label);
                    break CaptureEnd::Lost { got_frames };
                }
                Ok(Err(e)) => {
                    tracing::warn!("[{}] encoder read error: {e}", shared.label);
                    break CaptureEnd::Lost { got_frames };
                }
                Ok(Ok(0)) => {
                    let tail = process.diagnostic_tail();
                    tracing::warn!(
                        "[{}] encoder ended (last diagnostics: {:?})",
                        shared.label,
                        tail.last()
                    );
                    break CaptureEnd::Lost { got_frames };
                }
                Ok(Ok(_)) => {
                    for frame in extractor.push(&chunk) {
                        shared.publish(frame);
                        got_frames = true;
                    }
                }
            },
        }
    };

    // The child belongs to this connection; take it down before leaving.
    process
        .stop_gracefully(Duration::from_secs(2), Duration::from_secs(2))
        .await;
    end
}

/// One multipart part: boundary, headers, JPEG payload, trailing CRLF.
fn multipart_part(frame: &Bytes) -> Bytes {
    let head = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Stream of multipart parts for one viewer.
///
/// Each client polls the ring at the configured cadence: it sends the newest
/// unseen frame per tick, re-sends the latest when the producer is slower
/// than the cadence, and ends when the engine stops. Clients never block one
/// another — they share nothing but the ring.
fn client_stream(shared: Arc<EngineShared>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let interval = shared.config.output_interval();
    futures::stream::unfold(
        (shared, None::<u64>),
        move |(shared, last_seq)| async move {
            loop {
                if shared.state() == ProxyState::Stopped {
                    return None;
                }
                tokio::time::sleep(interval).await;

                let next = match last_seq {
                    Some(seq) => shared.ring.since(seq).into_iter().last().or_else(|| {
                        // Producer slower than our cadence: repeat the latest.
                        shared.ring.latest()
                    }),
                    None => shared.ring.latest(),
                };
                if let Some((seq, frame)) = next {
                    let part = multipart_part(&frame);
                    return Some((Ok(part), (shared, Some(seq))));
                }
                // No frame yet; keep pacing until the capture loop produces.
            }
        },
    )
}

fn mjpeg_response_from(shared: Arc<EngineShared>) -> Response {
    let body = Body::from_stream(client_stream(shared));
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .body(body)
        .expect("failed to build MJPEG response")
}

async fn stream_endpoint(State(shared): State<Arc<EngineShared>>) -> Response {
    mjpeg_response_from(shared)
}

async fn health_endpoint(State(shared): State<Arc<EngineShared>>) -> Json<EngineHealth> {
    Json(shared.health())
}

fn engine_router(shared: Arc<EngineShared>) -> Router {
    Router::new()
        .route("/stream.mjpeg", get(stream_endpoint))
        .route("/health", get(health_endpoint))
        .with_state(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_capped() {
        let cap = Duration::from_secs(5);
        let delays: Vec<u64> = (1..=4)
            .map(|attempt| backoff_delay(attempt, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5]);
    }

    #[test]
    fn backoff_never_overflows() {
        let cap = Duration::from_secs(5);
        assert_eq!(backoff_delay(100, cap), cap);
        assert_eq!(backoff_delay(0, cap), Duration::from_secs(1));
    }

    #[test]
    fn multipart_part_layout() {
        let frame = Bytes::from_static(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]);
        let part = multipart_part(&frame);
        let text = String::from_utf8_lossy(&part[..part.len() - frame.len() - 2]);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg"));
        assert!(text.contains("Content-Length: 5"));
        assert!(part.ends_with(b"\r\n"));
    }
}
