//! Recording orchestration.
//!
//! A recording is one bounded encoder run writing an MP4. The orchestrator
//! enforces one recording per court and a global cap, watches each encoder
//! with a monitor task so self-terminated runs are still finalized, and
//! keeps finished tasks queryable for a retention window.

use crate::config::RelayConfig;
use crate::encoder::{EncoderPlan, EncoderProcess, EncoderState, EncoderSupervisor, StopOutcome};
use crate::error::{RelayError, RelayResult};
use crate::probe::probe_media;
use crate::session::RecordingGuard;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Created,
    Recording,
    Stopping,
    Completed,
    Failed,
}

impl RecordingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordingState::Completed | RecordingState::Failed)
    }
}

/// Status snapshot of one recording task.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingTask {
    pub recording_id: String,
    pub court_id: u32,
    /// Who asked for the recording, when the caller supplies it.
    pub user_id: Option<String>,
    pub source_url: String,
    pub output_path: PathBuf,
    pub requested_duration_secs: u32,
    pub state: RecordingState,
    pub started_at: DateTime<Utc>,
    pub file_size_bytes: Option<u64>,
    pub duration_secs: Option<f64>,
    pub corrupt: bool,
    pub error: Option<String>,
    /// Live figures parsed best-effort from encoder diagnostics; a failed
    /// parse leaves them unset.
    pub frames_encoded: Option<u64>,
    pub measured_fps: Option<f32>,
    pub bitrate_kbits: Option<f32>,
    pub last_encoder_line: Option<String>,
}

/// Result of a finished recording, returned from an explicit stop.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingOutcome {
    pub recording_id: String,
    pub output_path: PathBuf,
    pub file_size_bytes: u64,
    #[serde(rename = "duration_seconds")]
    pub duration_secs: Option<f64>,
    pub success: bool,
}

struct TaskSlot {
    info: Mutex<RecordingTask>,
    process: EncoderProcess,
    started: Instant,
    finalized: AtomicBool,
    finished_at: Mutex<Option<Instant>>,
}

impl TaskSlot {
    fn snapshot(&self) -> RecordingTask {
        let mut info = self.info.lock().unwrap().clone();
        if !info.state.is_terminal() {
            let progress = self.process.progress();
            info.frames_encoded = progress.frame;
            info.measured_fps = progress.fps;
            info.bitrate_kbits = progress.bitrate_kbits;
            info.last_encoder_line = progress.last_line;
        }
        info
    }
}

pub struct RecordingOrchestrator {
    config: Arc<RelayConfig>,
    supervisor: Arc<EncoderSupervisor>,
    tasks: Mutex<HashMap<String, Arc<TaskSlot>>>,
}

impl RecordingOrchestrator {
    pub fn new(config: Arc<RelayConfig>, supervisor: Arc<EncoderSupervisor>) -> Self {
        Self {
            config,
            supervisor,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start recording a court from the given source. The source is usually
    /// the court's local relay so camera hiccups are absorbed upstream, but
    /// any URL ffmpeg can read works.
    pub async fn start(
        self: &Arc<Self>,
        court_id: u32,
        user_id: Option<String>,
        source_url: &str,
        duration_secs: u32,
        output: Option<PathBuf>,
    ) -> RelayResult<RecordingTask> {
        // Cheap fast path; the authoritative check happens again under the
        // same lock acquisition as the insert below.
        if let Some(err) = self.admission_conflict(court_id) {
            return Err(err);
        }

        let recording_id = format!(
            "rec_{court_id}_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let output_path = match output {
            Some(path) => path,
            None => {
                tokio::fs::create_dir_all(&self.config.recordings_dir).await?;
                self.config.recordings_dir.join(format!(
                    "court_{court_id}_{}.mp4",
                    Utc::now().format("%Y%m%d_%H%M%S")
                ))
            }
        };

        let plan = EncoderPlan::record_mp4(
            &self.config.ffmpeg_path,
            source_url,
            duration_secs,
            &output_path,
            recording_id.clone(),
        );
        let process = self.supervisor.spawn(&plan)?;

        let slot = Arc::new(TaskSlot {
            info: Mutex::new(RecordingTask {
                recording_id: recording_id.clone(),
                court_id,
                user_id,
                source_url: crate::session::mask_credentials(source_url),
                output_path: output_path.clone(),
                requested_duration_secs: duration_secs,
                state: RecordingState::Created,
                started_at: Utc::now(),
                file_size_bytes: None,
                duration_secs: None,
                corrupt: false,
                error: None,
                frames_encoded: None,
                measured_fps: None,
                bitrate_kbits: None,
                last_encoder_line: None,
            }),
            process,
            started: Instant::now(),
            finalized: AtomicBool::new(false),
            finished_at: Mutex::new(None),
        });
        // Creation raced while we were spawning: re-check and insert under
        // one lock acquisition, and back the encoder out on conflict.
        let conflict = {
            let mut tasks = self.tasks.lock().unwrap();
            match Self::conflict_locked(&tasks, court_id, self.config.max_recordings) {
                Some(err) => Some(err),
                None => {
                    tasks.insert(recording_id.clone(), slot.clone());
                    None
                }
            }
        };
        if let Some(err) = conflict {
            slot.process
                .stop_gracefully(Duration::from_secs(1), Duration::from_secs(1))
                .await;
            return Err(err);
        }
        slot.info.lock().unwrap().state = RecordingState::Recording;

        tracing::info!(
            "[{recording_id}] recording court {court_id} for {duration_secs}s -> {}",
            output_path.display()
        );

        // Duration-bounded runs end on their own; the monitor finalizes them
        // so the file size and probe results land without an explicit stop.
        let this = self.clone();
        let monitor_slot = slot.clone();
        tokio::spawn(async move {
            this.monitor(monitor_slot).await;
        });

        Ok(slot.snapshot())
    }

    fn admission_conflict(&self, court_id: u32) -> Option<RelayError> {
        let tasks = self.tasks.lock().unwrap();
        Self::conflict_locked(&tasks, court_id, self.config.max_recordings)
    }

    /// Admission rules evaluated against the registry the caller holds.
    fn conflict_locked(
        tasks: &HashMap<String, Arc<TaskSlot>>,
        court_id: u32,
        max_recordings: usize,
    ) -> Option<RelayError> {
        let busy = tasks.values().any(|slot| {
            let info = slot.info.lock().unwrap();
            info.court_id == court_id && !info.state.is_terminal()
        });
        if busy {
            return Some(RelayError::AlreadyRecording { court_id });
        }
        let active = tasks
            .values()
            .filter(|slot| !slot.info.lock().unwrap().state.is_terminal())
            .count();
        if active >= max_recordings {
            return Some(RelayError::CapacityExceeded {
                kind: "recordings",
                active,
                max: max_recordings,
            });
        }
        None
    }

    async fn monitor(self: Arc<Self>, slot: Arc<TaskSlot>) {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if slot.info.lock().unwrap().state.is_terminal() {
                return;
            }
            if slot.process.state() == EncoderState::Exited {
                let id = slot.info.lock().unwrap().recording_id.clone();
                tracing::info!("[{id}] encoder finished on its own");
                self.finalize(&slot).await;
                return;
            }
        }
    }

    /// Stop a recording and finalize its file. `NotFound` for unknown ids;
    /// stopping an already-terminal task returns its recorded outcome.
    pub async fn stop(&self, recording_id: &str) -> RelayResult<RecordingOutcome> {
        let slot = self
            .tasks
            .lock()
            .unwrap()
            .get(recording_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("recording {recording_id}")))?;

        // Check-and-set in one critical section: a task the monitor already
        // finalized must never move back out of its terminal state.
        let proceed = {
            let mut info = slot.info.lock().unwrap();
            if info.state.is_terminal() {
                false
            } else {
                info.state = RecordingState::Stopping;
                true
            }
        };
        if proceed {
            let outcome = slot
                .process
                .stop_gracefully(self.config.stop_timeout(), self.config.kill_grace())
                .await;
            if outcome == StopOutcome::Killed {
                tracing::warn!("[{recording_id}] encoder was force-killed, file may be truncated");
            }
            self.finalize(&slot).await;
            // The monitor may have won the finalize; wait for the terminal
            // state before reporting the outcome.
            let deadline = Instant::now() + self.config.finalize_grace() + Duration::from_secs(2);
            while !slot.info.lock().unwrap().state.is_terminal() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let info = slot.info.lock().unwrap().clone();
        Ok(RecordingOutcome {
            recording_id: info.recording_id,
            output_path: info.output_path,
            file_size_bytes: info.file_size_bytes.unwrap_or(0),
            duration_secs: info.duration_secs,
            success: info.state == RecordingState::Completed,
        })
    }

    /// Inspect the output file and move the task into a terminal state.
    /// Exactly once per task no matter how many paths race here.
    async fn finalize(&self, slot: &Arc<TaskSlot>) {
        if slot.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        // The container needs a moment to settle after the child exits.
        tokio::time::sleep(self.config.finalize_grace()).await;

        let (recording_id, output_path) = {
            let info = slot.info.lock().unwrap();
            (info.recording_id.clone(), info.output_path.clone())
        };
        let elapsed = slot.started.elapsed().as_secs_f64();

        let size = match tokio::fs::metadata(&output_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::error!("[{recording_id}] output file missing: {e}");
                let mut info = slot.info.lock().unwrap();
                info.state = RecordingState::Failed;
                info.error = Some(format!("output file missing: {e}"));
                *slot.finished_at.lock().unwrap() = Some(Instant::now());
                return;
            }
        };

        let media = probe_media(&self.config.ffprobe_path, &output_path).await;
        let duration = match &media {
            Ok(info) => info.duration_secs,
            Err(e) => {
                tracing::warn!("[{recording_id}] probe failed: {e}");
                None
            }
        };
        if let Some(actual) = duration {
            // The probed value is authoritative; a large gap against the
            // wall-clock run time usually means dropped input.
            if elapsed > 0.0 && (actual - elapsed).abs() > elapsed * 0.25 {
                tracing::warn!(
                    "[{recording_id}] probed duration {actual:.1}s deviates from {elapsed:.1}s elapsed"
                );
            }
        }

        let corrupt = size < self.config.min_recording_bytes;
        let mut info = slot.info.lock().unwrap();
        info.file_size_bytes = Some(size);
        info.duration_secs = duration;
        info.corrupt = corrupt;
        if corrupt {
            info.state = RecordingState::Failed;
            info.error = Some(format!(
                "output too small ({size} bytes), likely corrupt"
            ));
            tracing::error!(
                "[{recording_id}] recording failed: {size} bytes at {}",
                output_path.display()
            );
        } else {
            info.state = RecordingState::Completed;
            tracing::info!(
                "[{recording_id}] recording complete: {size} bytes, {:?}s at {}",
                duration,
                output_path.display()
            );
        }
        *slot.finished_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn status(&self, recording_id: &str) -> Option<RecordingTask> {
        self.tasks
            .lock()
            .unwrap()
            .get(recording_id)
            .map(|slot| slot.snapshot())
    }

    pub fn status_all(&self) -> Vec<RecordingTask> {
        let mut all: Vec<RecordingTask> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|slot| !slot.info.lock().unwrap().state.is_terminal())
            .count()
    }

    /// Finalize tasks whose encoder died without telling anyone, and evict
    /// terminal tasks past the retention window.
    pub async fn cleanup_zombies(&self) {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.lock().unwrap().values().cloned().collect();
        for slot in &slots {
            let terminal = slot.info.lock().unwrap().state.is_terminal();
            if !terminal && slot.process.state() == EncoderState::Exited {
                let id = slot.info.lock().unwrap().recording_id.clone();
                tracing::warn!("[{id}] zombie recording detected, finalizing");
                self.finalize(slot).await;
            }
        }

        let retention = self.config.task_retention();
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|id, slot| {
            let expired = slot.info.lock().unwrap().state.is_terminal()
                && slot
                    .finished_at
                    .lock()
                    .unwrap()
                    .map(|at| at.elapsed() > retention)
                    .unwrap_or(false);
            if expired {
                tracing::debug!("[{id}] evicting finished recording task");
            }
            !expired
        });
    }

    /// Stop everything that is still running. Used at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, slot)| !slot.info.lock().unwrap().state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!("[{id}] stop during shutdown failed: {e}");
            }
        }
    }
}

impl RecordingGuard for RecordingOrchestrator {
    fn is_recording(&self, court_id: u32) -> bool {
        self.tasks.lock().unwrap().values().any(|slot| {
            let info = slot.info.lock().unwrap();
            info.court_id == court_id && !info.state.is_terminal()
        })
    }
}
