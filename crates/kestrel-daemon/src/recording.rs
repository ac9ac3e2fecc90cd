//! Webcam and screen recording.
//!
//! Each kind is an independent state machine behind its own lock. `start`,
//! `tick` and `stop` hold that lock for their whole duration, so they never
//! interleave for the same kind. The capture device and encoder live inside
//! the `Sink`, which is moved out of the state and consumed on release; a
//! second release cannot happen.

use chrono::Local;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::capture::{CaptureProvider, Frame, FrameSource, VideoWriter};
use crate::config::Config;
use crate::error::RecordingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingKind {
    Webcam,
    Screen,
}

impl RecordingKind {
    pub const ALL: [RecordingKind; 2] = [RecordingKind::Webcam, RecordingKind::Screen];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingKind::Webcam => "webcam",
            RecordingKind::Screen => "screen",
        }
    }
}

impl fmt::Display for RecordingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Sink {
    File {
        source: Box<dyn FrameSource>,
        writer: Box<dyn VideoWriter>,
        path: PathBuf,
    },
    /// No encoder available: frames pile up in memory until stop.
    /// Growth is unbounded; a warning is logged past `frame_buffer_warn`.
    Buffer {
        source: Box<dyn FrameSource>,
        frames: Vec<Frame>,
    },
}

struct Active {
    sink: Sink,
    started: Instant,
    frames: usize,
    warned: bool,
}

/// Output left behind once the sink is released.
enum Captured {
    File { path: PathBuf, frames: usize },
    Frames(Vec<Frame>),
    Nothing,
}

impl Captured {
    fn frames(&self) -> usize {
        match self {
            Captured::File { frames, .. } => *frames,
            Captured::Frames(frames) => frames.len(),
            Captured::Nothing => 0,
        }
    }

    fn discard(self) {
        if let Captured::File { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove recording file");
            }
        }
    }
}

#[derive(Default)]
struct RecordingState {
    /// `Some` exactly while recording.
    active: Option<Active>,
    /// Output of a recording that a failed tick ended; handed to the next stop.
    salvaged: Option<Captured>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { file_backed: bool },
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Captured,
    /// The source failed and the recording was stopped.
    Stopped,
}

/// A packaged recording ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub filename: String,
    pub data: Vec<u8>,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped(Recording),
    /// Nothing was running. Carries whatever a recording that ended on a
    /// capture failure had collected, if it has not been handed out yet.
    NotActive { salvaged: Option<Recording> },
}

pub struct RecordingController {
    capture: Arc<dyn CaptureProvider>,
    webcam: Mutex<RecordingState>,
    screen: Mutex<RecordingState>,
    work_dir: PathBuf,
    fps: u32,
    frame_buffer_warn: usize,
}

impl RecordingController {
    pub fn new(capture: Arc<dyn CaptureProvider>, config: &Config) -> Self {
        Self {
            capture,
            webcam: Mutex::new(RecordingState::default()),
            screen: Mutex::new(RecordingState::default()),
            work_dir: config.work_dir.clone(),
            fps: config.record_fps,
            frame_buffer_warn: config.frame_buffer_warn,
        }
    }

    fn slot(&self, kind: RecordingKind) -> &Mutex<RecordingState> {
        match kind {
            RecordingKind::Webcam => &self.webcam,
            RecordingKind::Screen => &self.screen,
        }
    }

    pub fn is_active(&self, kind: RecordingKind) -> bool {
        self.slot(kind).lock().active.is_some()
    }

    pub fn start(&self, kind: RecordingKind) -> Result<StartOutcome, RecordingError> {
        let mut state = self.slot(kind).lock();
        if state.active.is_some() {
            return Ok(StartOutcome::AlreadyActive);
        }
        if let Some(stale) = state.salvaged.take() {
            info!(%kind, frames = stale.frames(), "Discarding output of failed recording");
            stale.discard();
        }

        let source = self
            .capture
            .open_source(kind)
            .map_err(|source| RecordingError::Open {
                kind: kind.as_str(),
                source,
            })?;
        let (width, height) = source.dimensions();

        let path = self.work_dir.join(format!(
            "{kind}_{}.{}",
            uuid::Uuid::new_v4(),
            self.capture.video_extension()
        ));
        let writer = match std::fs::create_dir_all(&self.work_dir) {
            Ok(()) => self
                .capture
                .open_video_writer(&path, width, height, self.fps)
                .unwrap_or_else(|e| {
                    warn!(%kind, error = %e, "Video writer unavailable, buffering frames");
                    None
                }),
            Err(e) => {
                warn!(%kind, dir = %self.work_dir.display(), error = %e, "Work directory unusable, buffering frames");
                None
            }
        };

        let sink = match writer {
            Some(writer) => Sink::File {
                source,
                writer,
                path,
            },
            None => Sink::Buffer {
                source,
                frames: Vec::new(),
            },
        };
        let file_backed = matches!(sink, Sink::File { .. });
        state.active = Some(Active {
            sink,
            started: Instant::now(),
            frames: 0,
            warned: false,
        });

        info!(%kind, width, height, file_backed, "Recording started");
        Ok(StartOutcome::Started { file_backed })
    }

    /// Capture one frame. Called by the sampler.
    pub fn tick(&self, kind: RecordingKind) -> TickOutcome {
        let mut state = self.slot(kind).lock();
        let Some(active) = state.active.as_mut() else {
            return TickOutcome::Idle;
        };

        let result = match &mut active.sink {
            Sink::File { source, writer, .. } => source
                .read_frame()
                .and_then(|frame| writer.write_frame(&frame)),
            Sink::Buffer { source, frames } => source.read_frame().map(|frame| frames.push(frame)),
        };

        match result {
            Ok(()) => {
                active.frames += 1;
                if let Sink::Buffer { frames, .. } = &active.sink {
                    if !active.warned && frames.len() >= self.frame_buffer_warn {
                        active.warned = true;
                        warn!(
                            %kind,
                            frames = frames.len(),
                            "In-memory recording buffer is growing without bound"
                        );
                    }
                }
                TickOutcome::Captured
            }
            Err(e) => {
                warn!(%kind, error = %e, "Capture failed, stopping recording");
                if let Some(active) = state.active.take() {
                    let captured = release(kind, active);
                    state.salvaged = Some(captured);
                }
                TickOutcome::Stopped
            }
        }
    }

    pub fn stop(&self, kind: RecordingKind) -> Result<StopOutcome, RecordingError> {
        let mut state = self.slot(kind).lock();
        if let Some(active) = state.active.take() {
            let captured = release(kind, active);
            drop(state);
            // Reading and deleting the finished file happens outside the lock.
            return self.package(kind, captured).map(StopOutcome::Stopped);
        }

        let salvaged = state.salvaged.take();
        drop(state);
        let salvaged = salvaged
            .map(|captured| self.package(kind, captured))
            .transpose()?;
        Ok(StopOutcome::NotActive { salvaged })
    }

    /// Stop everything and throw the output away.
    pub fn shutdown(&self) {
        for kind in RecordingKind::ALL {
            let mut state = self.slot(kind).lock();
            if let Some(active) = state.active.take() {
                info!(%kind, "Stopping recording for shutdown");
                release(kind, active).discard();
            }
            if let Some(salvaged) = state.salvaged.take() {
                salvaged.discard();
            }
        }
    }

    fn package(&self, kind: RecordingKind, captured: Captured) -> Result<Recording, RecordingError> {
        let stamp = archive::stamp(&Local::now());
        match captured {
            Captured::File { path, frames } => {
                let data = std::fs::read(&path).map_err(|e| {
                    RecordingError::Package(format!("reading {}: {e}", path.display()))
                })?;
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove recording file");
                }
                Ok(Recording {
                    filename: format!(
                        "{kind}_recording_{stamp}.{}",
                        self.capture.video_extension()
                    ),
                    data,
                    frames,
                })
            }
            Captured::Frames(frames) if !frames.is_empty() => {
                let data = archive::frames_zip(&frames, self.fps)
                    .map_err(|e| RecordingError::Package(e.to_string()))?;
                Ok(Recording {
                    filename: format!("{kind}_recording_{stamp}.zip"),
                    data,
                    frames: frames.len(),
                })
            }
            Captured::Frames(_) | Captured::Nothing => Ok(Recording {
                filename: String::new(),
                data: Vec::new(),
                frames: 0,
            }),
        }
    }
}

/// Release the device and encoder of a recording that is no longer active.
fn release(kind: RecordingKind, active: Active) -> Captured {
    let Active {
        sink,
        started,
        frames,
        ..
    } = active;
    info!(%kind, frames, elapsed = ?started.elapsed(), "Recording stopped");

    match sink {
        Sink::File {
            source,
            writer,
            path,
        } => {
            drop(source);
            if let Err(e) = writer.finish() {
                warn!(%kind, error = %e, "Encoder did not finish cleanly");
            }
            let captured = Captured::File { path, frames };
            if frames == 0 {
                captured.discard();
                Captured::Nothing
            } else {
                captured
            }
        }
        Sink::Buffer { source, frames } => {
            drop(source);
            Captured::Frames(frames)
        }
    }
}

/// Run one sampler task per kind for the life of the process.
///
/// Overlap policy: a tick that runs long makes the sampler skip the missed
/// slots rather than queue them up.
pub fn spawn_samplers(controller: Arc<RecordingController>, period: Duration) -> Vec<JoinHandle<()>> {
    RecordingKind::ALL
        .into_iter()
        .map(|kind| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    // Takes the kind's lock, which `stop` can hold while an encoder finishes.
                    let c = controller.clone();
                    match tokio::task::spawn_blocking(move || c.tick(kind)).await {
                        Ok(TickOutcome::Stopped) => debug!(%kind, "Sampler observed recording stop"),
                        Ok(_) => {}
                        Err(e) => error!(%kind, error = %e, "Tick panicked"),
                    }
                }
            })
        })
        .collect()
}
