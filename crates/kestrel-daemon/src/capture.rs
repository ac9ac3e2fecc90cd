use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::CapabilityError;
use crate::recording::RecordingKind;

/// How long a freshly started capture process gets to deliver its first frame.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// One raw RGB24 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// An open capture device. Dropping it releases the device.
pub trait FrameSource: Send {
    fn dimensions(&self) -> (u32, u32);
    fn read_frame(&mut self) -> Result<Frame, CapabilityError>;
}

/// An open video file being encoded. Dropping without `finish` aborts it.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CapabilityError>;
    fn finish(self: Box<Self>) -> Result<(), CapabilityError>;
}

pub trait CaptureProvider: Send + Sync {
    /// Still image of the screen, PNG encoded.
    fn capture_screen_image(&self) -> Result<Vec<u8>, CapabilityError>;

    /// Single webcam frame, PNG encoded.
    fn capture_webcam_frame(&self) -> Result<Vec<u8>, CapabilityError>;

    fn open_source(&self, kind: RecordingKind) -> Result<Box<dyn FrameSource>, CapabilityError>;

    /// Returns `Ok(None)` when no native encoder is available, in which case
    /// the caller buffers frames itself.
    fn open_video_writer(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Option<Box<dyn VideoWriter>>, CapabilityError>;

    fn video_extension(&self) -> &'static str {
        "mp4"
    }
}

/// Capture through an `ffmpeg` executable: `x11grab` for the screen and
/// `v4l2` for the webcam. Every invocation uses an argument vector.
pub struct FfmpegCapture {
    ffmpeg: PathBuf,
    display: String,
    webcam_device: Option<String>,
    screen_size: (u32, u32),
    webcam_size: (u32, u32),
    fps: u32,
    video_writer: bool,
}

impl FfmpegCapture {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()),
            webcam_device: config.webcam_device.clone(),
            screen_size: config.screen_size,
            webcam_size: config.webcam_size,
            fps: config.record_fps,
            video_writer: config.video_writer,
        }
    }

    fn input_args(&self, kind: RecordingKind) -> Result<Vec<String>, CapabilityError> {
        let (format, size, input) = match kind {
            RecordingKind::Screen => ("x11grab", self.screen_size, self.display.clone()),
            RecordingKind::Webcam => {
                let device = self
                    .webcam_device
                    .clone()
                    .ok_or_else(|| CapabilityError::Unavailable("no webcam configured".into()))?;
                ("v4l2", self.webcam_size, device)
            }
        };
        Ok(vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            format.into(),
            "-video_size".into(),
            format!("{}x{}", size.0, size.1),
            "-framerate".into(),
            self.fps.to_string(),
            "-i".into(),
            input,
        ])
    }

    fn size_of(&self, kind: RecordingKind) -> (u32, u32) {
        match kind {
            RecordingKind::Screen => self.screen_size,
            RecordingKind::Webcam => self.webcam_size,
        }
    }

    fn grab_png(&self, kind: RecordingKind) -> Result<Vec<u8>, CapabilityError> {
        let mut args = self.input_args(kind)?;
        args.extend(
            ["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        debug!(?args, "ffmpeg still capture");

        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CapabilityError::io(format!("failed to run {}", self.ffmpeg.display()), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapabilityError::Failed(format!(
                "{kind} capture failed: {}",
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(CapabilityError::Failed(format!("{kind} capture returned no image")));
        }
        Ok(output.stdout)
    }
}

impl CaptureProvider for FfmpegCapture {
    fn capture_screen_image(&self) -> Result<Vec<u8>, CapabilityError> {
        self.grab_png(RecordingKind::Screen)
    }

    fn capture_webcam_frame(&self) -> Result<Vec<u8>, CapabilityError> {
        self.grab_png(RecordingKind::Webcam)
    }

    fn open_source(&self, kind: RecordingKind) -> Result<Box<dyn FrameSource>, CapabilityError> {
        let mut args = self.input_args(kind)?;
        args.extend(
            ["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        let (width, height) = self.size_of(kind);
        info!(%kind, width, height, fps = self.fps, "Opening capture source");
        debug!(?args, "ffmpeg source");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CapabilityError::io(format!("failed to spawn {}", self.ffmpeg.display()), e))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CapabilityError::Failed("capture process has no stdout".into()));
            }
        };

        // ffmpeg starts even when the display or device is unusable and exits
        // right after, so the source only counts as open once a frame arrives.
        let frame_len = width as usize * height as usize * 3;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut stdout = stdout;
            let mut data = vec![0u8; frame_len];
            let result = stdout.read_exact(&mut data).map(|()| data);
            let _ = tx.send((stdout, result));
        });

        match rx.recv_timeout(OPEN_TIMEOUT) {
            Ok((stdout, Ok(data))) => Ok(Box::new(FfmpegSource {
                child: Some(child),
                stdout,
                first: Some(Frame {
                    width,
                    height,
                    data,
                }),
                width,
                height,
            })),
            Ok((_, Err(e))) => {
                let _ = child.kill();
                let status = child
                    .wait()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "unknown status".into());
                warn!(%kind, error = %e, %status, "Capture process exited before the first frame");
                Err(CapabilityError::Unavailable(format!(
                    "{kind} capture device did not open (ffmpeg {status})"
                )))
            }
            Err(_) => {
                // Killing the child ends the reader thread with EOF.
                let _ = child.kill();
                let _ = child.wait();
                Err(CapabilityError::Unavailable(format!(
                    "{kind} capture device produced no frame within {}s",
                    OPEN_TIMEOUT.as_secs()
                )))
            }
        }
    }

    fn open_video_writer(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Option<Box<dyn VideoWriter>>, CapabilityError> {
        if !self.video_writer {
            return Ok(None);
        }

        let args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-video_size".into(),
            format!("{width}x{height}"),
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            "mpeg4".into(),
            "-q:v".into(),
            "5".into(),
        ];

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CapabilityError::io(format!("failed to spawn {}", self.ffmpeg.display()), e))?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CapabilityError::Failed("encoder process has no stdin".into()));
            }
        };

        Ok(Some(Box::new(FfmpegWriter {
            child: Some(child),
            stdin: Some(stdin),
            frame_len: width as usize * height as usize * 3,
        })))
    }
}

struct FfmpegSource {
    child: Option<Child>,
    stdout: ChildStdout,
    /// Frame read while confirming the device opened.
    first: Option<Frame>,
    width: u32,
    height: u32,
}

impl FrameSource for FfmpegSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame(&mut self) -> Result<Frame, CapabilityError> {
        if let Some(frame) = self.first.take() {
            return Ok(frame);
        }
        let mut data = vec![0u8; self.width as usize * self.height as usize * 3];
        self.stdout
            .read_exact(&mut data)
            .map_err(|e| CapabilityError::io("frame read failed", e))?;
        Ok(Frame {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("Stopping capture process");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

struct FfmpegWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frame_len: usize,
}

impl VideoWriter for FfmpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CapabilityError> {
        if frame.data.len() != self.frame_len {
            return Err(CapabilityError::Failed(format!(
                "frame is {} bytes, encoder expects {}",
                frame.data.len(),
                self.frame_len
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CapabilityError::Failed("encoder already closed".into()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| CapabilityError::io("encoder write failed", e))
    }

    fn finish(mut self: Box<Self>) -> Result<(), CapabilityError> {
        // Closing stdin lets ffmpeg flush and write the trailer.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| CapabilityError::io("encoder wait failed", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(CapabilityError::Failed(format!("encoder exited with {status}")))
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            warn!("Encoder dropped before finish, killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
