use clap::builder::BoolishValueParser;
use clap::Parser;
use directories::ProjectDirs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command line, with every option also settable through `KESTREL_*`.
#[derive(Parser, Debug)]
#[command(name = "kestrel-daemon", about = "Remote control session daemon", version)]
pub struct Args {
    #[arg(long, env = "KESTREL_LISTEN", default_value = "0.0.0.0:12345")]
    listen: SocketAddr,

    /// Shared secret; authentication is off when unset or empty.
    #[arg(long, env = "KESTREL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Discovery code answered by `probe`; generated when unset.
    #[arg(long, env = "KESTREL_CODE")]
    code: Option<String>,

    /// Video4Linux device for the webcam, e.g. `/dev/video0`.
    #[arg(long, env = "KESTREL_WEBCAM_DEVICE", value_name = "PATH")]
    webcam_device: Option<String>,

    #[arg(long, env = "KESTREL_FFMPEG", value_name = "PATH", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Encode recordings to a video file instead of buffering raw frames.
    #[arg(
        long,
        env = "KESTREL_VIDEO_WRITER",
        value_parser = BoolishValueParser::new(),
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    video_writer: bool,

    #[arg(
        long = "sample-interval-ms",
        env = "KESTREL_SAMPLE_INTERVAL_MS",
        value_name = "MS",
        value_parser = parse_millis,
        default_value = "50"
    )]
    sample_interval: Duration,

    #[arg(
        long,
        env = "KESTREL_RECORD_FPS",
        value_parser = clap::value_parser!(u32).range(1..),
        default_value_t = 20
    )]
    record_fps: u32,

    #[arg(
        long = "io-timeout-secs",
        env = "KESTREL_IO_TIMEOUT_SECS",
        value_name = "SECS",
        value_parser = parse_secs,
        default_value = "30"
    )]
    io_timeout: Duration,

    #[arg(long, env = "KESTREL_SCREEN_SIZE", value_name = "WxH", value_parser = parse_size, default_value = "1280x720")]
    screen_size: (u32, u32),

    #[arg(long, env = "KESTREL_WEBCAM_SIZE", value_name = "WxH", value_parser = parse_size, default_value = "640x480")]
    webcam_size: (u32, u32),

    /// Buffered frame count after which a warning is logged.
    #[arg(long, env = "KESTREL_FRAME_BUFFER_WARN", default_value_t = 600)]
    frame_buffer_warn: usize,

    /// Where file-backed recordings are written while in progress.
    #[arg(long, env = "KESTREL_WORK_DIR", value_name = "PATH")]
    work_dir: Option<PathBuf>,
}

impl Args {
    pub fn to_config(&self) -> Config {
        Config {
            listen: self.listen,
            password: non_empty(&self.password),
            code: non_empty(&self.code).unwrap_or_else(generate_code),
            webcam_device: non_empty(&self.webcam_device),
            ffmpeg: self.ffmpeg.clone(),
            video_writer: self.video_writer,
            sample_interval: self.sample_interval,
            record_fps: self.record_fps,
            io_timeout: self.io_timeout,
            screen_size: self.screen_size,
            webcam_size: self.webcam_size,
            frame_buffer_warn: self.frame_buffer_warn,
            work_dir: self.work_dir.clone().unwrap_or_else(default_work_dir),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

/// Runtime configuration, read once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Shared secret. `None` runs the unauthenticated variant.
    pub password: Option<String>,
    pub code: String,
    pub webcam_device: Option<String>,
    pub ffmpeg: PathBuf,
    pub video_writer: bool,
    pub sample_interval: Duration,
    pub record_fps: u32,
    pub io_timeout: Duration,
    pub screen_size: (u32, u32),
    pub webcam_size: (u32, u32),
    pub frame_buffer_warn: usize,
    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 12345)),
            password: None,
            code: generate_code(),
            webcam_device: None,
            ffmpeg: PathBuf::from("ffmpeg"),
            video_writer: true,
            sample_interval: Duration::from_millis(50),
            record_fps: 20,
            io_timeout: Duration::from_secs(30),
            screen_size: (1280, 720),
            webcam_size: (640, 480),
            frame_buffer_warn: 600,
            work_dir: default_work_dir(),
        }
    }
}

impl Config {
    pub fn auth_enabled(&self) -> bool {
        self.password.is_some()
    }
}

fn parse_millis(v: &str) -> Result<Duration, String> {
    match v.trim().parse::<u64>() {
        Ok(0) => Err("must be greater than zero".into()),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_secs(v: &str) -> Result<Duration, String> {
    match v.trim().parse::<u64>() {
        Ok(0) => Err("must be greater than zero".into()),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(e.to_string()),
    }
}

/// Parse `WIDTHxHEIGHT`.
fn parse_size(v: &str) -> Result<(u32, u32), String> {
    let (w, h) = v
        .trim()
        .split_once(['x', 'X'])
        .ok_or("expected WIDTHxHEIGHT")?;
    let w: u32 = w.parse().map_err(|e| format!("width: {e}"))?;
    let h: u32 = h.parse().map_err(|e| format!("height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("dimensions must be non-zero".into());
    }
    Ok((w, h))
}

fn default_work_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("com", "kestrel", "kestrel-daemon") {
        proj_dirs.cache_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("kestrel-daemon")
    }
}

/// Three digits followed by two letters, e.g. `042Kb`.
pub fn generate_code() -> String {
    let bytes = *uuid::Uuid::new_v4().as_bytes();
    let mut code = String::with_capacity(5);
    for b in &bytes[..3] {
        code.push(char::from(b'0' + b % 10));
    }
    for b in &bytes[3..5] {
        let letter = b % 52;
        let c = if letter < 26 {
            b'A' + letter
        } else {
            b'a' + (letter - 26)
        };
        code.push(char::from(c));
    }
    code
}
