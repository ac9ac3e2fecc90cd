use chrono::Local;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::archive::{self, DEFAULT_HARMLESS_FILES, MAX_HARMLESS_FILES};
use crate::capture::CaptureProvider;
use crate::config::Config;
use crate::error::{CapabilityError, DispatchError};
use crate::process::{self, Launcher, ProcessProvider};
use crate::protocol::{Command, Envelope, Reply, DEFAULT_PROCESS_LIMIT, FRAMING_VERSION};
use crate::recording::{RecordingController, RecordingKind, StartOutcome, StopOutcome};

/// Addresses of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

pub struct Dispatcher {
    config: Arc<Config>,
    recordings: Arc<RecordingController>,
    capture: Arc<dyn CaptureProvider>,
    processes: Arc<dyn ProcessProvider>,
    launcher: Arc<dyn Launcher>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        recordings: Arc<RecordingController>,
        capture: Arc<dyn CaptureProvider>,
        processes: Arc<dyn ProcessProvider>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            config,
            recordings,
            capture,
            processes,
            launcher,
        }
    }

    /// Authenticate, route and execute one request. Never fails: every error
    /// becomes an error reply.
    pub async fn dispatch(self: &Arc<Self>, request: Value, conn: ConnectionInfo) -> Reply {
        let command = match self.decode(request) {
            Ok(command) => command,
            Err(e) => {
                warn!(peer = %conn.peer, error = %e, "Request rejected");
                return Reply::error(e.to_string());
            }
        };

        let tag = command.tag();
        info!(peer = %conn.peer, command = tag, "Dispatching");

        // Handlers block on devices and child processes.
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.execute(command, conn)).await;
        match result {
            Ok(Ok(reply)) => {
                debug!(command = tag, ok = reply.is_ok(), payload = reply.payload.len(), "Handled");
                reply
            }
            Ok(Err(e)) => {
                warn!(command = tag, error = %e, "Command failed");
                Reply::error(e.to_string())
            }
            Err(e) => {
                let e = DispatchError::Internal(if e.is_panic() {
                    format!("{tag} handler panicked")
                } else {
                    format!("{tag} handler was cancelled")
                });
                warn!(command = tag, error = %e, "Command aborted");
                Reply::error(e.to_string())
            }
        }
    }

    fn decode(&self, request: Value) -> Result<Command, DispatchError> {
        let envelope: Envelope =
            serde_json::from_value(request.clone()).map_err(|_| DispatchError::InvalidArguments {
                command: "request".into(),
                reason: "expected an object with a string \"command\" field".into(),
            })?;

        self.authenticate(&envelope)?;

        if !Command::is_known(&envelope.command) {
            return Err(DispatchError::UnknownCommand(envelope.command));
        }
        serde_json::from_value(request).map_err(|e| DispatchError::InvalidArguments {
            command: envelope.command,
            reason: e.to_string(),
        })
    }

    /// Plain string comparison against the shared secret. `probe` is exempt so
    /// discovery works without it.
    fn authenticate(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let Some(secret) = self.config.password.as_deref() else {
            return Ok(());
        };
        if envelope.command == "probe" {
            return Ok(());
        }
        match envelope.password.as_deref() {
            Some(given) if given == secret => Ok(()),
            _ => Err(DispatchError::Auth),
        }
    }

    fn execute(&self, command: Command, conn: ConnectionInfo) -> Result<Reply, DispatchError> {
        let now = Local::now();
        match command {
            Command::TakeScreenshot => {
                let png = self.capture.capture_screen_image()?;
                Ok(Reply::ok("Screenshot captured")
                    .with_file(format!("screenshot_{}.png", archive::stamp(&now)), png))
            }
            Command::TypedCapture { text } => {
                let (filename, body) = archive::typed_capture(&text, &now);
                Ok(Reply::ok(format!("Captured {} characters", text.chars().count()))
                    .with_file(filename, body))
            }
            Command::ListProcesses { limit } => {
                let limit = limit.unwrap_or(DEFAULT_PROCESS_LIMIT);
                let list = self.processes.list(limit)?;
                let mut reply = Reply::ok(format!("{:>7} {:<15} {}", "PID", "USER", "NAME"));
                for p in &list.shown {
                    reply = reply.push(format!("{:>7} {:<15} {}", p.pid, p.user, p.name));
                }
                Ok(reply.push(format!(
                    "Showing {} of {} processes",
                    list.shown.len(),
                    list.total
                )))
            }
            Command::CloseProcess { name } => {
                if name.trim().is_empty() {
                    return Err(DispatchError::InvalidArguments {
                        command: "close_process".into(),
                        reason: "name must not be empty".into(),
                    });
                }
                let report = self.processes.terminate_by_name(&name)?;
                if !report.found() {
                    return Ok(Reply::error(format!("No process named '{}' found", name.trim())));
                }
                let name = name.trim();
                let mut reply = if report.terminated() == 0 {
                    Reply::error(format!(
                        "Could not terminate {} process(es) named '{name}'",
                        report.matched.len()
                    ))
                } else {
                    Reply::ok(format!(
                        "Terminated {} process(es) named '{name}'",
                        report.terminated()
                    ))
                };
                if !report.forced.is_empty() {
                    reply = reply.push(format!(
                        "{} did not exit within {}s and were killed",
                        report.forced.len(),
                        process::TERMINATE_GRACE.as_secs()
                    ));
                }
                if !report.survivors.is_empty() {
                    let pids: Vec<String> = report.survivors.iter().map(u32::to_string).collect();
                    reply = reply.push(format!("Still running: pid {}", pids.join(", ")));
                }
                Ok(reply)
            }
            Command::GenerateHarmlessFiles { count } => {
                let count = count.unwrap_or(DEFAULT_HARMLESS_FILES);
                if count == 0 || count > MAX_HARMLESS_FILES {
                    return Err(DispatchError::InvalidArguments {
                        command: "generate_harmless_files".into(),
                        reason: format!("count must be between 1 and {MAX_HARMLESS_FILES}"),
                    });
                }
                let (filename, zip) = archive::harmless_files(count, &now)
                    .map_err(|e| CapabilityError::Failed(format!("archive failed: {e}")))?;
                Ok(Reply::ok(format!("Generated {count} placeholder files")).with_file(filename, zip))
            }
            Command::OpenProgram { cmd, args } => {
                let argv = process::build_argv(&cmd, &args);
                if argv.is_empty() {
                    return Err(DispatchError::InvalidArguments {
                        command: "open_program".into(),
                        reason: "cmd must not be empty".into(),
                    });
                }
                let pid = self.launcher.launch(&argv)?;
                Ok(Reply::ok(format!("Started {} (pid {pid})", argv[0])))
            }
            Command::TakeWebcamPhoto => {
                let png = self.capture.capture_webcam_frame()?;
                Ok(Reply::ok("Webcam photo captured")
                    .with_file(format!("webcam_{}.png", archive::stamp(&now)), png))
            }
            Command::ToggleWebcamRecording => {
                if self.recordings.is_active(RecordingKind::Webcam) {
                    self.stop_recording(RecordingKind::Webcam)
                } else {
                    self.start_recording(RecordingKind::Webcam)
                }
            }
            Command::StartScreenRecording => self.start_recording(RecordingKind::Screen),
            Command::StopScreenRecording => self.stop_recording(RecordingKind::Screen),
            Command::Probe { code } => Ok(self.probe(code.as_deref(), conn)),
        }
    }

    fn start_recording(&self, kind: RecordingKind) -> Result<Reply, DispatchError> {
        match self.recordings.start(kind)? {
            StartOutcome::Started { file_backed } => {
                let mode = if file_backed {
                    "encoding to a video file"
                } else {
                    "buffering frames in memory"
                };
                Ok(Reply::ok(format!("{kind} recording started")).push(mode))
            }
            StartOutcome::AlreadyActive => Ok(Reply::ok(format!("{kind} recording already active"))),
        }
    }

    fn stop_recording(&self, kind: RecordingKind) -> Result<Reply, DispatchError> {
        match self.recordings.stop(kind)? {
            StopOutcome::Stopped(rec) if rec.data.is_empty() => {
                Ok(Reply::ok(format!("{kind} recording stopped")).push("Nothing was captured"))
            }
            StopOutcome::Stopped(rec) => Ok(Reply::ok(format!("{kind} recording stopped"))
                .push(format!("{} frames captured", rec.frames))
                .with_file(rec.filename, rec.data)),
            StopOutcome::NotActive { salvaged: Some(rec) } if !rec.data.is_empty() => {
                Ok(Reply::ok(format!("{kind} recording not active"))
                    .push(format!(
                        "The last recording ended on a capture failure; returning {} frames captured before it",
                        rec.frames
                    ))
                    .with_file(rec.filename, rec.data))
            }
            StopOutcome::NotActive { .. } => Ok(Reply::ok(format!("{kind} recording not active"))),
        }
    }

    fn probe(&self, code: Option<&str>, conn: ConnectionInfo) -> Reply {
        match code {
            None => Reply::ok("alive"),
            Some(code) if code.trim() == self.config.code => Reply::ok("code accepted")
                .push(format!("address {}", conn.local))
                .push(format!("framing version {FRAMING_VERSION}")),
            Some(_) => Reply::error("code mismatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::FakeCapture;
    use crate::process::{ProcessInfo, ProcessList, TerminateReport};
    use crate::protocol::Status;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProcesses {
        list_calls: AtomicUsize,
        last_limit: Mutex<Option<usize>>,
    }

    impl ProcessProvider for FakeProcesses {
        fn list(&self, limit: usize) -> Result<ProcessList, CapabilityError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_limit.lock().unwrap() = Some(limit);
            let all: Vec<ProcessInfo> = (1..=3)
                .map(|pid| ProcessInfo {
                    pid,
                    user: "root".into(),
                    name: format!("proc{pid}"),
                })
                .collect();
            Ok(ProcessList {
                shown: all.into_iter().take(limit).collect(),
                total: 3,
            })
        }

        fn terminate_by_name(&self, name: &str) -> Result<TerminateReport, CapabilityError> {
            let report = match name.to_ascii_lowercase().as_str() {
                "proc1" => TerminateReport {
                    matched: vec![1],
                    ..TerminateReport::default()
                },
                // Signals refused for every match.
                "guarded" => TerminateReport {
                    matched: vec![7, 8],
                    forced: vec![],
                    survivors: vec![7, 8],
                },
                // One exits, one needs a kill, one cannot be signalled.
                "mixed" => TerminateReport {
                    matched: vec![1, 2, 3],
                    forced: vec![2],
                    survivors: vec![3],
                },
                _ => TerminateReport::default(),
            };
            Ok(report)
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<Vec<String>>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, argv: &[String]) -> Result<u32, CapabilityError> {
            self.launched.lock().unwrap().push(argv.to_vec());
            Ok(4242)
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        processes: Arc<FakeProcesses>,
        launcher: Arc<FakeLauncher>,
        recordings: Arc<RecordingController>,
    }

    fn harness(password: Option<&str>, capture: FakeCapture) -> Harness {
        let config = Arc::new(Config {
            password: password.map(str::to_string),
            code: "123Ab".into(),
            work_dir: std::env::temp_dir().join(format!("kestrel-test-{}", uuid::Uuid::new_v4())),
            ..Config::default()
        });
        let capture: Arc<dyn CaptureProvider> = Arc::new(capture);
        let recordings = Arc::new(RecordingController::new(capture.clone(), &config));
        let processes = Arc::new(FakeProcesses::default());
        let launcher = Arc::new(FakeLauncher::default());
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            recordings.clone(),
            capture,
            processes.clone(),
            launcher.clone(),
        ));
        Harness {
            dispatcher,
            processes,
            launcher,
            recordings,
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            peer: "10.0.0.2:50000".parse().unwrap(),
            local: "10.0.0.1:12345".parse().unwrap(),
        }
    }

    async fn send(h: &Harness, request: Value) -> Reply {
        h.dispatcher.dispatch(request, conn()).await
    }

    #[tokio::test]
    async fn unknown_command_names_the_tag() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "launch_rockets"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.messages[0].contains("launch_rockets"));
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"text": "hi"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(!reply.response.messages.is_empty());
    }

    #[tokio::test]
    async fn wrong_password_runs_nothing() {
        let h = harness(Some("right"), FakeCapture::default());
        let reply = send(&h, json!({"command": "list_processes", "password": "wrong"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert_eq!(reply.response.messages, vec!["authentication failed"]);
        assert_eq!(h.processes.list_calls.load(Ordering::SeqCst), 0);

        let reply = send(&h, json!({"command": "list_processes"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert_eq!(h.processes.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auth_failure_hides_command_validity() {
        let h = harness(Some("right"), FakeCapture::default());
        let reply = send(&h, json!({"command": "no_such_thing", "password": "nope"})).await;
        assert_eq!(reply.response.messages, vec!["authentication failed"]);
    }

    #[tokio::test]
    async fn right_password_runs_command() {
        let h = harness(Some("right"), FakeCapture::default());
        let reply = send(&h, json!({"command": "list_processes", "password": "right"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert_eq!(h.processes.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_processes_defaults_and_summary() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "list_processes"})).await;
        assert_eq!(*h.processes.last_limit.lock().unwrap(), Some(DEFAULT_PROCESS_LIMIT));
        let messages = &reply.response.messages;
        assert_eq!(messages.len(), 5);
        assert!(messages[1].contains("proc1"));
        assert_eq!(messages.last().unwrap(), "Showing 3 of 3 processes");

        let reply = send(&h, json!({"command": "list_processes", "limit": 2})).await;
        assert_eq!(reply.response.messages.last().unwrap(), "Showing 2 of 3 processes");
    }

    #[tokio::test]
    async fn typed_capture_returns_text_file() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "typed_capture", "text": "hello"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.filename.as_deref().unwrap().ends_with(".txt"));
        assert!(String::from_utf8(reply.payload).unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn typed_capture_requires_text() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "typed_capture"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.messages[0].contains("typed_capture"));
    }

    #[tokio::test]
    async fn close_process_reports_found_and_missing() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "close_process", "name": "PROC1"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages[0].contains("Terminated 1"));

        let reply = send(&h, json!({"command": "close_process", "name": "ghost"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.messages[0].contains("ghost"));
    }

    #[tokio::test]
    async fn close_process_reports_processes_left_running() {
        let h = harness(None, FakeCapture::default());

        let reply = send(&h, json!({"command": "close_process", "name": "guarded"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.messages[0].contains("Could not terminate 2"));
        assert!(reply
            .response
            .messages
            .iter()
            .any(|m| m == "Still running: pid 7, 8"));

        let reply = send(&h, json!({"command": "close_process", "name": "mixed"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages[0].contains("Terminated 2"));
        assert!(reply.response.messages[1].starts_with("1 did not exit"));
        assert_eq!(reply.response.messages[2], "Still running: pid 3");
    }

    #[tokio::test]
    async fn open_program_uses_argv() {
        let h = harness(None, FakeCapture::default());
        let reply = send(
            &h,
            json!({"command": "open_program", "cmd": "gedit", "args": ["notes; rm -rf /"]}),
        )
        .await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages[0].contains("4242"));
        let launched = h.launcher.launched.lock().unwrap();
        assert_eq!(launched[0], vec!["gedit", "notes; rm -rf /"]);
    }

    #[tokio::test]
    async fn harmless_files_are_zipped() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "generate_harmless_files"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.filename.as_deref().unwrap().ends_with(".zip"));
        assert!(reply.payload.starts_with(b"PK"));

        let reply = send(&h, json!({"command": "generate_harmless_files", "count": 0})).await;
        assert_eq!(reply.response.status, Status::Error);
    }

    #[tokio::test]
    async fn screenshot_and_webcam_photo() {
        let h = harness(None, FakeCapture::default());
        let reply = send(&h, json!({"command": "take_screenshot"})).await;
        assert!(reply.response.filename.as_deref().unwrap().ends_with(".png"));
        assert!(!reply.payload.is_empty());

        let reply = send(&h, json!({"command": "take_webcam_photo"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.filename.as_deref().unwrap().starts_with("webcam_"));
    }

    #[tokio::test]
    async fn webcam_photo_without_device_is_an_error() {
        let h = harness(
            None,
            FakeCapture {
                webcam: false,
                ..FakeCapture::default()
            },
        );
        let reply = send(&h, json!({"command": "take_webcam_photo"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.messages[0].contains("no webcam"));
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn screen_recording_lifecycle() {
        let h = harness(None, FakeCapture::default());

        let reply = send(&h, json!({"command": "stop_screen_recording"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages[0].contains("not active"));
        assert!(reply.payload.is_empty());

        let reply = send(&h, json!({"command": "start_screen_recording"})).await;
        assert!(reply.response.messages[0].contains("started"));
        let reply = send(&h, json!({"command": "start_screen_recording"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages[0].contains("already active"));

        h.recordings.tick(RecordingKind::Screen);
        h.recordings.tick(RecordingKind::Screen);

        let reply = send(&h, json!({"command": "stop_screen_recording"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply.response.messages.iter().any(|m| m.contains("2 frames")));
        assert!(reply.response.filename.as_deref().unwrap().ends_with(".zip"));
        assert!(!reply.payload.is_empty());
    }

    #[tokio::test]
    async fn toggle_webcam_starts_then_stops() {
        let h = harness(None, FakeCapture::default());

        let reply = send(&h, json!({"command": "toggle_webcam_recording"})).await;
        assert!(reply.response.messages[0].contains("webcam recording started"));
        assert!(h.recordings.is_active(RecordingKind::Webcam));

        h.recordings.tick(RecordingKind::Webcam);
        let reply = send(&h, json!({"command": "toggle_webcam_recording"})).await;
        assert!(reply.response.messages[0].contains("webcam recording stopped"));
        assert!(!reply.payload.is_empty());
        assert!(!h.recordings.is_active(RecordingKind::Webcam));
    }

    #[tokio::test]
    async fn recording_open_failure_is_an_error() {
        let h = harness(
            None,
            FakeCapture {
                fail_open: true,
                ..FakeCapture::default()
            },
        );
        let reply = send(&h, json!({"command": "start_screen_recording"})).await;
        assert_eq!(reply.response.status, Status::Error);
        assert!(!h.recordings.is_active(RecordingKind::Screen));
    }

    #[tokio::test]
    async fn probe_codes() {
        let h = harness(Some("right"), FakeCapture::default());

        let reply = send(&h, json!({"command": "probe"})).await;
        assert_eq!(reply.response.status, Status::Ok);

        let reply = send(&h, json!({"command": "probe", "code": "123Ab"})).await;
        assert_eq!(reply.response.status, Status::Ok);
        assert!(reply
            .response
            .messages
            .iter()
            .any(|m| m == "address 10.0.0.1:12345"));

        let reply = send(&h, json!({"command": "probe", "code": ""})).await;
        assert_eq!(reply.response.status, Status::Error);
        let reply = send(&h, json!({"command": "probe", "code": "999Zz"})).await;
        assert_eq!(reply.response.status, Status::Error);
    }
}
