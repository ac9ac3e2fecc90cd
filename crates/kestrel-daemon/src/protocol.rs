use serde::{Deserialize, Serialize};

/// Version of the exchange contract implemented by `codec`.
pub const FRAMING_VERSION: u32 = 1;

/// Default number of rows returned by `list_processes`.
pub const DEFAULT_PROCESS_LIMIT: usize = 300;

/// Fields read from every request before the command itself is decoded.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// Commands accepted from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Capture the screen as a PNG
    TakeScreenshot,
    /// Wrap text with a timestamp and return it as a file
    TypedCapture { text: String },
    /// Enumerate running processes
    ListProcesses {
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Terminate every process with a matching name
    CloseProcess { name: String },
    /// Zip a handful of placeholder text files
    GenerateHarmlessFiles {
        #[serde(default)]
        count: Option<usize>,
    },
    /// Launch a program without going through a shell
    OpenProgram {
        cmd: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Grab a single webcam frame
    TakeWebcamPhoto,
    /// Start webcam recording, or stop it if already running
    ToggleWebcamRecording,
    StartScreenRecording,
    StopScreenRecording,
    /// Liveness / discovery check
    Probe {
        #[serde(default)]
        code: Option<String>,
    },
}

impl Command {
    /// Every tag the dispatcher routes. Kept in sync with the enum by `tag()`.
    pub const TAGS: &'static [&'static str] = &[
        "take_screenshot",
        "typed_capture",
        "list_processes",
        "close_process",
        "generate_harmless_files",
        "open_program",
        "take_webcam_photo",
        "toggle_webcam_recording",
        "start_screen_recording",
        "stop_screen_recording",
        "probe",
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Command::TakeScreenshot => "take_screenshot",
            Command::TypedCapture { .. } => "typed_capture",
            Command::ListProcesses { .. } => "list_processes",
            Command::CloseProcess { .. } => "close_process",
            Command::GenerateHarmlessFiles { .. } => "generate_harmless_files",
            Command::OpenProgram { .. } => "open_program",
            Command::TakeWebcamPhoto => "take_webcam_photo",
            Command::ToggleWebcamRecording => "toggle_webcam_recording",
            Command::StartScreenRecording => "start_screen_recording",
            Command::StopScreenRecording => "stop_screen_recording",
            Command::Probe { .. } => "probe",
        }
    }

    pub fn is_known(tag: &str) -> bool {
        Self::TAGS.contains(&tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Structured part of a reply. The payload never goes in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A complete answer to one request: the response plus its out-of-band payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response: Response,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with_status(Status::Ok, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(Status::Error, message)
    }

    fn with_status(status: Status, message: impl Into<String>) -> Self {
        Self {
            response: Response {
                status,
                messages: vec![message.into()],
                filename: None,
            },
            payload: Vec::new(),
        }
    }

    pub fn push(mut self, message: impl Into<String>) -> Self {
        self.response.messages.push(message.into());
        self
    }

    /// Attach a file. An empty body attaches nothing.
    pub fn with_file(mut self, filename: impl Into<String>, data: Vec<u8>) -> Self {
        if !data.is_empty() {
            self.response.filename = Some(filename.into());
            self.payload = data;
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.response.status == Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_variant_tag_is_listed() {
        let commands = [
            Command::TakeScreenshot,
            Command::TypedCapture { text: "x".into() },
            Command::ListProcesses { limit: None },
            Command::CloseProcess { name: "x".into() },
            Command::GenerateHarmlessFiles { count: None },
            Command::OpenProgram {
                cmd: "x".into(),
                args: vec![],
            },
            Command::TakeWebcamPhoto,
            Command::ToggleWebcamRecording,
            Command::StartScreenRecording,
            Command::StopScreenRecording,
            Command::Probe { code: None },
        ];
        assert_eq!(commands.len(), Command::TAGS.len());
        for c in &commands {
            assert!(Command::is_known(c.tag()), "{} missing from TAGS", c.tag());
            let value = serde_json::to_value(c).unwrap();
            assert_eq!(value["command"], c.tag());
        }
    }

    #[test]
    fn command_ignores_password_field() {
        let value = json!({"command": "take_screenshot", "password": "secret"});
        let cmd: Command = serde_json::from_value(value).unwrap();
        assert_eq!(cmd, Command::TakeScreenshot);

        let value = json!({"command": "list_processes", "limit": 5, "password": "secret"});
        let cmd: Command = serde_json::from_value(value).unwrap();
        assert_eq!(cmd, Command::ListProcesses { limit: Some(5) });
    }

    #[test]
    fn envelope_password_is_optional() {
        let env: Envelope = serde_json::from_value(json!({"command": "probe"})).unwrap();
        assert_eq!(env.command, "probe");
        assert!(env.password.is_none());
    }

    #[test]
    fn response_serialization() {
        let reply = Reply::ok("done").push("more");
        let json = serde_json::to_string(&reply.response).unwrap();
        assert_eq!(json, r#"{"status":"ok","messages":["done","more"]}"#);

        let reply = Reply::error("bad").with_file("a.txt", b"hi".to_vec());
        let json = serde_json::to_string(&reply.response).unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""filename":"a.txt""#));
    }

    #[test]
    fn empty_file_attaches_nothing() {
        let reply = Reply::ok("nothing").with_file("empty.zip", Vec::new());
        assert!(reply.response.filename.is_none());
        assert!(reply.payload.is_empty());
    }
}
