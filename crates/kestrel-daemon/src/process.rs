use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::CapabilityError;

/// Longest user name shown in a listing.
pub const MAX_USER_LEN: usize = 15;

/// How long a terminated process gets to exit before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// How long a killed process gets to disappear before it is reported as still running.
const KILL_WAIT: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessList {
    pub shown: Vec<ProcessInfo>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminateReport {
    pub matched: Vec<u32>,
    /// Processes that ignored the grace period and were killed.
    pub forced: Vec<u32>,
    /// Processes still running after the kill, e.g. because signalling them
    /// was not permitted.
    pub survivors: Vec<u32>,
}

impl TerminateReport {
    pub fn found(&self) -> bool {
        !self.matched.is_empty()
    }

    pub fn terminated(&self) -> usize {
        self.matched.len() - self.survivors.len()
    }
}

pub trait ProcessProvider: Send + Sync {
    fn list(&self, limit: usize) -> Result<ProcessList, CapabilityError>;
    fn terminate_by_name(&self, name: &str) -> Result<TerminateReport, CapabilityError>;
}

pub trait Launcher: Send + Sync {
    /// Start a program from an argument vector and return its pid.
    fn launch(&self, argv: &[String]) -> Result<u32, CapabilityError>;
}

/// Process table read from `/proc`, signals sent with the `kill` utility.
pub struct ProcFs {
    root: &'static Path,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: Path::new("/proc"),
        }
    }
}

impl ProcFs {
    fn ensure_available(&self) -> Result<(), CapabilityError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(CapabilityError::Unavailable(
                "process table is not available on this platform".into(),
            ))
        }
    }

    fn pids(&self) -> Result<Vec<u32>, CapabilityError> {
        let entries = std::fs::read_dir(self.root)
            .map_err(|e| CapabilityError::io("reading process table", e))?;
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn name_of(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(self.root.join(pid.to_string()).join("comm")).ok()?;
        Some(comm.trim_end().to_string())
    }

    /// `comm` is cut at 15 bytes, so also look at the executable in `cmdline`.
    fn exe_name_of(&self, pid: u32) -> Option<String> {
        let raw = std::fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        let argv0 = raw.split(|b| *b == 0).next()?;
        let argv0 = String::from_utf8_lossy(argv0);
        let base = argv0.rsplit('/').next()?.to_string();
        (!base.is_empty()).then_some(base)
    }

    fn uid_of(&self, pid: u32) -> Option<u32> {
        let status = std::fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        parse_uid(&status)
    }

    fn is_alive(&self, pid: u32) -> bool {
        match std::fs::read_to_string(self.root.join(pid.to_string()).join("stat")) {
            // Zombies stay in the table until reaped but are already gone.
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state != "Z")
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    fn wait_for_exit(&self, pids: &[u32], timeout: Duration) -> Vec<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            let alive: Vec<u32> = pids.iter().copied().filter(|p| self.is_alive(*p)).collect();
            if alive.is_empty() || Instant::now() >= deadline {
                return alive;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ProcessProvider for ProcFs {
    fn list(&self, limit: usize) -> Result<ProcessList, CapabilityError> {
        self.ensure_available()?;
        let users = std::fs::read_to_string("/etc/passwd")
            .map(|content| parse_passwd(&content))
            .unwrap_or_default();

        let pids = self.pids()?;
        let mut all = Vec::with_capacity(pids.len());
        for pid in pids {
            // Processes can exit between read_dir and here.
            let Some(name) = self.name_of(pid) else {
                continue;
            };
            let user = match self.uid_of(pid) {
                Some(uid) => users.get(&uid).cloned().unwrap_or_else(|| uid.to_string()),
                None => "?".to_string(),
            };
            all.push(ProcessInfo {
                pid,
                user: truncate_user(&user),
                name,
            });
        }

        let total = all.len();
        all.truncate(limit);
        Ok(ProcessList { shown: all, total })
    }

    fn terminate_by_name(&self, name: &str) -> Result<TerminateReport, CapabilityError> {
        self.ensure_available()?;
        let own = std::process::id();
        let matched: Vec<u32> = self
            .pids()?
            .into_iter()
            .filter(|pid| *pid != own)
            .filter(|pid| {
                self.name_of(*pid).is_some_and(|n| name_matches(&n, name))
                    || self.exe_name_of(*pid).is_some_and(|n| name_matches(&n, name))
            })
            .collect();

        if matched.is_empty() {
            return Ok(TerminateReport::default());
        }

        info!(name, pids = ?matched, "Terminating processes");
        send_signal("-TERM", &matched)?;
        let mut forced = self.wait_for_exit(&matched, TERMINATE_GRACE);
        let mut survivors = Vec::new();
        if !forced.is_empty() {
            warn!(pids = ?forced, "Processes ignored SIGTERM, killing");
            send_signal("-KILL", &forced)?;
            survivors = self.wait_for_exit(&forced, KILL_WAIT);
            if !survivors.is_empty() {
                error!(pids = ?survivors, "Processes survived SIGKILL");
            }
            forced.retain(|pid| !survivors.contains(pid));
        }

        Ok(TerminateReport {
            matched,
            forced,
            survivors,
        })
    }
}

fn send_signal(signal: &str, pids: &[u32]) -> Result<(), CapabilityError> {
    let status = Command::new("kill")
        .arg(signal)
        .args(pids.iter().map(|p| p.to_string()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| CapabilityError::io("running kill", e))?;
    // A non-zero status means at least one pid was gone or not ours to signal;
    // the caller checks which ones are still alive.
    if status.success() {
        debug!(signal, ?pids, "Signal sent");
    } else {
        warn!(signal, ?pids, %status, "kill reported a failure");
    }
    Ok(())
}

pub fn name_matches(candidate: &str, wanted: &str) -> bool {
    let wanted = wanted.trim();
    !wanted.is_empty() && candidate.eq_ignore_ascii_case(wanted)
}

pub fn truncate_user(user: &str) -> String {
    user.chars().take(MAX_USER_LEN).collect()
}

fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

fn parse_passwd(content: &str) -> HashMap<u32, String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let uid = fields.nth(1)?.parse().ok()?;
            Some((uid, name.to_string()))
        })
        .collect()
}

/// Starts programs detached, without a shell, and reaps them in the background.
#[derive(Default)]
pub struct SpawnLauncher;

impl Launcher for SpawnLauncher {
    fn launch(&self, argv: &[String]) -> Result<u32, CapabilityError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CapabilityError::Failed("no program given".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CapabilityError::io(format!("failed to start {program}"), e))?;
        let pid = child.id();
        info!(%program, pid, "Program launched");

        let program = program.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!(%program, pid, %status, "Launched program exited"),
            Err(e) => error!(%program, pid, error = %e, "Error waiting for launched program"),
        });

        Ok(pid)
    }
}

/// Turn the `cmd`/`args` request fields into an argument vector.
///
/// With explicit `args`, `cmd` is the program as-is. Otherwise `cmd` is an
/// existing path taken whole, or else split on whitespace (no quoting).
pub fn build_argv(cmd: &str, args: &[String]) -> Vec<String> {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Vec::new();
    }
    if !args.is_empty() || Path::new(cmd).exists() {
        let mut argv = vec![cmd.to_string()];
        argv.extend(args.iter().cloned());
        return argv;
    }
    cmd.split_whitespace().map(str::to_string).collect()
}
