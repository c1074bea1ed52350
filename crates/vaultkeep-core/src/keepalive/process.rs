//! Launching, finding and stopping the detached watchdog process.
//!
//! The watchdog is the same executable re-invoked with a hidden subcommand.
//! It is started in its own session (Unix) or as a detached process
//! (Windows) with stdio pointed at null, so it survives the interactive
//! process exiting or being killed. The launcher records the child's PID and
//! hard deadline in a PID file so that a later interactive process can find
//! and stop it. A recorded PID is only trusted while the deadline has not
//! passed and, where the command line is readable, while the process is
//! still a watchdog for that same PID file.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::utils::write_private;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to locate the vaultkeep executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("Failed to spawn keepalive process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to write PID file {} for keepalive process {pid}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stop keepalive process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
}

/// Everything a watchdog run needs, passed by value on its command line.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogArgs {
    pub endpoint: String,
    /// Absolute hard deadline of the run
    pub deadline: DateTime<Utc>,
    pub min_interval: u64,
    pub max_interval: u64,
    pub token_path: PathBuf,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    pub verify_ssl: bool,
}

impl WatchdogArgs {
    /// Command-line flags understood by `vaultkeep keepalive run`
    pub fn to_flags(&self) -> Vec<OsString> {
        let mut flags: Vec<OsString> = vec![
            "--endpoint".into(),
            self.endpoint.clone().into(),
            "--deadline".into(),
            self.deadline.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
            "--min-interval".into(),
            self.min_interval.to_string().into(),
            "--max-interval".into(),
            self.max_interval.to_string().into(),
            "--token-path".into(),
            self.token_path.clone().into(),
            "--log-path".into(),
            self.log_path.clone().into(),
            "--pid-path".into(),
            self.pid_path.clone().into(),
        ];
        if self.verify_ssl {
            flags.push("--verify-ssl".into());
        }
        flags
    }
}

/// Slack past the deadline for a final in-flight probe
const PID_GRACE_SECS: i64 = 300;

/// Contents of the PID file: the PID, then the run's hard deadline on a
/// second line. A file holding only a PID is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub deadline: Option<DateTime<Utc>>,
}

impl PidRecord {
    pub fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse::<u32>().ok()?;
        let deadline = lines
            .next()
            .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
            .map(|d| d.with_timezone(&Utc));
        Some(Self { pid, deadline })
    }

    pub fn render(&self) -> String {
        match self.deadline {
            Some(deadline) => format!(
                "{}\n{}\n",
                self.pid,
                deadline.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => format!("{}\n", self.pid),
        }
    }

    /// The watchdog exits at its deadline, so a record well past it is stale
    /// whatever process now holds the PID.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline
            .is_some_and(|deadline| now > deadline + chrono::Duration::seconds(PID_GRACE_SECS))
    }
}

/// A running (or recently running) watchdog process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogHandle {
    pub pid: u32,
    pub pid_path: PathBuf,
}

/// Process-level control of watchdogs.
pub trait WatchdogLauncher: Send + Sync {
    fn launch(&self, args: &WatchdogArgs) -> Result<WatchdogHandle, LaunchError>;

    /// Ask the watchdog to stop and forget its PID file. Does not wait.
    fn terminate(&self, handle: &WatchdogHandle) -> Result<(), LaunchError>;

    fn is_alive(&self, handle: &WatchdogHandle) -> bool;

    /// Adopt a watchdog left running by an earlier process. A stale PID file
    /// is removed.
    fn find_running(&self, pid_path: &Path) -> Option<WatchdogHandle>;
}

/// Launches watchdogs by re-executing `program` with `prefix_args` followed
/// by the watchdog flags.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    prefix_args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, prefix_args: Vec<OsString>) -> Self {
        Self {
            program,
            prefix_args,
        }
    }

    /// Re-execute the running binary
    pub fn current_exe(prefix_args: Vec<OsString>) -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::new(program, prefix_args))
    }

    pub fn command(&self, args: &WatchdogArgs) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args.to_flags())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = args.pid_path.parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        detach(&mut cmd);
        cmd
    }
}

impl WatchdogLauncher for ProcessLauncher {
    fn launch(&self, args: &WatchdogArgs) -> Result<WatchdogHandle, LaunchError> {
        let mut child = self.command(args).spawn().map_err(LaunchError::Spawn)?;
        let pid = child.id();

        let record = PidRecord {
            pid,
            deadline: Some(args.deadline),
        };
        if let Err(source) = write_private(&args.pid_path, record.render().as_bytes()) {
            // Without a PID file nothing could ever find or stop it
            if let Err(e) = child.kill() {
                warn!(pid, error = %e, "Failed to kill untracked keepalive process");
            }
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "Failed to reap untracked keepalive process");
            }
            return Err(LaunchError::PidFile {
                path: args.pid_path.clone(),
                pid,
                source,
            });
        }
        // Never waited on: the watchdog outlives this process
        drop(child);

        info!(pid, pid_path = %args.pid_path.display(), "Keepalive process spawned");
        Ok(WatchdogHandle {
            pid,
            pid_path: args.pid_path.clone(),
        })
    }

    fn terminate(&self, handle: &WatchdogHandle) -> Result<(), LaunchError> {
        let result = if runs_watchdog_for(handle.pid, &handle.pid_path) == Some(false) {
            debug!(pid = handle.pid, "PID no longer belongs to the keepalive, not signalling");
            Ok(())
        } else {
            terminate_process(handle.pid).map_err(|reason| LaunchError::Terminate {
                pid: handle.pid,
                reason,
            })
        };
        remove_pid_file_if_owned(&handle.pid_path, handle.pid);
        result
    }

    fn is_alive(&self, handle: &WatchdogHandle) -> bool {
        process_alive(handle.pid)
    }

    fn find_running(&self, pid_path: &Path) -> Option<WatchdogHandle> {
        let record = read_pid_record(pid_path)?;
        let pid = record.pid;

        let stale = if record.is_expired(Utc::now()) {
            Some("past its deadline")
        } else if !process_alive(pid) {
            Some("not running")
        } else if runs_watchdog_for(pid, pid_path) == Some(false) {
            Some("PID reused by another process")
        } else {
            None
        };

        match stale {
            Some(reason) => {
                debug!(pid, reason, "Removing stale keepalive PID file");
                remove_pid_file_if_owned(pid_path, pid);
                None
            }
            None => {
                debug!(pid, "Found running keepalive");
                Some(WatchdogHandle {
                    pid,
                    pid_path: pid_path.to_path_buf(),
                })
            }
        }
    }
}

/// Record in `path`, if the file exists, parses and names a PID we may signal
pub fn read_pid_record(path: &Path) -> Option<PidRecord> {
    let contents = std::fs::read_to_string(path).ok()?;
    PidRecord::parse(&contents).filter(|record| is_signalable(record.pid))
}

/// Remove the PID file only while it still names `pid`, so an exiting old
/// watchdog never deletes the record of its replacement.
pub fn remove_pid_file_if_owned(path: &Path, pid: u32) {
    let owned = std::fs::read_to_string(path)
        .ok()
        .and_then(|c| PidRecord::parse(&c))
        .map(|record| record.pid)
        == Some(pid);
    if !owned {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// Never signal pid 0/1 (process group / init) or ourselves.
fn is_signalable(pid: u32) -> bool {
    pid > 1 && pid != std::process::id()
}

/// Whether `pid` is a watchdog for `pid_path`, judged by its `--pid-path`
/// argument. `None` when the command line cannot be read.
#[cfg(target_os = "linux")]
fn runs_watchdog_for(pid: u32, pid_path: &Path) -> Option<bool> {
    use std::os::unix::ffi::OsStrExt;

    let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let mut args = cmdline.split(|b| *b == 0);
    let found = args.by_ref().any(|arg| arg == b"--pid-path".as_slice());
    Some(found && args.next() == Some(pid_path.as_os_str().as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn runs_watchdog_for(_pid: u32, _pid_path: &Path) -> Option<bool> {
    None
}

/// A new session rather than just a new process group: the watchdog must
/// lose its controlling terminal, or closing the terminal sends it SIGHUP.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and only affects the child.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(io::Error::from)
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if !is_signalable(pid) {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn terminate_process(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if !is_signalable(pid) {
        return Err(format!("refusing to signal pid {}", pid));
    }
    let raw = i32::try_from(pid).map_err(|e| e.to_string())?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!(pid, "Keepalive already exited");
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    if !is_signalable(pid) {
        return false;
    }
    let output = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .any(|field| field == pid.to_string()),
        Err(_) => false,
    }
}

#[cfg(windows)]
fn terminate_process(pid: u32) -> Result<(), String> {
    if !is_signalable(pid) {
        return Err(format!("refusing to signal pid {}", pid));
    }
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() || !process_alive(pid) {
        Ok(())
    } else {
        Err(format!("taskkill exited with {}", status))
    }
}

#[cfg(not(any(unix, windows)))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn terminate_process(pid: u32) -> Result<(), String> {
    Err(format!("cannot signal pid {} on this platform", pid))
}

/// Resolves when the watchdog is asked to stop: SIGTERM or Ctrl-C.
pub async fn stop_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_args(dir: &Path) -> WatchdogArgs {
        WatchdogArgs {
            endpoint: "cyberark".to_string(),
            deadline: Utc
                .with_ymd_and_hms(2026, 10, 16, 18, 0, 0)
                .single()
                .expect("valid time"),
            min_interval: 901,
            max_interval: 1139,
            token_path: dir.join("token"),
            log_path: dir.join("keepalive.log"),
            pid_path: dir.join("keepalive.pid"),
            verify_ssl: false,
        }
    }

    #[test]
    fn test_to_flags() {
        let dir = PathBuf::from("/opt/vaultkeep");
        let flags: Vec<String> = sample_args(&dir)
            .to_flags()
            .into_iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();

        let pos = |flag: &str| flags.iter().position(|f| f == flag).expect(flag);
        assert_eq!(flags[pos("--endpoint") + 1], "cyberark");
        assert_eq!(flags[pos("--deadline") + 1], "2026-10-16T18:00:00Z");
        assert_eq!(flags[pos("--min-interval") + 1], "901");
        assert_eq!(flags[pos("--max-interval") + 1], "1139");
        assert_eq!(flags[pos("--token-path") + 1], "/opt/vaultkeep/token");
        assert!(!flags.contains(&"--verify-ssl".to_string()));
    }

    #[test]
    fn test_to_flags_verify_ssl() {
        let mut args = sample_args(Path::new("/tmp"));
        args.verify_ssl = true;
        assert_eq!(
            args.to_flags().last().map(|f| f.to_string_lossy().into_owned()),
            Some("--verify-ssl".to_string())
        );
    }

    /// Shell loop that keeps our flags on its command line
    #[cfg(unix)]
    fn looping_launcher() -> ProcessLauncher {
        ProcessLauncher::new(
            PathBuf::from("/bin/sh"),
            vec![
                "-c".into(),
                "while :; do sleep 1; done".into(),
                "vaultkeep".into(),
            ],
        )
    }

    fn in_an_hour() -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp() + 3600, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn test_read_pid_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        assert_eq!(read_pid_record(&path), None);

        std::fs::write(&path, "4242\n").expect("write");
        assert_eq!(
            read_pid_record(&path),
            Some(PidRecord {
                pid: 4242,
                deadline: None
            })
        );

        std::fs::write(&path, "4242\n2026-10-16T18:00:00Z\n").expect("write");
        let record = read_pid_record(&path).expect("record");
        assert_eq!(
            record.deadline.map(|d| d.to_rfc3339()),
            Some("2026-10-16T18:00:00+00:00".to_string())
        );

        std::fs::write(&path, "garbage").expect("write");
        assert_eq!(read_pid_record(&path), None);

        // pid 0 would signal our whole process group
        std::fs::write(&path, "0").expect("write");
        assert_eq!(read_pid_record(&path), None);
    }

    #[test]
    fn test_pid_record_expiry() {
        let deadline = in_an_hour();
        let record = PidRecord {
            pid: 4242,
            deadline: Some(deadline),
        };
        assert_eq!(PidRecord::parse(&record.render()), Some(record));
        assert!(!record.is_expired(deadline));
        assert!(!record.is_expired(deadline + chrono::Duration::seconds(60)));
        assert!(record.is_expired(deadline + chrono::Duration::hours(1)));

        let bare = PidRecord {
            pid: 4242,
            deadline: None,
        };
        assert!(!bare.is_expired(deadline + chrono::Duration::days(30)));
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_writes_record_and_terminate_stops() {
        use nix::unistd::{getsid, Pid};

        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = sample_args(dir.path());
        args.deadline = in_an_hour();
        let launcher = looping_launcher();

        let handle = launcher.launch(&args).expect("launch");
        let pid = Pid::from_raw(i32::try_from(handle.pid).expect("pid"));

        let record = read_pid_record(&args.pid_path).expect("record");
        assert_eq!(record.pid, handle.pid);
        assert_eq!(record.deadline, Some(args.deadline));
        assert!(launcher.is_alive(&handle));
        // Session leader, so no controlling terminal is inherited
        assert_eq!(getsid(Some(pid)).ok(), Some(pid));
        assert_eq!(launcher.find_running(&args.pid_path), Some(handle.clone()));

        launcher.terminate(&handle).expect("terminate");
        assert!(!args.pid_path.exists());
        nix::sys::wait::waitpid(pid, None).expect("reap");
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_kills_child_when_pid_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").expect("write");

        let mut args = sample_args(dir.path());
        args.deadline = in_an_hour();
        args.pid_path = blocker.join("keepalive.pid");

        match looping_launcher().launch(&args) {
            Err(LaunchError::PidFile { pid, .. }) => {
                assert!(!process_alive(pid), "child {pid} left running without a PID file");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(handle) => panic!("launch succeeded with pid {}", handle.pid),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_find_running_ignores_expired_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        let mut sleeper = Command::new("sleep").arg("30").spawn().expect("spawn");

        let record = PidRecord {
            pid: sleeper.id(),
            deadline: Some(Utc::now() - chrono::Duration::hours(2)),
        };
        std::fs::write(&path, record.render()).expect("write");

        let launcher = looping_launcher();
        assert_eq!(launcher.find_running(&path), None);
        assert!(!path.exists());
        assert!(matches!(sleeper.try_wait(), Ok(None)));

        sleeper.kill().expect("kill");
        sleeper.wait().expect("wait");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_is_never_signalled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        let mut sleeper = Command::new("sleep").arg("30").spawn().expect("spawn");

        let record = PidRecord {
            pid: sleeper.id(),
            deadline: Some(in_an_hour()),
        };
        std::fs::write(&path, record.render()).expect("write");

        let launcher = looping_launcher();
        assert_eq!(launcher.find_running(&path), None);
        assert!(!path.exists());

        let handle = WatchdogHandle {
            pid: sleeper.id(),
            pid_path: path.clone(),
        };
        launcher.terminate(&handle).expect("terminate");
        assert!(matches!(sleeper.try_wait(), Ok(None)), "unrelated process was signalled");

        sleeper.kill().expect("kill");
        sleeper.wait().expect("wait");
    }

    #[test]
    fn test_remove_pid_file_only_if_owned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        std::fs::write(&path, "5000").expect("write");

        remove_pid_file_if_owned(&path, 4000);
        assert!(path.exists());

        remove_pid_file_if_owned(&path, 5000);
        assert!(!path.exists());

        // Missing file is fine
        remove_pid_file_if_owned(&path, 5000);
    }

    #[test]
    fn test_process_alive_rejects_self_and_init() {
        assert!(!process_alive(0));
        assert!(!process_alive(1));
        assert!(!process_alive(std::process::id()));
    }

    #[test]
    fn test_find_running_removes_stale_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        // Above the default pid_max on Linux, so never a live process
        std::fs::write(&path, "4194305").expect("write");

        let launcher = ProcessLauncher::new(PathBuf::from("/bin/true"), Vec::new());
        assert_eq!(launcher.find_running(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_terminate_missing_process_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keepalive.pid");
        std::fs::write(&path, "4194305").expect("write");

        let launcher = ProcessLauncher::new(PathBuf::from("/bin/true"), Vec::new());
        let handle = WatchdogHandle {
            pid: 4_194_305,
            pid_path: path.clone(),
        };
        #[cfg(unix)]
        assert!(launcher.terminate(&handle).is_ok());
        #[cfg(not(unix))]
        let _ = launcher.terminate(&handle);
        assert!(!path.exists());
    }

    #[test]
    fn test_command_includes_prefix_and_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let launcher = ProcessLauncher::new(
            PathBuf::from("/usr/local/bin/vaultkeep"),
            vec!["keepalive".into(), "run".into()],
        );
        let cmd = launcher.command(&sample_args(dir.path()));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..3], &["keepalive", "run", "--endpoint"]);
        assert_eq!(cmd.get_current_dir(), Some(dir.path()));
    }
}
