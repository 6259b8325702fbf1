//! Running the `pede` executable.
//!
//! The solver is started in the directory of the steering file, with the
//! steering file name as its only argument. Its standard output and error go to
//! `pede.stdout` and `pede.stderr` next to the steering file.
//!
//! On unix the solver leads its own process group. The child is owned by a guard
//! that kills the whole group and reaps the solver on every exit path (normal
//! exit, timeout, I/O error, panic), so neither the solver nor anything it
//! started outlives the calibration.
//!
//! After a normal exit the solver's `millepede.end` summary is checked: its first
//! token is the solver's own exit code, values of 10 and above mean the fit
//! did not converge or was aborted.
use std::{
    fs::File,
    io,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::{
    align_errors::AlignError,
    constants::{PEDE_END_FILE, PEDE_EXECUTABLE, PEDE_RESULT_FILE},
};

use super::PedeSteering;

/// Solver exit codes from this value on are failures.
const END_CODE_FAILURE: i32 = 10;

/// Log of the solver's standard output, next to the steering file.
const PEDE_STDOUT_FILE: &str = "pede.stdout";

/// Log of the solver's standard error, next to the steering file.
const PEDE_STDERR_FILE: &str = "pede.stderr";

/// Kill-on-drop handle of the solver process and its process group.
struct ChildGuard {
    child: Child,
    exited: bool,
}

impl ChildGuard {
    fn spawn(command: &mut Command) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Ok(ChildGuard {
            child: command.spawn()?,
            exited: false,
        })
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.exited |= status.is_some();
        Ok(status)
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::{
            errno::Errno,
            sys::signal::{killpg, Signal},
            unistd::Pid,
        };

        match killpg(Pid::from_raw(self.id() as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pgid = self.id(), "pede process group killed"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = self.id(), %err, "cannot kill pede process group"),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.exited {
            warn!(pid = self.id(), "killing pede");
        }
        #[cfg(unix)]
        self.kill_group();
        if !self.exited {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Clone)]
pub struct PedeApplication {
    executable: Utf8PathBuf,
    timeout: Option<Duration>,
    poll_interval: Duration,
    exit_code: Option<i32>,
    exit_message: String,
    success: bool,
}

impl Default for PedeApplication {
    fn default() -> Self {
        PedeApplication::new(PEDE_EXECUTABLE)
    }
}

impl PedeApplication {
    pub fn new(executable: impl Into<Utf8PathBuf>) -> Self {
        PedeApplication {
            executable: executable.into(),
            timeout: None,
            poll_interval: Duration::from_millis(20),
            exit_code: None,
            exit_message: String::new(),
            success: false,
        }
    }

    /// Abort the solver if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn executable(&self) -> &Utf8Path {
        &self.executable
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `true` after a run that exited cleanly with an accepted end code.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Solver end code (from `millepede.end`), or the process exit code.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn exit_message(&self) -> &str {
        &self.exit_message
    }

    /// Write the steering file and run the solver on it, blocking until it exits.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` on success, the result file is then in the steering directory.
    /// * [`AlignError::SolverTimeout`] if the timeout expired (the solver is killed).
    /// * [`AlignError::SolverFailure`] on a non-zero exit status or a failing end code.
    /// * [`AlignError::IoError`] if the solver could not be started.
    pub fn execute(&mut self, steering: &mut PedeSteering) -> Result<(), AlignError> {
        self.success = false;
        self.exit_code = None;
        self.exit_message.clear();

        let steering_path = steering.make()?;
        let dir = steering_path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        let steering_name = steering_path.file_name().ok_or_else(|| {
            AlignError::SolverFailure(format!("invalid steering path {steering_path}"))
        })?;

        // stale outputs of a previous run must not be read back
        for stale in [PEDE_END_FILE, PEDE_RESULT_FILE] {
            let path = dir.join(stale);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        let stdout = File::create(dir.join(PEDE_STDOUT_FILE))?;
        let stderr = File::create(dir.join(PEDE_STDERR_FILE))?;
        let mut guard = ChildGuard::spawn(
            Command::new(self.executable.as_std_path())
                .arg(steering_name)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr),
        )?;
        info!(
            executable = %self.executable,
            pid = guard.id(),
            dir = %dir,
            "pede started"
        );

        let start = Instant::now();
        let status = loop {
            if let Some(status) = guard.try_wait()? {
                break status;
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    error!(?timeout, "pede timed out");
                    self.exit_message = format!("timed out after {timeout:?}");
                    return Err(AlignError::SolverTimeout(timeout));
                }
            }
            thread::sleep(self.poll_interval);
        };
        drop(guard);

        self.exit_code = status.code();
        if !status.success() {
            self.exit_message = format!(
                "pede exited with {status}, see {}",
                dir.join(PEDE_STDERR_FILE)
            );
            error!(status = %status, "pede failed");
            return Err(AlignError::SolverFailure(self.exit_message.clone()));
        }

        if let Some((code, message)) = read_end_file(&dir.join(PEDE_END_FILE))? {
            self.exit_code = Some(code);
            self.exit_message = message;
            if code >= END_CODE_FAILURE {
                error!(code, message = %self.exit_message, "pede reported a failure");
                return Err(AlignError::SolverFailure(format!(
                    "end code {code}: {}",
                    self.exit_message
                )));
            }
        }

        self.success = true;
        info!(
            elapsed = ?start.elapsed(),
            code = ?self.exit_code,
            "pede finished"
        );
        Ok(())
    }
}

/// First line of `millepede.end`: `<code> <message>`.
fn read_end_file(path: &Utf8Path) -> Result<Option<(i32, String)>, AlignError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    let line = text.lines().next().unwrap_or_default().trim();
    let (code, message) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let code = code
        .parse::<i32>()
        .map_err(|_| AlignError::ResultParsing(format!("{path}: invalid end code '{code}'")))?;
    Ok(Some((code, message.trim().to_string())))
}

#[cfg(test)]
mod test_application {
    use super::*;

    #[test]
    fn test_read_end_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join(PEDE_END_FILE)).unwrap();
        assert_eq!(read_end_file(&path).unwrap(), None);

        std::fs::write(&path, "  1   Ended normally\n").unwrap();
        assert_eq!(
            read_end_file(&path).unwrap(),
            Some((1, "Ended normally".to_string()))
        );

        std::fs::write(&path, "xx\n").unwrap();
        assert!(matches!(
            read_end_file(&path),
            Err(AlignError::ResultParsing(_))
        ));
    }

    #[cfg(unix)]
    fn script_pede(dir: &Utf8Path, text: &str) -> PedeApplication {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("pede.sh");
        std::fs::write(&path, text).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        PedeApplication::new(path)
    }

    #[cfg(unix)]
    fn is_running(pid: i32) -> bool {
        use nix::{sys::signal::kill, unistd::Pid};

        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        // a zombie waiting for its new parent is already dead
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| !stat.contains(") Z "))
            .unwrap_or(true)
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let mut steering = PedeSteering::new(dir.join("steer.txt"));
        let mut pede = script_pede(&dir, "#!/bin/sh\nsleep 30 &\necho $! > child.pid\nwait\n")
            .with_timeout(Some(Duration::from_millis(300)));

        assert!(matches!(
            pede.execute(&mut steering),
            Err(AlignError::SolverTimeout(_))
        ));

        let pid: i32 = std::fs::read_to_string(dir.join("child.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!is_running(pid), "background process {pid} survived the solver");
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let mut steering = PedeSteering::new(dir.join("steer.txt"));
        let mut pede = script_pede(&dir, "#!/bin/sh\necho 'matrix singular' >&2\nexit 3\n");

        let err = pede.execute(&mut steering).unwrap_err();
        assert!(matches!(err, AlignError::SolverFailure(_)));
        assert_eq!(pede.exit_code(), Some(3));
        assert!(pede.exit_message().contains(PEDE_STDERR_FILE));
        let stderr = std::fs::read_to_string(dir.join(PEDE_STDERR_FILE)).unwrap();
        assert_eq!(stderr.trim(), "matrix singular");
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("steer.txt")).unwrap();
        let mut steering = PedeSteering::new(path);
        let mut pede = PedeApplication::new("/nonexistent/pede");
        assert!(pede.execute(&mut steering).is_err());
        assert!(!pede.success());
    }
}
