//! Spawning the engine executable.
//!
//! The supervisor only talks to an engine through [`EngineLauncher`] and
//! [`EngineProcess`], so the real subprocess can be swapped for another
//! implementation without touching the lifecycle code.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info};

use vibrio_common::protocol::error::{Result, VibrioError};

/// Tracing target for forwarded engine output.
pub const ENGINE_LOG_TARGET: &str = "vibrio::engine";

/// A running engine owned by the supervisor's reaper task.
pub trait EngineProcess: Send + 'static {
    /// OS process id, `None` once the process has been reaped.
    fn id(&self) -> Option<u32>;

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    fn wait(&mut self) -> impl Future<Output = io::Result<ExitStatus>> + Send;

    /// Asks the engine to shut down. Does not wait.
    fn terminate(&mut self) -> io::Result<()>;

    /// Kills the engine and reaps it.
    fn kill(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Starts engines listening on a given loopback port.
pub trait EngineLauncher: Send + Sync + 'static {
    type Process: EngineProcess;

    fn launch(&self, port: u16) -> Result<Self::Process>;
}

/// Launches the engine executable as `<exe> --urls http://127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    log_output: bool,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: Vec::new(),
            log_output: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_output_logged(mut self, enabled: bool) -> Self {
        self.log_output = enabled;
        self
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }
}

impl EngineLauncher for ProcessLauncher {
    type Process = ChildProcess;

    fn launch(&self, port: u16) -> Result<ChildProcess> {
        let mut command = Command::new(&self.executable);
        command
            .arg("--urls")
            .arg(format!("http://127.0.0.1:{}", port))
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.log_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // Own process group so shutdown signals reach anything the engine spawns.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            VibrioError::EngineStartup(format!(
                "failed to spawn {}: {}",
                self.executable.display(),
                e
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, true);
        }

        let pid = child.id();
        Ok(ChildProcess { child, pid })
    }
}

fn forward_output<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                error!(target: ENGINE_LOG_TARGET, "{}", line);
            } else {
                info!(target: ENGINE_LOG_TARGET, "{}", line);
            }
        }
    });
}

/// Engine subprocess spawned by [`ProcessLauncher`].
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    /// Also the process group id; `Child::id` forgets it once the child is reaped
    pid: Option<u32>,
}

impl ChildProcess {
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

impl EngineProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            match self.child.try_wait()? {
                Some(_) => Ok(()),
                None => self.child.start_kill(),
            }
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL)?;

        match self.child.try_wait()? {
            Some(_) => Ok(()),
            None => self.child.kill().await,
        }
    }
}

/// `true` when `status` is a clean exit or the result of our own SIGTERM.
pub(crate) fn is_clean_exit(status: &ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(nix::sys::signal::Signal::SIGTERM as i32) {
            return true;
        }
    }
    false
}
