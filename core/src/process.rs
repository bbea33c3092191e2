use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const STDERR_EXCERPT: usize = 512;
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program}' exited with {status}{}", stderr_suffix(.stderr))]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("'{program}' was cancelled")]
    Cancelled { program: String },
    #[error("'{program}' timed out after {limit:?}")]
    TimedOut { program: String, limit: Duration },
    #[error("i/o error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program_name()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub program: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub termination: Termination,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited(status) if status.success())
    }

    pub fn check(&self) -> Result<(), ExecError> {
        let program = self.program.clone();
        match self.termination {
            Termination::Exited(status) if status.success() => Ok(()),
            Termination::Exited(status) => Err(ExecError::Exit {
                program,
                status,
                stderr: truncate_output(&self.stderr),
            }),
            Termination::Cancelled => Err(ExecError::Cancelled { program }),
            Termination::TimedOut(limit) => Err(ExecError::TimedOut { program, limit }),
        }
    }
}

/// Runs `invocation` to completion, cancellation, or `timeout`, whichever
/// comes first.
pub async fn run(
    invocation: &Invocation,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, ExecError> {
    let program = invocation.program_name();
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled { program });
    }
    let io_error = |source: io::Error| ExecError::Io {
        program: program.clone(),
        source,
    };

    debug!(command = %invocation.display(), "spawning scanner process");
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group, so helpers the tool forks die with it.
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(io::Error::other("stdout was not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_error(io::Error::other("stderr was not captured")))?;

    let mut drain = tokio::spawn(async move {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (out_read, err_read) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        out_read?;
        err_read?;
        Ok::<_, io::Error>((out, err))
    });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let termination = tokio::select! {
        status = child.wait() => Termination::Exited(status.map_err(&io_error)?),
        _ = cancel.cancelled() => Termination::Cancelled,
        _ = deadline => Termination::TimedOut(timeout.unwrap_or_default()),
    };

    if !matches!(termination, Termination::Exited(_)) {
        warn!(program = %program, ?termination, "terminating scanner process");
        kill_process_group(pid);
        child.kill().await.map_err(&io_error)?;
    }

    // Descendants outside our reach can keep the pipes open forever.
    let drained = match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            warn!(program = %program, "output pipes still open after exit, killing process group");
            kill_process_group(pid);
            tokio::time::timeout(DRAIN_GRACE, &mut drain).await.ok()
        }
    };
    let (stdout, stderr) = match drained {
        Some(joined) => joined
            .map_err(|err| io_error(io::Error::other(err)))?
            .map_err(&io_error)?,
        None => {
            warn!(program = %program, "abandoning output of scanner process");
            drain.abort();
            (Vec::new(), Vec::new())
        }
    };

    Ok(ProcessOutput {
        program,
        stdout,
        stderr,
        termination,
    })
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: killpg only sends a signal; the group id came from our own child.
    if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
        debug!(pid, "process group already gone: {}", io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

pub fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return is_executable(&candidate).then_some(candidate);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(STDERR_EXCERPT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
