//! Child process plumbing for the sandbox: kernel resource limits, process
//! groups, bounded capture, and the per-run [`ExecutionContext`].
//!
//! Every interpreter is started with a per-run marker in its environment.
//! Killing a context signals the process group first, then (on Linux) sweeps
//! `/proc` for anything still carrying the marker, which catches children
//! that called `setsid` or `setpgid` to leave the group.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::harness::{HARNESS_FILE, new_nonce};

/// Environment variable holding the per-run marker.
pub(crate) const RUN_MARKER_VAR: &str = "QUIZCHECK_RUN";

/// Upper bound on `/proc` passes per kill; each pass catches processes
/// forked while the previous one ran.
#[cfg(target_os = "linux")]
const SWEEP_PASSES: usize = 8;

/// Kernel limits applied to the interpreter before it starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessLimits {
    /// Soft CPU limit in seconds. The hard limit is one second above it.
    pub cpu_seconds: u64,
    /// Address-space limit.
    pub memory_bytes: Option<u64>,
    /// Largest file the child may write.
    pub file_bytes: u64,
    /// Open descriptor limit.
    pub open_files: u64,
    /// Process limit. The kernel counts this per user, and ignores it for
    /// privileged users.
    pub processes: Option<u64>,
}

impl ProcessLimits {
    /// Limits for a run bounded by `time_limit`. The CPU limit sits above the
    /// wall-clock bound so the external kill normally fires first.
    pub(crate) fn for_run(
        time_limit: Duration,
        memory_bytes: Option<u64>,
        file_bytes: u64,
        open_files: u64,
        processes: Option<u64>,
    ) -> Self {
        let whole = time_limit.as_secs() + u64::from(time_limit.subsec_nanos() > 0);
        Self {
            cpu_seconds: whole.max(1) + 1,
            memory_bytes,
            file_bytes,
            open_files,
            processes,
        }
    }

    /// Apply the limits to the calling process. Runs between fork and exec,
    /// so it must not allocate.
    #[allow(unsafe_code)]
    fn apply(&self) -> io::Result<()> {
        let set = |resource, soft: u64, hard: u64| -> io::Result<()> {
            let limit = libc::rlimit {
                rlim_cur: soft as libc::rlim_t,
                rlim_max: hard as libc::rlim_t,
            };
            // SAFETY: setrlimit only reads the struct passed by reference.
            if unsafe { libc::setrlimit(resource, &limit) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        };

        set(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        set(libc::RLIMIT_CORE, 0, 0)?;
        set(libc::RLIMIT_FSIZE, self.file_bytes, self.file_bytes)?;
        set(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        if let Some(bytes) = self.memory_bytes {
            set(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(count) = self.processes {
            set(libc::RLIMIT_NPROC, count, count)?;
        }
        Ok(())
    }
}

/// SIGKILL every process in the group led by `pid`.
#[allow(unsafe_code)]
pub(crate) fn kill_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill takes plain integers and has no memory-safety preconditions.
    unsafe {
        let _ = libc::kill(-pid, libc::SIGKILL);
    }
}

/// SIGKILL a single process.
#[allow(unsafe_code)]
fn kill_pid(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill takes plain integers and has no memory-safety preconditions.
    unsafe {
        let _ = libc::kill(pid, libc::SIGKILL);
    }
}

/// SIGKILL every process whose environment carries `marker`, repeating until
/// a pass finds nothing new. Returns how many processes were signalled.
#[cfg(target_os = "linux")]
pub(crate) fn kill_marked(marker: &str) -> usize {
    let needle = format!("{RUN_MARKER_VAR}={marker}");
    let own = std::process::id();
    let mut killed = std::collections::HashSet::new();

    for _ in 0..SWEEP_PASSES {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            break;
        };
        let mut found = false;
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own || killed.contains(&pid) {
                continue;
            }
            // Unreadable entries belong to other users or have already exited.
            let Ok(environ) = std::fs::read(entry.path().join("environ")) else {
                continue;
            };
            if environ
                .split(|byte| *byte == 0)
                .any(|var| var == needle.as_bytes())
            {
                kill_pid(pid);
                killed.insert(pid);
                found = true;
            }
        }
        if !found {
            break;
        }
    }
    killed.len()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn kill_marked(_marker: &str) -> usize {
    0
}

/// Bytes read from a pipe so far.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn take(&mut self) -> (Vec<u8>, bool) {
        (std::mem::take(&mut self.bytes), self.truncated)
    }
}

/// Read `reader` to the end into `sink`, keeping at most `cap` bytes.
///
/// Bytes past the cap are drained and dropped so the writer never blocks on
/// a full pipe. The sink is updated after every read, so its contents stay
/// usable if the reader is abandoned midway.
async fn read_into<R>(mut reader: R, cap: usize, sink: &Mutex<Captured>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if captured.truncated {
            continue;
        }
        let remaining = cap.saturating_sub(captured.bytes.len());
        if n <= remaining {
            captured.bytes.extend_from_slice(&chunk[..n]);
        } else {
            captured.bytes.extend_from_slice(&chunk[..remaining]);
            captured.truncated = true;
        }
    }
}

/// Read `reader` to the end, keeping at most `cap` bytes. The flag reports
/// whether anything was dropped.
pub(crate) async fn read_capped<R>(reader: R, cap: usize) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let sink = Mutex::new(Captured::default());
    read_into(reader, cap, &sink).await?;
    Ok(sink.into_inner().unwrap_or_else(PoisonError::into_inner).take())
}

/// A background capture of one child pipe. Dropping it aborts the reader.
#[derive(Debug)]
pub(crate) struct Capture {
    sink: Arc<Mutex<Captured>>,
    handle: JoinHandle<io::Result<()>>,
}

impl Capture {
    pub(crate) fn spawn<R>(reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::new(Mutex::new(Captured::default()));
        let handle = tokio::spawn({
            let sink = Arc::clone(&sink);
            async move { read_into(reader, cap, &sink).await }
        });
        Self { sink, handle }
    }

    /// Wait up to `grace` for the pipe to close.
    ///
    /// A reader still blocked after the grace period means something outside
    /// the process group holds the pipe. The reader is aborted and the bytes
    /// read so far are returned, flagged as truncated.
    pub(crate) async fn finish(mut self, grace: Duration) -> (Vec<u8>, bool) {
        let complete = match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Failed to read child output");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Capture task failed");
                false
            }
            Err(_) => {
                tracing::warn!(?grace, "Child pipe still open after grace period, aborting reader");
                self.handle.abort();
                false
            }
        };
        let (bytes, truncated) = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        (bytes, truncated || !complete)
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A single-use sandbox instance: a private working directory and at most one
/// interpreter process group.
///
/// Dropping the context kills the group (if still tracked) and removes the
/// directory, so teardown also happens when the owning task is cancelled.
#[derive(Debug)]
pub(crate) struct ExecutionContext {
    workdir: TempDir,
    group: Option<u32>,
    marker: String,
}

impl ExecutionContext {
    pub(crate) fn create() -> io::Result<Self> {
        let workdir = tempfile::Builder::new().prefix("quizcheck-").tempdir()?;
        Ok(Self {
            workdir,
            group: None,
            marker: new_nonce(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.workdir.path()
    }

    pub(crate) fn write(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        std::fs::write(self.workdir.path().join(name), contents)
    }

    /// Start the harness under `python` in a new process group.
    pub(crate) fn spawn(&mut self, python: &Path, limits: ProcessLimits) -> io::Result<Child> {
        let mut cmd = Command::new(python);
        cmd.args(["-I", "-B", "-u", HARNESS_FILE])
            .current_dir(self.workdir.path())
            .env_clear()
            .env("HOME", self.workdir.path())
            .env("TMPDIR", self.workdir.path())
            .env("PYTHONIOENCODING", "utf-8")
            .env("LANG", "C.UTF-8")
            .env(RUN_MARKER_VAR, &self.marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        #[allow(unsafe_code)]
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || limits.apply());
        }

        let child = cmd.spawn()?;
        self.group = child.id();
        Ok(child)
    }

    /// Kill the process group, then anything else still carrying this
    /// run's marker. Only the first call after a spawn does any work.
    pub(crate) fn kill(&mut self) {
        if let Some(pid) = self.group.take() {
            kill_group(pid);
            let swept = kill_marked(&self.marker);
            if swept > 0 {
                tracing::debug!(swept, "Killed marked processes");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.kill();
    }
}
