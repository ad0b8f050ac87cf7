//! Child process session for the supervised server
//!
//! Owns the spawned server process, its stdin, and the stdout/stderr
//! [`LineBuffer`]s. A single reader task multiplexes both output pipes and
//! polls for process exit; everything else observes the process through the
//! buffers and a couple of atomics.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::buffer::LineBuffer;
use super::error::ProcessError;

/// Exit code reported while the process is still running or never started.
pub const EXIT_CODE_PENDING: i32 = -1;

const READ_CHUNK: usize = 4096;
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(50);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which output stream to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A supervised child process launched through the shell.
///
/// The session is created once and re-armed by [`run`](Self::run); it is
/// shared behind an `Arc` between the supervisor, the moderation store, and
/// the shutdown path. The child's stdin is the only write channel into the
/// server and is serialized by its own lock.
pub struct ServerProcess {
    command: String,
    poll_interval: Duration,
    stdout_buf: Arc<LineBuffer>,
    stderr_buf: Arc<LineBuffer>,
    running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    pid: Mutex<Option<i32>>,
    stdin: Mutex<Option<std::fs::File>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerProcess {
    /// Create a session for `command`, executed via `sh -c`.
    pub fn new(command: impl Into<String>, poll_interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            command: command.into(),
            poll_interval,
            stdout_buf: Arc::new(LineBuffer::default()),
            stderr_buf: Arc::new(LineBuffer::default()),
            running: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(AtomicI32::new(EXIT_CODE_PENDING)),
            pid: Mutex::new(None),
            stdin: Mutex::new(None),
            reader: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Spawn the child and start the reader task.
    ///
    /// Fails with [`ProcessError::AlreadyRunning`] when a child is live, and
    /// leaves no partial state behind when the spawn or pipe setup fails.
    pub fn run(&self) -> Result<(), ProcessError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ProcessError::AlreadyRunning);
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => return Err(ProcessError::StreamCapture("stdout")),
        };
        let stderr = match child.stderr.take() {
            Some(s) => s,
            None => return Err(ProcessError::StreamCapture("stderr")),
        };
        let stdin = match child.stdin.take() {
            Some(s) => s,
            None => return Err(ProcessError::StreamCapture("stdin")),
        };
        // Stdin becomes a plain nonblocking fd so writers stay synchronous
        // but cannot wedge indefinitely on a server that stopped reading.
        let stdin_fd: OwnedFd = stdin.into_owned_fd().map_err(ProcessError::Io)?;
        let flags = fcntl(&stdin_fd, FcntlArg::F_GETFL)
            .map_err(|e| ProcessError::Io(std::io::Error::from(e)))?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(&stdin_fd, FcntlArg::F_SETFL(flags))
            .map_err(|e| ProcessError::Io(std::io::Error::from(e)))?;
        let pid = child.id().map(|id| id as i32);

        self.stdout_buf.clear();
        self.stderr_buf.clear();
        self.exit_code.store(EXIT_CODE_PENDING, Ordering::SeqCst);
        *self.pid.lock().unwrap() = pid;
        *self.stdin.lock().unwrap() = Some(std::fs::File::from(stdin_fd));
        self.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(reader_loop(
            child,
            stdout,
            stderr,
            Arc::clone(&self.stdout_buf),
            Arc::clone(&self.stderr_buf),
            Arc::clone(&self.running),
            Arc::clone(&self.exit_code),
            self.poll_interval,
            self.shutdown_tx.subscribe(),
        ));
        *self.reader.lock().unwrap() = Some(handle);

        tracing::info!(pid = ?pid, command = %self.command, "server process started");
        Ok(())
    }

    /// Write a string to the child's stdin.
    ///
    /// Interrupted writes are retried. Backpressure from a server that
    /// stopped reading is tolerated up to a deadline, then surfaces as
    /// [`ProcessError::StdinStalled`], possibly mid-line.
    pub fn send_line(&self, data: &str) -> Result<(), ProcessError> {
        use std::io::Write;

        if !self.running.load(Ordering::SeqCst) {
            return Err(ProcessError::NotRunning);
        }
        let mut guard = self.stdin.lock().unwrap();
        let stdin = guard.as_mut().ok_or(ProcessError::NotRunning)?;

        let deadline = Instant::now() + STDIN_WRITE_TIMEOUT;
        let mut rest = data.as_bytes();
        while !rest.is_empty() {
            match stdin.write(rest) {
                Ok(0) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ProcessError::StdinStalled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read buffered output from the chosen stream.
    ///
    /// With `by_line` set, returns the next complete line or an empty string;
    /// otherwise drains everything buffered so far.
    pub fn read_output(&self, by_line: bool, stream: OutputStream) -> String {
        let buf = match stream {
            OutputStream::Stdout => &self.stdout_buf,
            OutputStream::Stderr => &self.stderr_buf,
        };
        if by_line {
            buf.read_line()
        } else {
            buf.read_all()
        }
    }

    /// Shared handle to the stdout buffer.
    pub fn stdout_buffer(&self) -> Arc<LineBuffer> {
        Arc::clone(&self.stdout_buf)
    }

    /// Shared handle to the stderr buffer.
    pub fn stderr_buffer(&self) -> Arc<LineBuffer> {
        Arc::clone(&self.stderr_buf)
    }

    /// Ask the child to terminate (SIGTERM). Does not wait for it to die;
    /// the reader task observes the exit asynchronously.
    pub fn stop(&self) -> Result<(), ProcessError> {
        self.signal(Signal::SIGTERM)
    }

    /// Forcefully kill the child (SIGKILL).
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> Result<(), ProcessError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ProcessError::NotRunning);
        }
        let pid = self.pid.lock().unwrap().ok_or(ProcessError::NotRunning)?;
        signal::kill(Pid::from_raw(pid), sig)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Exit status of the last run: the process's own code, a negated signal
    /// number if it was killed, or [`EXIT_CODE_PENDING`] while alive.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Stop the reader task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.stdin.lock().unwrap().take();
    }
}

#[allow(clippy::too_many_arguments)]
async fn reader_loop(
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    stdout_buf: Arc<LineBuffer>,
    stderr_buf: Arc<LineBuffer>,
    running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            read = stdout.read(&mut out_chunk), if stdout_open => match read {
                Ok(0) | Err(_) => stdout_open = false,
                Ok(n) => stdout_buf.append(&out_chunk[..n]),
            },
            read = stderr.read(&mut err_chunk), if stderr_open => match read {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => stderr_buf.append(&err_chunk[..n]),
            },
            _ = tick.tick() => {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        if stdout_open {
                            drain_stream(&mut stdout, &stdout_buf).await;
                        }
                        if stderr_open {
                            drain_stream(&mut stderr, &stderr_buf).await;
                        }
                        let code = convert_exit_status(status);
                        exit_code.store(code, Ordering::SeqCst);
                        running.store(false, Ordering::SeqCst);
                        tracing::info!(exit_code = code, "server process exited");
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to poll child status");
                    }
                }
            },
            _ = shutdown_rx.changed() => {
                running.store(false, Ordering::SeqCst);
                tracing::debug!("reader task stopped by shutdown signal");
                return;
            }
        }
    }
}

/// Pull any bytes still sitting in the pipe after the child exited.
async fn drain_stream<R>(stream: &mut R, buf: &Arc<LineBuffer>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match tokio::time::timeout(DRAIN_READ_TIMEOUT, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => buf.append(&chunk[..n]),
            _ => break,
        }
    }
}

fn convert_exit_status(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    EXIT_CODE_PENDING
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(command: &str) -> ServerProcess {
        ServerProcess::new(command, Duration::from_millis(10))
    }

    async fn wait_until_exited(proc: &ServerProcess) {
        for _ in 0..300 {
            if !proc.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit in time");
    }

    async fn read_line_eventually(proc: &ServerProcess, stream: OutputStream) -> String {
        for _ in 0..300 {
            let line = proc.read_output(true, stream);
            if !line.is_empty() {
                return line;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no line arrived in time");
    }

    #[tokio::test]
    async fn captures_stdout_lines() {
        let proc = session("echo hello");
        proc.run().unwrap();
        let line = read_line_eventually(&proc, OutputStream::Stdout).await;
        assert_eq!(line, "hello\n");
        wait_until_exited(&proc).await;
        assert_eq!(proc.exit_code(), 0);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let proc = session("echo oops >&2");
        proc.run().unwrap();
        let line = read_line_eventually(&proc, OutputStream::Stderr).await;
        assert_eq!(line, "oops\n");
        wait_until_exited(&proc).await;
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn stdin_round_trips_through_cat() {
        let proc = session("cat");
        proc.run().unwrap();
        proc.send_line("ping\n").unwrap();
        let line = read_line_eventually(&proc, OutputStream::Stdout).await;
        assert_eq!(line, "ping\n");
        proc.kill().unwrap();
        wait_until_exited(&proc).await;
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let proc = session("sleep 5");
        proc.run().unwrap();
        assert!(matches!(proc.run(), Err(ProcessError::AlreadyRunning)));
        proc.kill().unwrap();
        wait_until_exited(&proc).await;
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let proc = session("exit 3");
        proc.run().unwrap();
        wait_until_exited(&proc).await;
        assert_eq!(proc.exit_code(), 3);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn killed_process_reports_negated_signal() {
        let proc = session("sleep 30");
        proc.run().unwrap();
        proc.kill().unwrap();
        wait_until_exited(&proc).await;
        assert_eq!(proc.exit_code(), -(libc_sigkill()));
        proc.shutdown().await;
    }

    fn libc_sigkill() -> i32 {
        Signal::SIGKILL as i32
    }

    #[tokio::test]
    async fn backpressured_stdin_write_errors_instead_of_wedging() {
        let proc = session("sleep 30");
        proc.run().unwrap();
        // Far beyond the pipe capacity, and the child never reads.
        let payload = "x".repeat(4 * 1024 * 1024);
        let started = Instant::now();
        assert!(matches!(
            proc.send_line(&payload),
            Err(ProcessError::StdinStalled)
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
        proc.kill().unwrap();
        wait_until_exited(&proc).await;
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn operations_fail_when_not_running() {
        let proc = session("true");
        assert!(matches!(
            proc.send_line("x\n"),
            Err(ProcessError::NotRunning)
        ));
        assert!(matches!(proc.stop(), Err(ProcessError::NotRunning)));
        assert!(matches!(proc.kill(), Err(ProcessError::NotRunning)));
        assert_eq!(proc.exit_code(), EXIT_CODE_PENDING);
    }

    #[tokio::test]
    async fn drains_output_produced_right_before_exit() {
        let proc = session("printf 'a\\nb\\nc\\n'");
        proc.run().unwrap();
        wait_until_exited(&proc).await;
        let mut lines = Vec::new();
        loop {
            let line = proc.read_output(true, OutputStream::Stdout);
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        assert_eq!(lines, vec!["a\n", "b\n", "c\n"]);
        proc.shutdown().await;
    }
}
