//! Blocking child processes with a deadline and bounded output capture.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long the pipes may stay open after a timed-out child was killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

type Captured = Result<(Vec<u8>, usize)>;

/// What a finished (or killed) child left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal, including on timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped across both streams once the limit was hit.
    pub truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn `cmd`, feed it `stdin`, and wait at most `timeout`.
///
/// Stdin is written and both pipes are drained on their own threads so a
/// chatty child cannot deadlock against a large script. On Unix the child
/// leads its own process group, and a child that outlives the deadline is
/// killed together with everything it started. Output still arriving
/// [`KILL_GRACE`] after the kill is abandoned. Spawn failures are errors;
/// everything after spawn is reported in [`ProcessOutput`].
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let input = stdin.to_vec();
    let writer = thread::spawn(move || match child_stdin.write_all(&input) {
        // The child may legitimately exit without reading everything.
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        other => other,
    });
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!("command timed out, killing its process group");
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // A killed child's stdin writer may be stuck on a pipe nobody reads.
    if !timed_out {
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(err = %err, "failed to write command stdin"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let grace = timed_out.then_some(KILL_GRACE);
    let (stdout, stdout_dropped) = collect(&stdout_rx, grace).context("collect stdout")?;
    let (stderr, stderr_dropped) = collect(&stderr_rx, grace).context("collect stderr")?;
    let truncated = stdout_dropped + stderr_dropped;
    if truncated > 0 {
        warn!(truncated, "command output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated,
        timed_out,
    })
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_tree(child: &mut Child) -> Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return child.kill().context("kill child");
    };
    // SAFETY: killpg takes plain integers and touches no memory. The group id
    // is the child's pid because the child was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        warn!(err = %err, "killpg failed, killing the child only");
        child.kill().context("kill child")
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the caller stopped waiting.
        let _ = tx.send(read_limited(reader, limit));
    });
    rx
}

/// Wait for a reader's result; with `grace`, give up on it after that long.
fn collect(rx: &Receiver<Captured>, grace: Option<Duration>) -> Captured {
    let Some(grace) = grace else {
        return rx
            .recv()
            .unwrap_or_else(|_| Err(anyhow!("output reader thread panicked")));
    };
    match rx.recv_timeout(grace) {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still open after kill, dropping it");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Keep at most `limit` bytes, counting (and discarding) the rest.
fn read_limited<R: Read>(mut reader: R, limit: usize) -> Captured {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let keep = n.min(room);
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn stdin_reaches_the_child() {
        let out = run_with_timeout(Command::new("cat"), b"hello", Duration::from_secs(5), 1024)
            .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[test]
    fn nonzero_exit_and_stderr_are_captured() {
        let out = run_with_timeout(
            sh("echo oops >&2; exit 3"),
            b"",
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn slow_child_is_killed_at_deadline() {
        let out = run_with_timeout(sh("sleep 5"), b"", Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn timeout_kills_the_script_and_what_it_started() {
        let started = Instant::now();
        let out = run_with_timeout(
            sh("sh"),
            b"sleep 6\necho done\n",
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "returned after {:?}",
            started.elapsed()
        );
        assert!(!out.stdout.contains("done"));
    }

    #[test]
    fn output_beyond_limit_is_dropped() {
        let out = run_with_timeout(sh("printf 0123456789"), b"", Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(out.stdout, "0123");
        assert_eq!(out.truncated, 6);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let result = run_with_timeout(
            Command::new("/definitely/not/here"),
            b"",
            Duration::from_secs(1),
            16,
        );
        assert!(result.is_err());
    }
}
