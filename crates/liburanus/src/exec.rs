use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::escalation::SignalScope;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_OUTPUT_BYTES: usize = 4096;
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)";
/// Grace for pipes inherited by background children after the shell exits.
pub const PIPE_DRAIN: Duration = Duration::from_millis(250);
const PIPE_QUEUE: usize = 32;

const DENYLIST: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    ":(){ :|:& };:",
    "dd if=/dev/zero of=/dev/sda",
    "mkfs",
    "> /dev/sda",
    "mv /* /dev/null",
];

/// Reject commands on the destructive denylist.
pub fn check_command(command: &str) -> Result<(), AgentError> {
    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    match DENYLIST.iter().find(|bad| normalized.contains(*bad)) {
        Some(bad) => Err(AgentError::CommandRejected(format!(
            "contains forbidden pattern `{bad}`"
        ))),
        None => Ok(()),
    }
}

/// Run `command` through `sh -c` with a wall-clock limit.
///
/// Returns stdout followed by stderr, truncated to [`MAX_OUTPUT_BYTES`].
/// On timeout the whole process group is killed and reaped. Once the shell
/// exits, background children still holding its pipes get [`PIPE_DRAIN`]
/// to finish writing; whatever arrived by then is returned.
pub async fn run_command(command: &str, limit: Duration) -> Result<String, AgentError> {
    check_command(command)?;

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::ProcessSpawn(format!("sh -c: {e}")))?;

    let pid = child.id();
    let (tx, mut rx) = mpsc::channel(PIPE_QUEUE);
    let mut pumps = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        pumps.push(pump(out, Pipe::Stdout, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(pump(err, Pipe::Stderr, tx.clone()));
    }
    drop(tx);

    let deadline = Instant::now() + limit;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    let mut pipes_open = true;
    let mut cutoff = deadline;

    while status.is_none() || pipes_open {
        tokio::select! {
            chunk = rx.recv(), if pipes_open => match chunk {
                Some((Pipe::Stdout, bytes)) => append_capped(&mut stdout, &bytes),
                Some((Pipe::Stderr, bytes)) => append_capped(&mut stderr, &bytes),
                None => pipes_open = false,
            },
            exit = child.wait(), if status.is_none() => {
                status = Some(exit?);
                cutoff = deadline.min(Instant::now() + PIPE_DRAIN);
            }
            _ = tokio::time::sleep_until(cutoff) => {
                if status.is_some() {
                    debug!(command, "output pipes still held by a background process");
                    break;
                }
                warn!(command, timeout_secs = limit.as_secs_f64(), "command timed out, killing");
                if let Some(pid) = pid
                    && let Err(err) = SignalScope::for_pid(pid).send(Signal::SIGKILL)
                {
                    debug!(pid, error = %err, "kill after timeout failed");
                }
                let _ = child.kill().await;
                for task in &pumps {
                    task.abort();
                }
                return Err(AgentError::ExecutionTimeout(limit));
            }
        }
    }
    for task in &pumps {
        task.abort();
    }

    stdout.extend_from_slice(&stderr);
    debug!(command, ?status, bytes = stdout.len(), "command finished");
    Ok(truncate_output(&String::from_utf8_lossy(&stdout)))
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

fn pump<R>(mut reader: R, pipe: Pipe, tx: mpsc::Sender<(Pipe, Vec<u8>)>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((pipe, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Keep one byte past the output limit so truncation still shows.
fn append_capped(buf: &mut Vec<u8>, bytes: &[u8]) {
    let room = (MAX_OUTPUT_BYTES + 1).saturating_sub(buf.len());
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

/// Cut `output` to [`MAX_OUTPUT_BYTES`] on a char boundary and mark it.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &output[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    #[tokio::test]
    async fn combines_stdout_and_stderr() {
        let out = run_command("echo out; echo err 1>&2", DEFAULT_EXEC_TIMEOUT)
            .await
            .expect("run");
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn non_zero_exit_still_returns_output() {
        let out = run_command("echo partial; exit 4", DEFAULT_EXEC_TIMEOUT)
            .await
            .expect("run");
        assert_eq!(out.trim(), "partial");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 60", pid_file.display());

        let err = run_command(&script, Duration::from_secs(1))
            .await
            .expect_err("should time out");
        assert!(matches!(err, AgentError::ExecutionTimeout(_)));
        assert!(err.to_string().contains("timeout"));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn background_child_holding_pipes_does_not_block() {
        let start = std::time::Instant::now();
        let out = run_command("sleep 5 & echo hi", Duration::from_secs(1))
            .await
            .expect("run");
        assert_eq!(out, "hi\n");
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let out = run_command("head -c 10000 /dev/zero | tr '\\0' 'x'", DEFAULT_EXEC_TIMEOUT)
            .await
            .expect("run");
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.len(), MAX_OUTPUT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(3000);
        let cut = truncate_output(&text);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(cut.len() <= MAX_OUTPUT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn denylist_catches_spacing_variants() {
        assert!(check_command("rm  -rf   /").is_err());
        assert!(check_command("sudo mkfs.ext4 /dev/sdb1").is_err());
        assert!(check_command("ls -la /tmp").is_ok());
    }
}
