//! Graduated teardown of a session's process: interrupt, terminate, kill.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStage {
    Running,
    Interrupted,
    Terminated,
    Killed,
    Reaped,
}

/// How long to wait for the process after each gentle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub interrupt_wait: Duration,
    pub terminate_wait: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            interrupt_wait: Duration::from_millis(200),
            terminate_wait: Duration::from_millis(400),
        }
    }
}

/// Which processes a signal reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    /// Every process in the group led by this pid.
    Group(Pid),
    /// Only the process itself.
    Process(Pid),
}

impl SignalScope {
    /// Group-wide when `pid` leads its own process group, direct otherwise.
    ///
    /// A pid that shares its group with someone else (typically the agent)
    /// must never be signalled group-wide.
    pub fn for_pid(pid: u32) -> Self {
        let pid = Pid::from_raw(pid as i32);
        match getpgid(Some(pid)) {
            Ok(pgid) if pgid == pid => SignalScope::Group(pgid),
            Ok(_) => SignalScope::Process(pid),
            Err(err) => {
                debug!(pid = %pid, error = %err, "getpgid failed, using direct signals");
                SignalScope::Process(pid)
            }
        }
    }

    pub fn send(self, signal: Signal) -> Result<(), Errno> {
        match self {
            SignalScope::Group(pgid) => match killpg(pgid, signal) {
                Err(Errno::ESRCH) => Err(Errno::ESRCH),
                Err(err) => {
                    debug!(pgid = %pgid, error = %err, "killpg failed, signalling leader only");
                    kill(pgid, signal)
                }
                Ok(()) => Ok(()),
            },
            SignalScope::Process(pid) => kill(pid, signal),
        }
    }
}

/// Deliver a single interrupt, as a terminal would for Ctrl+C.
pub fn interrupt(scope: SignalScope) {
    if let Err(err) = scope.send(Signal::SIGINT)
        && err != Errno::ESRCH
    {
        warn!(?scope, error = %err, "failed to deliver interrupt");
    }
}

/// Run the escalation sequence against `scope`.
///
/// `exited` must be cancelled by whoever reaps the process. Returns
/// `Reaped` when the process went away during a wait, or `Killed` once
/// SIGKILL has been sent; the caller does not wait after the kill.
pub async fn escalate(
    scope: SignalScope,
    exited: &CancellationToken,
    policy: EscalationPolicy,
) -> EscalationStage {
    let mut stage = EscalationStage::Running;
    if exited.is_cancelled() {
        return EscalationStage::Reaped;
    }

    for (signal, next, wait) in [
        (
            Signal::SIGINT,
            EscalationStage::Interrupted,
            Some(policy.interrupt_wait),
        ),
        (
            Signal::SIGTERM,
            EscalationStage::Terminated,
            Some(policy.terminate_wait),
        ),
        (Signal::SIGKILL, EscalationStage::Killed, None),
    ] {
        match scope.send(signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return EscalationStage::Reaped,
            Err(err) => warn!(?scope, ?signal, error = %err, "signal delivery failed"),
        }
        debug!(?scope, from = ?stage, to = ?next, "escalation step");
        stage = next;

        let Some(wait) = wait else {
            break;
        };
        if tokio::time::timeout(wait, exited.cancelled()).await.is_ok() {
            return EscalationStage::Reaped;
        }
    }

    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};
    use std::time::Instant;

    fn spawn_group_leader(script: &str) -> (u32, CancellationToken) {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn");
        let pid = child.id();
        let exited = CancellationToken::new();
        let reaped = exited.clone();
        std::thread::spawn(move || {
            let _ = child.wait();
            reaped.cancel();
        });
        (pid, exited)
    }

    #[test]
    fn group_leader_gets_group_scope() {
        let (pid, exited) = spawn_group_leader("sleep 5");
        assert_eq!(
            SignalScope::for_pid(pid),
            SignalScope::Group(Pid::from_raw(pid as i32))
        );
        let _ = SignalScope::Group(Pid::from_raw(pid as i32)).send(Signal::SIGKILL);
        let start = Instant::now();
        while !exited.is_cancelled() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(exited.is_cancelled());
    }

    #[tokio::test]
    async fn cooperative_process_is_reaped_after_interrupt() {
        let (pid, exited) = spawn_group_leader("sleep 30");
        let stage = escalate(SignalScope::for_pid(pid), &exited, EscalationPolicy::default()).await;
        assert_eq!(stage, EscalationStage::Reaped);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_within_budget() {
        let (pid, exited) =
            spawn_group_leader("trap '' INT TERM; while true; do sleep 1; done");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        let stage = escalate(SignalScope::for_pid(pid), &exited, EscalationPolicy::default()).await;
        assert_eq!(stage, EscalationStage::Killed);

        tokio::time::timeout(Duration::from_secs(1), exited.cancelled())
            .await
            .expect("process should be reaped after SIGKILL");
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn already_exited_process_is_reaped_immediately() {
        let exited = CancellationToken::new();
        exited.cancel();
        let stage = escalate(
            SignalScope::Process(Pid::from_raw(i32::MAX)),
            &exited,
            EscalationPolicy::default(),
        )
        .await;
        assert_eq!(stage, EscalationStage::Reaped);
    }
}
