//! Cancellation plumbing shared by the process runners.

use tokio::process::Child;
use tokio::sync::watch;

/// Resolves once the cancel flag is raised. Pends forever if the sender
/// is gone, since cancellation can no longer arrive.
pub(crate) async fn cancel_requested(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

/// Ask a child process to stop. On unix this delivers SIGTERM so the
/// tool can exit on its own during the grace window; elsewhere there is
/// nothing gentler than the hard kill the callers escalate to.
pub(crate) fn request_stop(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// A receiver that never signals cancellation. For callers that do not
/// participate in cancellation.
pub fn never_cancelled() -> watch::Receiver<bool> {
    // Dropping the sender closes the channel; the flag stays false and
    // the waiter pends forever.
    let (_tx, rx) = watch::channel(false);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_when_flag_is_raised() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            cancel_requested(&mut rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_stop_terminates_a_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        request_stop(&child);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child should exit after the stop request")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn pends_when_sender_dropped_without_cancel() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_millis(50), cancel_requested(&mut rx)).await;
        assert!(result.is_err(), "must not resolve as a spurious cancel");
    }
}
