use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The returned receiver flips to `true` once either signal arrives.
pub fn install_shutdown_handler() -> std::io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down");
            }
        }
        let _ = tx.send(true);
        // Keep the sender alive so receivers never observe a closed channel.
        std::future::pending::<()>().await;
    });

    Ok(rx)
}

/// Resolves once shutdown has been requested; never resolves otherwise.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Ask the kernel to SIGTERM the spawned process when its parent dies, so a
/// dead supervisor never leaves orphaned services behind.
pub fn die_with_parent(cmd: &mut tokio::process::Command) {
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        });
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cmd;
}

pub fn terminate(pid: u32) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
}

/// SIGTERM the child, give it `grace` to exit, then SIGKILL.
pub async fn stop_child(
    child: &mut tokio::process::Child,
    grace: Duration,
    name: &str,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = terminate(pid) {
            log::warn!("Failed to send SIGTERM to {} (pid {}): {}", name, pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!("{} did not exit within {:?} of SIGTERM, killing", name, grace);
            child.kill().await?;
            child.wait().await
        }
    }
}
