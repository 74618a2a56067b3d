use crate::runner::UnitSpec;
use crate::signals;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Subcommand a runner process is started with.
pub const RUN_SERVICE_COMMAND: &str = "run-service";

struct SupervisedUnit {
    name: String,
    pid: Option<u32>,
    child: tokio::process::Child,
}

#[derive(Debug)]
pub struct UnitExit {
    pub name: String,
    pub status: Option<ExitStatus>,
}

/// Launches one runner process per service and waits for all of them.
///
/// Each runner is a separate OS process (this binary re-executed with
/// `run-service`), so a crash or hang in one service's restart loop cannot
/// reach the others. The supervisor itself holds no per-service state beyond
/// the process handles.
pub struct Supervisor {
    exe: PathBuf,
    units: Vec<UnitSpec>,
    running: Vec<SupervisedUnit>,
}

impl Supervisor {
    pub fn new(exe: PathBuf, units: Vec<UnitSpec>) -> Self {
        Self {
            exe,
            units,
            running: Vec::new(),
        }
    }

    /// Launch every runner and return without waiting for them.
    pub fn start(&mut self) -> Result<()> {
        for unit in &self.units {
            let name = unit.service.name.clone();
            let payload = serde_json::to_string(unit)
                .with_context(|| format!("Failed to encode unit for {}", name))?;

            let mut cmd = tokio::process::Command::new(&self.exe);
            cmd.arg(RUN_SERVICE_COMMAND).arg("--unit").arg(payload);
            cmd.stdin(Stdio::null());
            signals::die_with_parent(&mut cmd);

            let child = cmd
                .spawn()
                .with_context(|| format!("Failed to launch runner for {}", name))?;
            let pid = child.id();
            log::info!("Launched runner for {} (pid {})", name, pid.unwrap_or_default());

            self.running.push(SupervisedUnit { name, pid, child });
        }
        Ok(())
    }

    /// `(service, pid)` of every launched runner process.
    pub fn runner_pids(&self) -> Vec<(String, u32)> {
        self.running
            .iter()
            .filter_map(|unit| unit.pid.map(|pid| (unit.name.clone(), pid)))
            .collect()
    }

    /// Block until every runner has exited.
    ///
    /// Runners restart their own services, so under normal operation this
    /// never returns. On shutdown the request is forwarded to each runner as
    /// SIGTERM and this returns once they have all stopped.
    pub async fn wait(&mut self, mut shutdown: watch::Receiver<bool>) -> Vec<UnitExit> {
        let mut alive: HashMap<String, u32> = self.runner_pids().into_iter().collect();
        let mut pending = JoinSet::new();
        for mut unit in self.running.drain(..) {
            pending.spawn(async move {
                let status = unit.child.wait().await;
                (unit.name, status)
            });
        }

        let mut exits = Vec::new();
        let mut forwarded = false;
        loop {
            tokio::select! {
                joined = pending.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(status)))) => {
                        alive.remove(&name);
                        if forwarded || status.success() {
                            log::info!("Runner for {} exited ({})", name, status);
                        } else {
                            log::error!("Runner for {} exited ({}); it will not be relaunched", name, status);
                        }
                        exits.push(UnitExit { name, status: Some(status) });
                    }
                    Some(Ok((name, Err(e)))) => {
                        alive.remove(&name);
                        log::error!("Lost track of runner for {}: {}", name, e);
                        exits.push(UnitExit { name, status: None });
                    }
                    Some(Err(e)) => {
                        log::error!("Runner wait task failed: {}", e);
                    }
                },
                _ = signals::shutdown_requested(&mut shutdown), if !forwarded => {
                    forwarded = true;
                    for (name, pid) in &alive {
                        log::info!("Stopping runner for {} (pid {})", name, pid);
                        if let Err(e) = signals::terminate(*pid) {
                            log::warn!("Failed to signal runner for {}: {}", name, e);
                        }
                    }
                }
            }
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn sample_units() -> Vec<UnitSpec> {
        let config: Config = serde_yaml::from_str(
            "services:\n  web: {program: gunicorn}\n  search: {program: python}\n  download: {program: python}\n",
        )
        .unwrap();
        config.units()
    }

    fn sleeper(name: &str, secs: &str) -> SupervisedUnit {
        let child = tokio::process::Command::new("sleep").arg(secs).spawn().unwrap();
        SupervisedUnit {
            name: name.to_string(),
            pid: child.id(),
            child,
        }
    }

    #[tokio::test]
    async fn test_wait_collects_every_exit() {
        // `true run-service --unit ...` exits at once, standing in for runners.
        let mut supervisor = Supervisor::new(PathBuf::from("true"), sample_units());
        supervisor.start().unwrap();
        assert_eq!(supervisor.runner_pids().len(), 3);

        let (_tx, rx) = watch::channel(false);
        let exits = supervisor.wait(rx).await;
        let mut names: Vec<String> = exits.iter().map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["download", "search", "web"]);
        assert!(exits.iter().all(|e| e.status.map(|s| s.success()).unwrap_or(false)));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_start() {
        let mut supervisor = Supervisor::new(PathBuf::from("/nonexistent/portald"), sample_units());
        assert!(supervisor.start().is_err());
    }

    #[tokio::test]
    async fn test_one_runner_exiting_leaves_others_running() {
        let mut supervisor = Supervisor::new(PathBuf::from("unused"), Vec::new());
        supervisor.running = vec![
            sleeper("web", "0"),
            sleeper("search", "30"),
            sleeper("download", "30"),
        ];
        let pids = supervisor.runner_pids();

        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { supervisor.wait(rx).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        for (_, pid) in &pids[1..] {
            assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid as i32), None).is_ok());
        }
        assert!(!waiter.is_finished());

        // Shutdown is forwarded to the survivors.
        tx.send(true).unwrap();
        let exits = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exits.len(), 3);
        assert_eq!(exits[0].name, "web");
    }
}
