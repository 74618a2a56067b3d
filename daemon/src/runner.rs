//! Per-service restart loop.
//!
//! A [`ServiceRunner`] owns one [`ServiceSpec`] and at most one live child at
//! a time. It moves through `Starting -> Running -> Crashed -> Starting ...`
//! until a shutdown request moves it to the terminal `Stopped` state.

use crate::config::LoggingConfig;
use crate::error::LaunchFailure;
use crate::resources::ResourceManager;
use crate::restart::RestartPolicy;
use crate::service::ServiceSpec;
use crate::signals;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Log target for captured child output.
pub const SERVICE_OUTPUT_TARGET: &str = "service_output";

const OUTPUT_TAIL_LINES: usize = 50;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What the supervisor hands to a runner process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitSpec {
    pub service: ServiceSpec,
    pub restart: RestartPolicy,
    pub stop_timeout: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Starting,
    Running { pid: u32 },
    Crashed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub service: String,
    pub state: RunnerState,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerOutcome {
    /// Shut down on request.
    Stopped,
    /// A configured `max_restarts` ran out.
    RetriesExhausted { restarts: u32 },
}

impl RunnerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerOutcome::Stopped => 0,
            RunnerOutcome::RetriesExhausted { .. } => 3,
        }
    }
}

enum ChildEnd {
    /// Exit status 0. Still unexpected for a service meant to run forever.
    Exited(ExitStatus),
    Shutdown,
}

pub struct ServiceRunner {
    unit: UnitSpec,
    state: RunnerState,
    restarts: u32,
    resources: ResourceManager,
    events: Option<mpsc::UnboundedSender<RunnerEvent>>,
}

impl ServiceRunner {
    pub fn new(unit: UnitSpec) -> Self {
        Self {
            unit,
            state: RunnerState::Starting,
            restarts: 0,
            resources: ResourceManager::new(),
            events: None,
        }
    }

    /// Report every state transition on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn name(&self) -> &str {
        &self.unit.service.name
    }

    fn transition(&mut self, next: RunnerState) {
        log::debug!("{}: {:?} -> {:?}", self.name(), self.state, next);
        self.state = next;
        if let Some(tx) = &self.events {
            let _ = tx.send(RunnerEvent {
                service: self.unit.service.name.clone(),
                state: next,
                at: Instant::now(),
            });
        }
    }

    /// Drive the service until shutdown (or until the retry cap, if any).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunnerOutcome {
        loop {
            if *shutdown.borrow() {
                self.transition(RunnerState::Stopped);
                return RunnerOutcome::Stopped;
            }

            self.transition(RunnerState::Starting);
            match self.run_once(&mut shutdown).await {
                Ok(ChildEnd::Shutdown) => {
                    log::info!("{} stopped", self.name());
                    self.transition(RunnerState::Stopped);
                    return RunnerOutcome::Stopped;
                }
                Ok(ChildEnd::Exited(status)) => {
                    log::warn!("{} exited unexpectedly ({})", self.name(), status);
                }
                Err(failure) => {
                    for line in failure.output() {
                        log::error!("{} | {}", self.name(), line);
                    }
                    log::error!("{} ERROR: {}", self.name(), failure);
                }
            }
            self.transition(RunnerState::Crashed);

            if !self.unit.restart.allows_restart(self.restarts) {
                log::error!("{}: giving up after {} restarts", self.name(), self.restarts);
                return RunnerOutcome::RetriesExhausted { restarts: self.restarts };
            }

            let delay = self.unit.restart.delay_for(self.restarts);
            log::info!("Restarting {} in {:?}...", self.name(), delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signals::shutdown_requested(&mut shutdown) => {
                    log::info!("{}: restart cancelled by shutdown", self.name());
                    self.transition(RunnerState::Stopped);
                    return RunnerOutcome::Stopped;
                }
            }
            self.restarts += 1;
        }
    }

    /// Launch the child once and block until it ends or shutdown is requested.
    async fn run_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<ChildEnd, LaunchFailure> {
        let spec = self.unit.service.clone();

        if let Some(required_gb) = spec.memory_ceiling_gb() {
            self.resources.check_memory_available(&spec.name, required_gb);
        }

        log::info!("Starting {}: {}", spec.name, spec.display_command());
        let mut child = spec.command().spawn().map_err(|source| LaunchFailure::Spawn {
            service: spec.name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        self.transition(RunnerState::Running { pid });
        log::info!("{} running (pid {})", spec.name, pid);

        let captures = [
            child.stdout.take().map(|out| capture(spec.name.clone(), out)),
            child.stderr.take().map(|err| capture(spec.name.clone(), err)),
        ];

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = signals::shutdown_requested(shutdown) => None,
        };

        match waited {
            None => {
                log::info!("Stopping {} (pid {})", spec.name, pid);
                if let Err(e) = signals::stop_child(&mut child, self.unit.stop_timeout, &spec.name).await {
                    log::error!("Failed to stop {}: {}", spec.name, e);
                }
                collect_output(captures).await;
                Ok(ChildEnd::Shutdown)
            }
            Some(Err(source)) => Err(LaunchFailure::Wait {
                service: spec.name.clone(),
                source,
            }),
            Some(Ok(status)) => {
                let output = collect_output(captures).await;
                if status.success() {
                    Ok(ChildEnd::Exited(status))
                } else {
                    Err(LaunchFailure::AbnormalExit {
                        service: spec.name.clone(),
                        status,
                        output,
                    })
                }
            }
        }
    }
}

/// Forward each line of `reader` to the service log and keep the last few.
fn capture<R>(service: String, reader: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        // Raw bytes until EOF: the pipe must stay open whatever the child writes.
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("{}: output capture stopped: {}", service, e);
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(&['\r', '\n'][..])
                .to_string();
            log::info!(target: SERVICE_OUTPUT_TARGET, "[{}] {}", service, line);
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail)
    })
}

async fn collect_output(captures: [Option<JoinHandle<Vec<String>>>; 2]) -> Vec<String> {
    let mut output = Vec::new();
    for handle in captures.into_iter().flatten() {
        // A grandchild may keep the pipe open after the child exits.
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(lines)) => output.extend(lines),
            Ok(Err(e)) => log::warn!("Output capture task failed: {}", e),
            Err(_) => log::debug!("Output still open after exit; detaching capture"),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::BackoffStrategy;
    use crate::service::ServiceKind;
    use std::collections::BTreeMap;

    fn unit(program: &str, args: &[&str], delay: Duration, max_restarts: Option<u32>) -> UnitSpec {
        UnitSpec {
            service: ServiceSpec {
                name: "dummy".to_string(),
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                working_dir: None,
                env: BTreeMap::new(),
                threads: 1,
                kind: ServiceKind::DownloadWorkers { cluster_dispatch: false },
            },
            restart: RestartPolicy {
                delay,
                backoff: BackoffStrategy::Fixed,
                max_delay: delay,
                max_restarts,
            },
            stop_timeout: Duration::from_secs(2),
            logging: LoggingConfig::default(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<RunnerEvent>,
        pred: impl Fn(&RunnerState) -> bool,
    ) -> RunnerEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("runner dropped its event channel");
                if pred(&event.state) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for runner event")
    }

    #[tokio::test]
    async fn test_crash_loop_until_retry_cap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let runner = ServiceRunner::new(unit("sh", &["-c", "echo boom >&2; exit 3"], Duration::from_millis(50), Some(2)))
            .with_events(tx);

        let outcome = runner.run(stop_rx).await;
        assert_eq!(outcome, RunnerOutcome::RetriesExhausted { restarts: 2 });
        assert_eq!(outcome.exit_code(), 3);

        let states: Vec<RunnerState> = drain(&mut rx).into_iter().map(|e| e.state).collect();
        let crashes = states.iter().filter(|s| **s == RunnerState::Crashed).count();
        let launches = states.iter().filter(|s| matches!(s, RunnerState::Running { .. })).count();
        assert_eq!(crashes, 3);
        assert_eq!(launches, 3);
        assert!(!states.contains(&RunnerState::Stopped));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_crash() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let runner = ServiceRunner::new(unit("/nonexistent/portal-service", &[], Duration::from_millis(10), Some(1)))
            .with_events(tx);

        let outcome = runner.run(stop_rx).await;
        assert_eq!(outcome, RunnerOutcome::RetriesExhausted { restarts: 1 });

        let states: Vec<RunnerState> = drain(&mut rx).into_iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                RunnerState::Starting,
                RunnerState::Crashed,
                RunnerState::Starting,
                RunnerState::Crashed
            ]
        );
    }

    #[tokio::test]
    async fn test_clean_exit_is_restarted_too() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let runner = ServiceRunner::new(unit("true", &[], Duration::from_millis(10), Some(1))).with_events(tx);

        assert_eq!(runner.run(stop_rx).await, RunnerOutcome::RetriesExhausted { restarts: 1 });
        let launches = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e.state, RunnerState::Running { .. }))
            .count();
        assert_eq!(launches, 2);
    }

    #[tokio::test]
    async fn test_restart_waits_for_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let delay = Duration::from_millis(400);
        let runner = ServiceRunner::new(unit("sh", &["-c", "exit 1"], delay, Some(1))).with_events(tx);

        runner.run(stop_rx).await;

        let events = drain(&mut rx);
        let crashed = events.iter().find(|e| e.state == RunnerState::Crashed).unwrap();
        let restarted = events
            .iter()
            .filter(|e| e.state == RunnerState::Starting)
            .nth(1)
            .unwrap();
        assert!(restarted.at.duration_since(crashed.at) >= delay);
    }

    #[tokio::test]
    async fn test_shutdown_while_running_stops_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = ServiceRunner::new(unit("sleep", &["30"], Duration::from_secs(5), None)).with_events(tx);
        let handle = tokio::spawn(runner.run(stop_rx));

        let running = next_matching(&mut rx, |s| matches!(s, RunnerState::Running { .. })).await;
        let pid = match running.state {
            RunnerState::Running { pid } => pid,
            _ => unreachable!(),
        };

        stop_tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunnerOutcome::Stopped);
        assert_eq!(outcome.exit_code(), 0);
        next_matching(&mut rx, |s| *s == RunnerState::Stopped).await;

        // The child has been reaped.
        let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err();
        assert!(gone);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = ServiceRunner::new(unit("sh", &["-c", "exit 1"], Duration::from_secs(60), None)).with_events(tx);
        let handle = tokio::spawn(runner.run(stop_rx));

        next_matching(&mut rx, |s| *s == RunnerState::Crashed).await;
        stop_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunnerOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_kept_lossy() {
        let bytes = b"caf\xe9\nplain\npartial".to_vec();
        let lines = capture("dummy".to_string(), std::io::Cursor::new(bytes))
            .await
            .unwrap();
        assert_eq!(lines, vec!["caf\u{FFFD}", "plain", "partial"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_does_not_break_the_pipe() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let script = "printf 'caf\\351\\n'; i=0; while [ $i -lt 20 ]; do echo tick $i || exit 42; i=$((i+1)); sleep 0.05; done; sleep 30";
        let runner = ServiceRunner::new(unit("sh", &["-c", script], Duration::from_millis(10), Some(0)))
            .with_events(tx);
        let handle = tokio::spawn(runner.run(stop_rx));

        next_matching(&mut rx, |s| matches!(s, RunnerState::Running { .. })).await;
        // Long enough for every tick to be written after the bad byte.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!handle.is_finished());

        stop_tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunnerOutcome::Stopped);
        let states: Vec<RunnerState> = drain(&mut rx).into_iter().map(|e| e.state).collect();
        assert!(!states.contains(&RunnerState::Crashed));
    }

    #[tokio::test]
    async fn test_captured_output_tail() {
        let lines = capture(
            "dummy".to_string(),
            std::io::Cursor::new((0..60).map(|i| format!("line {}\n", i)).collect::<String>().into_bytes()),
        )
        .await
        .unwrap();
        assert_eq!(lines.len(), OUTPUT_TAIL_LINES);
        assert_eq!(lines.first().map(String::as_str), Some("line 10"));
        assert_eq!(lines.last().map(String::as_str), Some("line 59"));
    }
}
