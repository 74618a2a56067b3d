use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

/// Per-service launch parameters appended after the configured base arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceKind {
    /// `-w <threads> -b <bind>:<port> [app]`
    Web {
        bind: String,
        port: u16,
        app: Option<String>,
    },
    /// `<threads> <memory_gb> <0|1>`
    SearchWorkers { memory_gb: u32, cluster_dispatch: bool },
    /// `<threads> <0|1>`
    DownloadWorkers { cluster_dispatch: bool },
}

/// Immutable description of one supervised service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub threads: u32,
    pub kind: ServiceKind,
}

fn dispatch_flag(cluster_dispatch: bool) -> String {
    let flag = if cluster_dispatch { "1" } else { "0" };
    flag.to_string()
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("Service {}: program must not be empty", self.name));
        }
        if self.threads == 0 {
            return Err(anyhow!("Service {}: threads must be at least 1", self.name));
        }
        if let ServiceKind::SearchWorkers { memory_gb: 0, .. } = self.kind {
            return Err(anyhow!("Service {}: memory_gb must be at least 1", self.name));
        }
        Ok(())
    }

    /// Full argument list passed to `program`. Each element reaches the child
    /// verbatim; nothing is ever handed to a shell.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        match &self.kind {
            ServiceKind::Web { bind, port, app } => {
                argv.push("-w".to_string());
                argv.push(self.threads.to_string());
                argv.push("-b".to_string());
                argv.push(format!("{}:{}", bind, port));
                if let Some(app) = app {
                    argv.push(app.clone());
                }
            }
            ServiceKind::SearchWorkers { memory_gb, cluster_dispatch } => {
                argv.push(self.threads.to_string());
                argv.push(memory_gb.to_string());
                argv.push(dispatch_flag(*cluster_dispatch));
            }
            ServiceKind::DownloadWorkers { cluster_dispatch } => {
                argv.push(self.threads.to_string());
                argv.push(dispatch_flag(*cluster_dispatch));
            }
        }
        argv
    }

    pub fn memory_ceiling_gb(&self) -> Option<u32> {
        match self.kind {
            ServiceKind::SearchWorkers { memory_gb, .. } => Some(memory_gb),
            ServiceKind::Web { .. } | ServiceKind::DownloadWorkers { .. } => None,
        }
    }

    /// Human-readable command line for logs.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.argv().into_iter().map(|a| {
                if a.contains(char::is_whitespace) { format!("{:?}", a) } else { a }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The child command with piped output, ready to spawn.
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.argv());
        cmd.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        crate::signals::die_with_parent(&mut cmd);
        cmd
    }
}
