use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::command::RemoteCommand;
use crate::config::RuntimeConfig;
use crate::runtime::{
    ContainerFilter, ExecOutput, RuntimeClient, RuntimeError, WorkerLister, WorkerSnapshot,
};

/// Length of the short container ID shown by `docker ps`.
const SHORT_ID_LEN: usize = 12;

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

/// Talks to the container runtime through the `docker` CLI.
///
/// Worker commands run as `docker exec <id> sh -c <command>`, with the
/// command passed as a single argv entry so no local shell reinterprets it.
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: RuntimeConfig,
}

impl DockerCli {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    fn list_args(filter: &ContainerFilter) -> Vec<String> {
        let mut args = vec!["ps".to_string(), "--no-trunc".to_string()];
        if filter.include_stopped {
            args.push("--all".to_string());
        }
        args.push("--filter".to_string());
        args.push(format!("name={}", filter.name_marker));
        args.push("--format".to_string());
        args.push("{{json .}}".to_string());
        args
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, RuntimeError> {
        let child = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.config.exec_timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(RuntimeError::Spawn {
                program: self.config.docker_bin.clone(),
                source,
            }),
            Err(_) => Err(RuntimeError::Timeout(self.config.exec_timeout)),
        }
    }
}

#[async_trait]
impl WorkerLister for DockerCli {
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<WorkerSnapshot>, RuntimeError> {
        let output = self.run(&Self::list_args(filter)).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let snapshots = parse_ps_output(&stdout)?;
        tracing::debug!(count = snapshots.len(), "Listed containers");
        Ok(snapshots)
    }
}

#[async_trait]
impl RuntimeClient for DockerCli {
    async fn exec(
        &self,
        container_id: &str,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, RuntimeError> {
        tracing::debug!(container_id, "Executing command in container");

        let args = vec![
            "exec".to_string(),
            container_id.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.expose().to_string(),
        ];
        let output = self.run(&args).await?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Parse newline-delimited `docker ps` JSON into snapshots.
pub(crate) fn parse_ps_output(stdout: &str) -> Result<Vec<WorkerSnapshot>, RuntimeError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let entry: PsEntry = serde_json::from_str(line)
                .map_err(|e| RuntimeError::Parse(format!("{}: {}", e, line)))?;
            Ok(snapshot_from_entry(entry))
        })
        .collect()
}

fn snapshot_from_entry(entry: PsEntry) -> WorkerSnapshot {
    let name = entry
        .names
        .split(',')
        .next()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();

    WorkerSnapshot {
        id: entry.id.chars().take(SHORT_ID_LEN).collect(),
        name,
        status: entry.status,
        created_at: parse_created_at(&entry.created_at),
    }
}

/// Parse docker's `2024-03-01 10:15:00 +0000 UTC` timestamp format.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let (date, time, offset) = (parts.next()?, parts.next()?, parts.next()?);
    let stamp = format!("{} {} {}", date, time, offset);

    DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .ok()
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}
