//! Container runtime capabilities consumed by the registry and dispatcher.
//!
//! The registry only needs to list containers, so it depends on
//! [`WorkerLister`] alone. The dispatcher also needs [`RuntimeClient::exec`]
//! to hand a command to a worker.
//!
//! # Components
//!
//! - [`DockerCli`]: shells out to the `docker` binary for both capabilities
//! - [`WorkerSnapshot`]: point-in-time view of one container
//! - [`ExecOutput`]: captured result of one `exec`

pub mod docker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::command::RemoteCommand;

pub use docker::DockerCli;

/// A point-in-time view of one execution helper, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl WorkerSnapshot {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: "running".to_string(),
            created_at: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Which containers a listing should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Name marker; a container matches if its name equals or contains it.
    pub name_marker: String,
    /// Include stopped containers.
    pub include_stopped: bool,
}

impl ContainerFilter {
    pub fn new(name_marker: impl Into<String>) -> Self {
        Self {
            name_marker: name_marker.into(),
            include_stopped: false,
        }
    }

    /// Exact match first, then substring.
    pub fn matches(&self, name: &str) -> bool {
        name == self.name_marker || name.contains(&self.name_marker)
    }
}

/// Captured output of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime command exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    #[error("runtime command timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Lists containers that may act as workers.
#[async_trait]
pub trait WorkerLister: Send + Sync {
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<WorkerSnapshot>, RuntimeError>;
}

/// Full runtime surface: listing plus command execution inside a container.
#[async_trait]
pub trait RuntimeClient: WorkerLister {
    /// Run `command` inside `container_id` and capture its output.
    ///
    /// A non-zero exit code is reported through [`ExecOutput::exit_code`],
    /// not as an error; errors mean the runtime itself could not run it.
    async fn exec(
        &self,
        container_id: &str,
        command: &RemoteCommand,
    ) -> Result<ExecOutput, RuntimeError>;
}
