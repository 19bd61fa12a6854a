//! Turns a run request into a command handed to a worker.
//!
//! Everything up to worker selection happens on the caller's task and its
//! errors are returned. The runtime call itself runs on a detached task:
//! [`Dispatcher::run`] returns as soon as the job is handed off, and the
//! outcome is only visible through the execution log and the logs.

pub mod execution;

use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::command::{build_script_runner, parse_secret_env, EnvMap, RunnerConfig, SshTarget};
use crate::config::{ExecutionLogConfig, SshOptions};
use crate::error::{RelayError, Result};
use crate::registry::WorkerRegistry;
use crate::runtime::{RuntimeClient, WorkerSnapshot};
use crate::store::{check_ssh_operand, Stores};

pub use execution::{ExecutionId, ExecutionLog, ExecutionRecord, ExecutionStatus};

/// Request body of the "run script" operation.
#[derive(Debug, Clone, Deserialize)]
pub struct RunScriptBody {
    pub script_id: u64,
    pub server_id: u64,
    #[serde(default, alias = "secret_id")]
    pub env_id: Option<u64>,
    #[serde(default)]
    pub load_env: bool,
}

/// One run, bound to the caller's identity.
#[derive(Clone)]
pub struct RunRequest {
    pub script_id: u64,
    pub server_id: u64,
    pub secret_id: Option<u64>,
    pub user_id: u64,
    pub nonce: String,
    pub load_env: bool,
}

impl RunRequest {
    pub fn new(body: RunScriptBody, user_id: u64, nonce: impl Into<String>) -> Self {
        Self {
            script_id: body.script_id,
            server_id: body.server_id,
            secret_id: body.env_id,
            user_id,
            nonce: nonce.into(),
            load_env: body.load_env,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.script_id == 0 {
            return Err(RelayError::Validation("script_id is required".to_string()));
        }
        if self.server_id == 0 {
            return Err(RelayError::Validation("server_id is required".to_string()));
        }
        if self.load_env && self.secret_id.unwrap_or(0) == 0 {
            return Err(RelayError::Validation(
                "env_id is required when load_env is set".to_string(),
            ));
        }
        if self.nonce.is_empty() {
            return Err(RelayError::Validation("session nonce is missing".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("script_id", &self.script_id)
            .field("server_id", &self.server_id)
            .field("secret_id", &self.secret_id)
            .field("user_id", &self.user_id)
            .field("load_env", &self.load_env)
            .finish_non_exhaustive()
    }
}

pub struct Dispatcher {
    stores: Stores,
    registry: Arc<WorkerRegistry>,
    runtime: Arc<dyn RuntimeClient>,
    ssh: SshOptions,
    executions: Arc<ExecutionLog>,
}

impl Dispatcher {
    pub fn new(stores: Stores, registry: Arc<WorkerRegistry>, runtime: Arc<dyn RuntimeClient>) -> Self {
        Self {
            stores,
            registry,
            runtime,
            ssh: SshOptions::default(),
            executions: Arc::new(ExecutionLog::new(ExecutionLogConfig::default().capacity)),
        }
    }

    pub fn with_ssh_options(mut self, ssh: SshOptions) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn with_execution_capacity(mut self, capacity: usize) -> Self {
        self.executions = Arc::new(ExecutionLog::new(capacity));
        self
    }

    pub fn execution_capacity(&self) -> usize {
        self.executions.capacity()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Resolve inputs, build the command, pick a worker and hand off.
    ///
    /// Success means a worker was given the job, not that the script ran.
    pub async fn run(&self, request: RunRequest) -> Result<ExecutionId> {
        request.validate()?;

        let script = self
            .stores
            .scripts
            .get_script(request.script_id, request.user_id, &request.nonce)
            .await?;
        let server = self
            .stores
            .servers
            .get_server(request.server_id, request.user_id, &request.nonce)
            .await?;

        // Seeded records and other store backends skip create-time validation
        check_ssh_operand("host", &server.host)?;
        check_ssh_operand("username", &server.username)?;

        let env = match (request.load_env, request.secret_id) {
            (true, Some(secret_id)) => {
                let secret = self
                    .stores
                    .secrets
                    .get_secret(secret_id, request.user_id, &request.nonce)
                    .await?;
                parse_secret_env(secret.content.expose_secret())
            }
            _ => EnvMap::new(),
        };

        let mut target = SshTarget::new(server.host, server.username, server.password)
            .with_port(server.port);
        if let Some(key) = server.ssh_key {
            target = target.with_key_path(key.expose_secret());
        }

        let mut runner = RunnerConfig::new(target)
            .with_ssh_options(self.ssh.clone())
            .with_script(script.body);
        if request.load_env {
            runner = runner.with_script_env(env);
        }
        let command = build_script_runner(&runner);

        let worker = self.select_worker().await?;

        let record = ExecutionRecord::dispatched(
            request.user_id,
            request.script_id,
            request.server_id,
            &worker,
        );
        let execution_id = record.id;
        self.executions.insert(record).await;

        tracing::info!(
            execution_id = %execution_id,
            worker_id = %worker.id,
            script_id = request.script_id,
            server_id = request.server_id,
            "Dispatching script"
        );

        let runtime = self.runtime.clone();
        let executions = self.executions.clone();
        tokio::spawn(async move {
            let result = runtime.exec(&worker.id, &command).await;
            drop(command);

            match &result {
                Ok(output) => tracing::info!(
                    execution_id = %execution_id,
                    worker_id = %worker.id,
                    exit_code = ?output.exit_code,
                    "Execution finished"
                ),
                Err(e) => tracing::error!(
                    execution_id = %execution_id,
                    worker_id = %worker.id,
                    error = %e,
                    "Execution failed"
                ),
            }

            if executions.finish(&execution_id, &result).await.is_none() {
                tracing::debug!(execution_id = %execution_id, "Execution record evicted before completion");
            }
        });

        Ok(execution_id)
    }

    /// Look up an execution started by `user_id`.
    pub async fn execution(&self, id: &ExecutionId, user_id: u64) -> Result<ExecutionRecord> {
        self.executions
            .get(id)
            .await
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("execution", id))
    }

    /// Refresh if the cache is stale or empty, then pick a worker.
    ///
    /// A failed refresh falls back to whatever the cache still holds.
    async fn select_worker(&self) -> Result<WorkerSnapshot> {
        if let Err(e) = self.registry.get_or_refresh(false).await {
            tracing::warn!(error = %e, "Worker refresh failed, using cached workers");
        }
        self.registry.pick_random()
    }
}
