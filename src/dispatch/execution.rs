use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::runtime::{ExecOutput, RuntimeError, WorkerSnapshot};

pub type ExecutionId = Uuid;

/// Most bytes of stdout or stderr kept per execution.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Keep the last `MAX_OUTPUT_BYTES` of `text`, cut on a char boundary.
fn tail_of(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated {} bytes]\n{}", start, &text[start..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Dispatched,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Dispatched => write!(f, "dispatched"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one dispatched run, as far as this process observed it.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    #[serde(skip)]
    pub user_id: u64,
    pub script_id: u64,
    pub server_id: u64,
    pub worker_id: String,
    pub worker_name: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn dispatched(user_id: u64, script_id: u64, server_id: u64, worker: &WorkerSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            script_id,
            server_id,
            worker_id: worker.id.clone(),
            worker_name: worker.name.clone(),
            status: ExecutionStatus::Dispatched,
            exit_code: None,
            output: None,
            error: None,
            dispatched_at: Utc::now(),
            completed_at: None,
        }
    }

    fn finish(&mut self, result: &Result<ExecOutput, RuntimeError>) {
        self.completed_at = Some(Utc::now());
        match result {
            Ok(output) => {
                self.exit_code = output.exit_code;
                self.output = Some(tail_of(&output.stdout)).filter(|s| !s.is_empty());
                if output.success() {
                    self.status = ExecutionStatus::Completed;
                } else {
                    self.status = ExecutionStatus::Failed;
                    self.error = Some(if output.stderr.is_empty() {
                        format!("Exit code: {:?}", output.exit_code)
                    } else {
                        tail_of(&output.stderr)
                    });
                }
            }
            Err(e) => {
                self.status = ExecutionStatus::Failed;
                self.error = Some(e.to_string());
            }
        }
    }
}

#[derive(Debug, Default)]
struct LogInner {
    records: HashMap<ExecutionId, ExecutionRecord>,
    order: VecDeque<ExecutionId>,
}

/// Bounded in-memory log of dispatched executions.
///
/// When full, inserting evicts the oldest record regardless of its status.
#[derive(Debug)]
pub struct ExecutionLog {
    inner: RwLock<LogInner>,
    capacity: usize,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub async fn insert(&self, record: ExecutionRecord) {
        let mut inner = self.inner.write().await;
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.records.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(record.id);
        inner.records.insert(record.id, record);
    }

    /// Record the result of the runtime call. Returns the new status, or
    /// `None` if the record was already evicted.
    pub async fn finish(
        &self,
        id: &ExecutionId,
        result: &Result<ExecOutput, RuntimeError>,
    ) -> Option<ExecutionStatus> {
        let mut inner = self.inner.write().await;
        let record = inner.records.get_mut(id)?;
        record.finish(result);
        Some(record.status)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<ExecutionRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
