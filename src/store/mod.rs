//! Tenant-scoped records consumed by the dispatcher.
//!
//! Each store returns the decrypted view of one record owned by the caller.
//! A record owned by someone else is reported exactly like a missing one.

pub mod memory;
pub mod patch;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStore;
pub use patch::{check_ssh_operand, ScriptPatch, SecretPatch, ServerPatch};

fn default_ssh_port() -> u16 {
    22
}

/// A stored script. `script` is an encrypted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// A stored host. `password` and `ssh_key` are encrypted fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ssh_key: Option<String>,
}

/// A stored secret. `content` is an encrypted field of `KEY=value` lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub content: String,
}

/// Decrypted script.
#[derive(Debug, Clone)]
pub struct Script {
    pub id: u64,
    pub name: String,
    pub body: String,
}

/// Decrypted host credentials.
#[derive(Clone)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Private key path on the worker, if key authentication is used.
    pub ssh_key: Option<SecretString>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("ssh_key", &self.ssh_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Decrypted secret.
#[derive(Clone)]
pub struct Secret {
    pub id: u64,
    pub name: String,
    pub content: SecretString,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("content", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get_script(&self, id: u64, user_id: u64, nonce: &str) -> Result<Script>;
}

#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn get_server(&self, id: u64, user_id: u64, nonce: &str) -> Result<Server>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, id: u64, user_id: u64, nonce: &str) -> Result<Secret>;
}

/// The three collaborators the dispatcher reads from.
#[derive(Clone)]
pub struct Stores {
    pub scripts: Arc<dyn ScriptStore>,
    pub servers: Arc<dyn ServerStore>,
    pub secrets: Arc<dyn SecretStore>,
}

impl Stores {
    /// Use one backend for all three record kinds.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ScriptStore + ServerStore + SecretStore + 'static,
    {
        Self {
            scripts: store.clone(),
            servers: store.clone(),
            secrets: store,
        }
    }
}
