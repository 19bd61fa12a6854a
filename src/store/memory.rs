use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cipher::Cipher;
use crate::error::{RelayError, Result};
use crate::store::{
    check_ssh_operand, Script, ScriptPatch, ScriptRecord, ScriptStore, Secret, SecretPatch,
    SecretRecord, SecretStore, Server, ServerPatch, ServerRecord, ServerStore,
};

/// Encrypted records as written to a seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRecords {
    #[serde(default)]
    pub scripts: Vec<ScriptRecord>,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub secrets: Vec<SecretRecord>,
}

/// In-process store holding encrypted records.
///
/// Fields are decrypted on read with the caller's nonce; plaintext is never
/// kept in the maps.
pub struct MemoryStore {
    cipher: Arc<Cipher>,
    scripts: RwLock<HashMap<u64, ScriptRecord>>,
    servers: RwLock<HashMap<u64, ServerRecord>>,
    secrets: RwLock<HashMap<u64, SecretRecord>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new(cipher: Arc<Cipher>) -> Self {
        Self::from_records(cipher, StoreRecords::default())
    }

    pub fn from_records(cipher: Arc<Cipher>, records: StoreRecords) -> Self {
        let max_id = records
            .scripts
            .iter()
            .map(|r| r.id)
            .chain(records.servers.iter().map(|r| r.id))
            .chain(records.secrets.iter().map(|r| r.id))
            .max()
            .unwrap_or(0);

        Self {
            cipher,
            scripts: RwLock::new(records.scripts.into_iter().map(|r| (r.id, r)).collect()),
            servers: RwLock::new(records.servers.into_iter().map(|r| (r.id, r)).collect()),
            secrets: RwLock::new(records.secrets.into_iter().map(|r| (r.id, r)).collect()),
            next_id: AtomicU64::new(max_id + 1),
        }
    }

    /// Load encrypted records from a JSON file.
    pub async fn load(cipher: Arc<Cipher>, path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            RelayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let records: StoreRecords = serde_json::from_str(&raw).map_err(|e| {
            RelayError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        tracing::info!(
            scripts = records.scripts.len(),
            servers = records.servers.len(),
            secrets = records.secrets.len(),
            path = %path.display(),
            "Loaded store records"
        );
        Ok(Self::from_records(cipher, records))
    }

    /// Copy of all encrypted records.
    pub async fn export(&self) -> StoreRecords {
        let mut records = StoreRecords {
            scripts: self.scripts.read().await.values().cloned().collect(),
            servers: self.servers.read().await.values().cloned().collect(),
            secrets: self.secrets.read().await.values().cloned().collect(),
        };
        records.scripts.sort_by_key(|r| r.id);
        records.servers.sort_by_key(|r| r.id);
        records.secrets.sort_by_key(|r| r.id);
        records
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn create_script(
        &self,
        user_id: u64,
        name: &str,
        body: &str,
        nonce: &str,
    ) -> Result<u64> {
        let id = self.allocate_id();
        let record = ScriptRecord {
            id,
            user_id,
            name: name.to_string(),
            script: self.cipher.encrypt(body, nonce)?,
            last_run_at: None,
        };
        self.scripts.write().await.insert(id, record);
        Ok(id)
    }

    pub async fn create_server(
        &self,
        user_id: u64,
        name: &str,
        host: &str,
        username: &str,
        password: &str,
        nonce: &str,
    ) -> Result<u64> {
        check_ssh_operand("host", host)?;
        check_ssh_operand("username", username)?;

        let id = self.allocate_id();
        let record = ServerRecord {
            id,
            user_id,
            name: name.to_string(),
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            password: self.cipher.encrypt(password, nonce)?,
            ssh_key: None,
        };
        self.servers.write().await.insert(id, record);
        Ok(id)
    }

    pub async fn create_secret(
        &self,
        user_id: u64,
        name: &str,
        content: &str,
        nonce: &str,
    ) -> Result<u64> {
        let id = self.allocate_id();
        let record = SecretRecord {
            id,
            user_id,
            name: name.to_string(),
            content: self.cipher.encrypt(content, nonce)?,
        };
        self.secrets.write().await.insert(id, record);
        Ok(id)
    }

    pub async fn update_script(
        &self,
        id: u64,
        user_id: u64,
        nonce: &str,
        patch: &ScriptPatch,
    ) -> Result<Vec<&'static str>> {
        let mut scripts = self.scripts.write().await;
        let record = scripts
            .get_mut(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("script", id))?;
        patch.apply(record, &self.cipher, nonce)
    }

    pub async fn update_server(
        &self,
        id: u64,
        user_id: u64,
        nonce: &str,
        patch: &ServerPatch,
    ) -> Result<Vec<&'static str>> {
        let mut servers = self.servers.write().await;
        let record = servers
            .get_mut(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("server", id))?;
        patch.apply(record, &self.cipher, nonce)
    }

    pub async fn update_secret(
        &self,
        id: u64,
        user_id: u64,
        nonce: &str,
        patch: &SecretPatch,
    ) -> Result<Vec<&'static str>> {
        let mut secrets = self.secrets.write().await;
        let record = secrets
            .get_mut(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("secret", id))?;
        patch.apply(record, &self.cipher, nonce)
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn get_script(&self, id: u64, user_id: u64, nonce: &str) -> Result<Script> {
        let scripts = self.scripts.read().await;
        let record = scripts
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("script", id))?;

        Ok(Script {
            id: record.id,
            name: record.name.clone(),
            body: self.cipher.decrypt(&record.script, nonce)?,
        })
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn get_server(&self, id: u64, user_id: u64, nonce: &str) -> Result<Server> {
        let servers = self.servers.read().await;
        let record = servers
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("server", id))?;

        let password = self.cipher.decrypt(&record.password, nonce)?;
        let ssh_key = self.cipher.decrypt_opt(record.ssh_key.as_deref(), nonce)?;

        Ok(Server {
            id: record.id,
            name: record.name.clone(),
            host: record.host.clone(),
            port: record.port,
            username: record.username.clone(),
            password: SecretString::from(password),
            ssh_key: ssh_key.map(SecretString::from),
        })
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(&self, id: u64, user_id: u64, nonce: &str) -> Result<Secret> {
        let secrets = self.secrets.read().await;
        let record = secrets
            .get(&id)
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| RelayError::not_found("secret", id))?;

        Ok(Secret {
            id: record.id,
            name: record.name.clone(),
            content: SecretString::from(self.cipher.decrypt(&record.content, nonce)?),
        })
    }
}
