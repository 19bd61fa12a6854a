//! Partial updates, one explicit type per record kind.
//!
//! `apply` validates first and only then writes, so a rejected patch leaves
//! the record untouched. Sensitive fields are re-encrypted with the caller's
//! nonce. The returned list names the fields that were written.

use serde::Deserialize;

use crate::cipher::Cipher;
use crate::error::{RelayError, Result};
use crate::store::{ScriptRecord, SecretRecord, ServerRecord};

const MAX_NAME_LEN: usize = 255;
const MAX_BODY_LEN: usize = 10_000;

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(RelayError::Validation(format!(
            "{} must be between 1 and {} characters",
            field, max
        )));
    }
    Ok(())
}

/// Check a host or username, which reaches `ssh` inside its destination
/// argument. A leading `-` would be read as an option.
pub fn check_ssh_operand(field: &str, value: &str) -> Result<()> {
    check_len(field, value, MAX_NAME_LEN)?;
    if value.starts_with('-') {
        return Err(RelayError::Validation(format!(
            "{} must not start with '-'",
            field
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(RelayError::Validation(format!(
            "{} must not contain control characters",
            field
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptPatch {
    pub name: Option<String>,
    pub script: Option<String>,
}

impl ScriptPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.script.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_len("name", name, MAX_NAME_LEN)?;
        }
        if let Some(script) = &self.script {
            check_len("script", script, MAX_BODY_LEN)?;
        }
        Ok(())
    }

    pub fn apply(
        &self,
        record: &mut ScriptRecord,
        cipher: &Cipher,
        nonce: &str,
    ) -> Result<Vec<&'static str>> {
        self.validate()?;
        let script = self
            .script
            .as_deref()
            .map(|s| cipher.encrypt(s, nonce))
            .transpose()?;

        let mut changed = Vec::new();
        if let Some(name) = &self.name {
            record.name = name.clone();
            changed.push("name");
        }
        if let Some(script) = script {
            record.script = script;
            changed.push("script");
        }
        Ok(changed)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key: Option<String>,
}

impl ServerPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.ssh_key.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_len("name", name, MAX_NAME_LEN)?;
        }
        if let Some(host) = &self.host {
            check_ssh_operand("host", host)?;
        }
        if self.port == Some(0) {
            return Err(RelayError::Validation(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if let Some(username) = &self.username {
            check_ssh_operand("username", username)?;
        }
        if let Some(password) = &self.password {
            check_len("password", password, MAX_NAME_LEN)?;
        }
        if let Some(ssh_key) = &self.ssh_key {
            check_len("ssh_key", ssh_key, MAX_BODY_LEN)?;
        }
        Ok(())
    }

    pub fn apply(
        &self,
        record: &mut ServerRecord,
        cipher: &Cipher,
        nonce: &str,
    ) -> Result<Vec<&'static str>> {
        self.validate()?;
        let password = self
            .password
            .as_deref()
            .map(|p| cipher.encrypt(p, nonce))
            .transpose()?;
        let ssh_key = self
            .ssh_key
            .as_deref()
            .map(|k| cipher.encrypt(k, nonce))
            .transpose()?;

        let mut changed = Vec::new();
        if let Some(name) = &self.name {
            record.name = name.clone();
            changed.push("name");
        }
        if let Some(host) = &self.host {
            record.host = host.clone();
            changed.push("host");
        }
        if let Some(port) = self.port {
            record.port = port;
            changed.push("port");
        }
        if let Some(username) = &self.username {
            record.username = username.clone();
            changed.push("username");
        }
        if let Some(password) = password {
            record.password = password;
            changed.push("password");
        }
        if let Some(ssh_key) = ssh_key {
            record.ssh_key = Some(ssh_key);
            changed.push("ssh_key");
        }
        Ok(changed)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretPatch {
    pub name: Option<String>,
    pub content: Option<String>,
}

impl SecretPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.content.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            check_len("name", name, MAX_NAME_LEN)?;
        }
        if let Some(content) = &self.content {
            check_len("content", content, MAX_BODY_LEN)?;
        }
        Ok(())
    }

    pub fn apply(
        &self,
        record: &mut SecretRecord,
        cipher: &Cipher,
        nonce: &str,
    ) -> Result<Vec<&'static str>> {
        self.validate()?;
        let content = self
            .content
            .as_deref()
            .map(|c| cipher.encrypt(c, nonce))
            .transpose()?;

        let mut changed = Vec::new();
        if let Some(name) = &self.name {
            record.name = name.clone();
            changed.push("name");
        }
        if let Some(content) = content {
            record.content = content;
            changed.push("content");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn cipher() -> Cipher {
        Cipher::new(SecretString::from("11".repeat(32)))
    }

    fn server_record() -> ServerRecord {
        ServerRecord {
            id: 1,
            user_id: 7,
            name: "web".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "root".to_string(),
            password: String::new(),
            ssh_key: None,
        }
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let patch = ServerPatch::default();
        assert!(patch.is_empty());
        let mut record = server_record();
        let changed = patch.apply(&mut record, &cipher(), &Cipher::new_nonce()).unwrap();
        assert!(changed.is_empty());
        assert_eq!(record, server_record());
    }

    #[test]
    fn server_patch_reencrypts_password() {
        let cipher = cipher();
        let nonce = Cipher::new_nonce();
        let patch = ServerPatch {
            port: Some(2222),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };

        let mut record = server_record();
        let changed = patch.apply(&mut record, &cipher, &nonce).unwrap();
        assert_eq!(changed, vec!["port", "password"]);
        assert_eq!(record.port, 2222);
        assert_ne!(record.password, "hunter2");
        assert_eq!(cipher.decrypt(&record.password, &nonce).unwrap(), "hunter2");
    }

    #[test]
    fn invalid_patch_leaves_record_untouched() {
        let patch = ServerPatch {
            name: Some("renamed".to_string()),
            port: Some(0),
            ..Default::default()
        };
        let mut record = server_record();
        let result = patch.apply(&mut record, &cipher(), &Cipher::new_nonce());
        assert!(matches!(result, Err(RelayError::Validation(_))));
        assert_eq!(record.name, "web");
    }

    #[test]
    fn server_patch_rejects_option_like_destination() {
        for (host, username) in [
            (Some("-oProxyCommand=touch /tmp/x"), None),
            (None, Some("-oProxyCommand=touch /tmp/x")),
            (None, Some("-l")),
            (Some("10.0.0.1\n-oProxyCommand=id"), None),
        ] {
            let patch = ServerPatch {
                host: host.map(str::to_string),
                username: username.map(str::to_string),
                ..Default::default()
            };
            let mut record = server_record();
            let result = patch.apply(&mut record, &cipher(), &Cipher::new_nonce());
            assert!(
                matches!(result, Err(RelayError::Validation(_))),
                "accepted host {:?} username {:?}",
                host,
                username
            );
            assert_eq!(record, server_record());
        }

        let fine = ServerPatch {
            host: Some("web-1.internal".to_string()),
            username: Some("deploy-bot".to_string()),
            ..Default::default()
        };
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn script_patch_length_limits() {
        let too_long = ScriptPatch {
            script: Some("x".repeat(MAX_BODY_LEN + 1)),
            ..Default::default()
        };
        assert!(too_long.validate().is_err());

        let empty_name = ScriptPatch {
            name: Some(String::new()),
            ..Default::default()
        };
        assert!(empty_name.validate().is_err());
    }

    #[test]
    fn secret_patch_from_json() {
        let patch: SecretPatch = serde_json::from_str(r#"{"content":"A=1"}"#).unwrap();
        assert!(patch.name.is_none());
        assert_eq!(patch.content.as_deref(), Some("A=1"));
    }
}
