//! Synthesis of remote shell commands.
//!
//! Every command built here is a single string that a worker runs with
//! `sh -c`. It has the shape
//!
//! ```text
//! sshpass -p '<password>' ssh -o ... [-p <port>] [-i '<key>'] '<user>@<host>' '<inner>'
//! ```
//!
//! and is interpreted by two shells: the worker's, which strips the outer
//! quoting, and the remote login shell, which runs `<inner>`. Every value
//! that did not originate in this module is passed through [`quote`]
//! before concatenation, at both levels.

mod env;

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

use crate::config::SshOptions;

pub use env::{parse_secret_env, EnvMap};

const DEFAULT_SSH_PORT: u16 = 22;

/// Quote `value` as a single POSIX shell word.
///
/// The value is wrapped in single quotes; each embedded `'` closes the
/// quote, emits a double-quoted `'`, and reopens.
pub fn quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}

/// A fully built command, ready to be executed once by a worker.
///
/// Contains decrypted credentials; `Debug` never shows the contents.
pub struct RemoteCommand(SecretString);

impl RemoteCommand {
    fn new(command: String) -> Self {
        Self(SecretString::from(command))
    }

    /// The command text. Do not log or persist it.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.expose().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteCommand([REDACTED, {} bytes])", self.len())
    }
}

/// SSH connection details for the target host.
#[derive(Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
    /// Path to a private key on the worker, passed as `ssh -i`.
    pub key_path: Option<String>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: SecretString) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            password,
            key_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("key_path", &self.key_path.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Credentials for `docker login` on the target host.
#[derive(Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// `<registry>/<image>:<tag>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            image: image.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.image, self.tag)
    }
}

/// Container to start on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub network: Option<String>,
    pub ip: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: ImageRef) -> Self {
        Self {
            name: name.into(),
            image,
            network: None,
            ip: None,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>, ip: Option<String>) -> Self {
        self.network = Some(network.into());
        self.ip = ip;
        self
    }
}

/// Everything needed to synthesize one remote command.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub target: SshTarget,
    pub ssh: SshOptions,
    pub script: String,
    pub env: EnvMap,
    pub registry_credentials: Option<RegistryCredentials>,
    pub container: Option<ContainerSpec>,
    /// Prepend `export` lines for `env` to the script body.
    pub inject_env_into_script: bool,
    /// Pass `env` to `docker run` as `-e` flags.
    pub inject_env_into_container: bool,
}

impl RunnerConfig {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            ssh: SshOptions::default(),
            script: String::new(),
            env: EnvMap::new(),
            registry_credentials: None,
            container: None,
            inject_env_into_script: false,
            inject_env_into_container: false,
        }
    }

    pub fn with_ssh_options(mut self, ssh: SshOptions) -> Self {
        self.ssh = ssh;
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Set the environment and inject it into the script body.
    pub fn with_script_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self.inject_env_into_script = true;
        self
    }

    /// Set the environment and pass it to `docker run`.
    pub fn with_container_env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self.inject_env_into_container = true;
        self
    }

    pub fn with_registry_credentials(mut self, credentials: RegistryCredentials) -> Self {
        self.registry_credentials = Some(credentials);
        self
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.container = Some(container);
        self
    }
}

/// `docker login` on the target, or an empty inner command without credentials.
pub fn build_login(cfg: &RunnerConfig) -> RemoteCommand {
    let inner = match &cfg.registry_credentials {
        Some(creds) => {
            let mut inner = format!(
                "docker login -u {} -p {}",
                quote(&creds.username),
                quote(creds.password.expose_secret())
            );
            if let Some(container) = &cfg.container {
                inner.push(' ');
                inner.push_str(&quote(&container.image.registry));
            }
            inner
        }
        None => String::new(),
    };
    ssh_invoke(&cfg.target, &cfg.ssh, &inner)
}

/// `docker pull <registry>/<image>:<tag>` on the target.
pub fn build_pull(cfg: &RunnerConfig) -> RemoteCommand {
    let inner = match &cfg.container {
        Some(container) => format!("docker pull {}", quote(&container.image.to_string())),
        None => String::new(),
    };
    ssh_invoke(&cfg.target, &cfg.ssh, &inner)
}

/// `docker run -d --name <name> [-e K=V ...] <registry>/<image>:<tag>` on the target.
pub fn build_run(cfg: &RunnerConfig) -> RemoteCommand {
    let inner = match &cfg.container {
        Some(container) => {
            let mut parts = vec![
                "docker run -d --name".to_string(),
                quote(&container.name),
            ];
            if cfg.inject_env_into_container {
                for (key, value) in cfg.env.iter() {
                    parts.push(format!("-e {}={}", key, quote(value)));
                }
            }
            if let Some(network) = &container.network {
                parts.push(format!("--network {}", quote(network)));
            }
            if let Some(ip) = &container.ip {
                parts.push(format!("--ip {}", quote(ip)));
            }
            parts.push(quote(&container.image.to_string()));
            parts.join(" ")
        }
        None => String::new(),
    };
    ssh_invoke(&cfg.target, &cfg.ssh, &inner)
}

/// Run the configured script on the target, optionally with exported env.
pub fn build_script_runner(cfg: &RunnerConfig) -> RemoteCommand {
    let script = if cfg.inject_env_into_script {
        compose_script(&cfg.script, &cfg.env)
    } else {
        cfg.script.clone()
    };
    ssh_invoke(&cfg.target, &cfg.ssh, &script)
}

/// Prefix `script` with one `export KEY='value'` line per entry of `env`.
pub fn compose_script(script: &str, env: &EnvMap) -> String {
    let mut composed = String::with_capacity(script.len());
    for (key, value) in env.iter() {
        composed.push_str("export ");
        composed.push_str(key);
        composed.push('=');
        composed.push_str(&quote(value));
        composed.push('\n');
    }
    composed.push_str(script);
    composed
}

/// Wrap `inner` in an SSH invocation against `target`.
///
/// Password authentication goes through `sshpass`; with an empty password
/// `ssh` is called directly and relies on the key.
pub fn ssh_invoke(target: &SshTarget, opts: &SshOptions, inner: &str) -> RemoteCommand {
    let password = target.password.expose_secret();
    let mut parts: Vec<String> = Vec::new();

    if !password.is_empty() {
        parts.push("sshpass -p".to_string());
        parts.push(quote(password));
    }
    parts.push("ssh".to_string());

    let host_key_checking = if opts.strict_host_key_checking {
        "yes"
    } else {
        "no"
    };
    parts.push(format!("-o StrictHostKeyChecking={}", host_key_checking));
    parts.push(format!("-o ConnectTimeout={}", opts.connect_timeout_secs));
    parts.push(format!(
        "-o ServerAliveInterval={}",
        opts.server_alive_interval_secs
    ));
    parts.push(format!(
        "-o ServerAliveCountMax={}",
        opts.server_alive_count_max
    ));

    if target.port != DEFAULT_SSH_PORT {
        parts.push(format!("-p {}", target.port));
    }
    if let Some(key_path) = &target.key_path {
        parts.push("-i".to_string());
        parts.push(quote(key_path));
    }

    // Ends option parsing so a destination starting with `-` stays a destination
    parts.push("--".to_string());
    parts.push(quote(&format!("{}@{}", target.user, target.host)));
    parts.push(quote(inner));

    RemoteCommand::new(parts.join(" "))
}
