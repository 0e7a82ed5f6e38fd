//! Deployment descriptor (`.koram-rc.<env>.json`)

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Port the application listens on when the env block does not set one
pub const DEFAULT_APP_PORT: u16 = 3000;

/// A deployment descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Project name
    #[serde(default)]
    pub name: String,

    /// Environment the descriptor was initialised for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Target server
    #[serde(default)]
    pub server: ServerConfig,

    /// Deploy settings
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Environment written to the remote `.env`
    #[serde(default)]
    pub env: IndexMap<String, EnvValue>,

    /// Build environment file, e.g. `.env.production`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_env: Option<String>,

    /// Supervised processes
    #[serde(default, deserialize_with = "deserialize_processes")]
    pub processes: Vec<ProcessEntry>,

    /// Advanced toggles
    #[serde(default)]
    pub advanced: AdvancedSettings,

    /// Keys this version does not know about, kept on write-back
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeploymentConfig {
    /// Atomic deploys: `deploy.atomicDeploys` wins over `advanced.atomicDeploys`, default off
    pub fn atomic_deploys(&self) -> bool {
        self.deploy
            .atomic_deploys
            .or(self.advanced.atomic_deploys)
            .unwrap_or(false)
    }

    /// `PORT` from the env block, falling back to the default
    pub fn app_port(&self) -> String {
        self.env
            .get("PORT")
            .map(|v| v.to_string())
            .unwrap_or_else(|| DEFAULT_APP_PORT.to_string())
    }

    /// Last dot-separated segment of `buildEnv`, e.g. `production` for `.env.production`
    pub fn build_env_name(&self) -> String {
        self.build_env
            .as_deref()
            .and_then(|b| b.rsplit('.').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("production")
            .to_string()
    }

    /// Remove every secret so the descriptor can be written back to disk
    pub fn strip_secrets(&mut self) {
        self.server.password = None;
        self.server.password_plain = None;
    }
}

/// Target server settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub user: String,

    #[serde(default = "default_ssh_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    /// Password overlaid from a credential alias. Never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(
        default,
        rename = "password_plain",
        skip_serializing_if = "Option::is_none"
    )]
    pub password_plain: Option<String>,

    /// Private key path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerConfig {
    /// The password to authenticate with, `password_plain` first
    pub fn secret(&self) -> Option<&str> {
        self.password_plain
            .as_deref()
            .or(self.password.as_deref())
            .filter(|p| !p.is_empty())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: default_ssh_port(),
            password: None,
            password_plain: None,
            ssh_key: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("password", &self.secret().map(|_| "[REDACTED]"))
            .field("ssh_key", &self.ssh_key)
            .finish()
    }
}

/// Deploy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploySettings {
    /// Remote base path
    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atomic_deploys: Option<bool>,

    /// Remote commands run after transfer, also chained before every later remote command
    #[serde(default)]
    pub pre_deploy: Vec<String>,

    /// Remote commands run after processes restart
    #[serde(default)]
    pub post_deploy: Vec<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Advanced toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSettings {
    #[serde(default = "default_true")]
    pub use_pm2: bool,

    #[serde(default = "default_true")]
    pub optimize_npm: bool,

    #[serde(default)]
    pub local_npm_install: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atomic_deploys: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            use_pm2: true,
            optimize_npm: true,
            local_npm_install: false,
            atomic_deploys: None,
        }
    }
}

/// One supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    #[serde(default = "default_process_name")]
    pub name: String,

    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_path: Option<String>,
}

fn default_process_name() -> String {
    "app".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessSpec {
    command: String,
    #[serde(default)]
    logs_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProcessesRepr {
    List(Vec<ProcessEntry>),
    Map(IndexMap<String, ProcessSpec>),
}

/// Accepts both `[{name, command}]` and `{name: {command}}`
fn deserialize_processes<'de, D>(deserializer: D) -> Result<Vec<ProcessEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<ProcessesRepr>::deserialize(deserializer)?;
    Ok(match repr {
        None => Vec::new(),
        Some(ProcessesRepr::List(list)) => list,
        Some(ProcessesRepr::Map(map)) => map
            .into_iter()
            .map(|(name, spec)| ProcessEntry {
                name,
                command: spec.command,
                logs_path: spec.logs_path,
            })
            .collect(),
    })
}

/// Accepts `22` and `"22"`
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(n) => Ok(n),
        PortRepr::Text(s) if s.trim().is_empty() => Ok(default_ssh_port()),
        PortRepr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A value in the env block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Text(s) => f.write_str(s),
            EnvValue::Number(n) => write!(f, "{}", n),
            EnvValue::Flag(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::Text(s.to_string())
    }
}
