//! Descriptor discovery, loading and write-back

use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tokio::fs;
use tracing::{debug, info};

use crate::config::descriptor::{DeploymentConfig, EnvValue, ProcessEntry};
use crate::credentials::{CredentialProvider, CredentialQuery};
use crate::errors::DeployError;
use crate::filesys::file::File;

const DESCRIPTOR_PREFIX: &str = ".koram-rc.";
const DESCRIPTOR_SUFFIX: &str = ".json";

/// Finds and reads `.koram-rc.<env>.json` files in a project root
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
}

impl ConfigLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The descriptor file for an environment name
    pub fn descriptor_file(&self, env: &str) -> Result<File, DeployError> {
        validate_env_name(env)?;
        Ok(File::new(self.root.join(format!(
            "{}{}{}",
            DESCRIPTOR_PREFIX, env, DESCRIPTOR_SUFFIX
        ))))
    }

    /// Environment names with a descriptor in the root, sorted
    pub async fn discover(&self) -> Result<Vec<String>, DeployError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut envs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(env) = env_from_file_name(&name) {
                envs.push(env.to_string());
            }
        }
        envs.sort();
        Ok(envs)
    }

    /// Pick the environment: explicit name, else the only descriptor
    pub async fn select(&self, env: Option<&str>) -> Result<String, DeployError> {
        if let Some(env) = env {
            validate_env_name(env)?;
            return Ok(env.to_string());
        }

        let envs = self.discover().await?;
        match envs.as_slice() {
            [] => Err(DeployError::ConfigError(format!(
                "No {}<env>{} descriptor in {}, run `koram init` first",
                DESCRIPTOR_PREFIX,
                DESCRIPTOR_SUFFIX,
                self.root.display()
            ))),
            [only] => Ok(only.clone()),
            many => Err(DeployError::ConfigError(format!(
                "Several environments configured, pass one of: {}",
                many.join(", ")
            ))),
        }
    }

    /// Load the selected descriptor
    pub async fn load(&self, env: Option<&str>) -> Result<(String, DeploymentConfig), DeployError> {
        let env = self.select(env).await?;
        let file = self.descriptor_file(&env)?;
        if !file.exists().await {
            return Err(DeployError::ConfigError(format!(
                "Descriptor {} not found",
                file.path().display()
            )));
        }

        let mut config: DeploymentConfig = file.read_json().await.map_err(|e| {
            DeployError::ConfigError(format!("Invalid descriptor {}: {}", file.name(), e))
        })?;
        if config.environment.is_none() {
            config.environment = Some(env.clone());
        }
        debug!("Loaded descriptor {} for '{}'", file.name(), config.name);
        Ok((env, config))
    }

    /// Write a descriptor back with every secret removed
    pub async fn save(&self, env: &str, config: &DeploymentConfig) -> Result<(), DeployError> {
        let file = self.descriptor_file(env)?;
        let mut stripped = config.clone();
        stripped.strip_secrets();
        file.write_json(&stripped).await?;
        info!("Saved descriptor {}", file.path().display());
        Ok(())
    }

    /// Write a starter descriptor. Refuses to overwrite unless `force` is set.
    pub async fn init_default(
        &self,
        env: &str,
        name: &str,
        force: bool,
    ) -> Result<PathBuf, DeployError> {
        let file = self.descriptor_file(env)?;
        if file.exists().await && !force {
            return Err(DeployError::ConfigError(format!(
                "{} already exists, use --force to overwrite",
                file.name()
            )));
        }
        self.save(env, &default_descriptor(env, name)).await?;
        Ok(file.path().to_path_buf())
    }
}

fn env_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(DESCRIPTOR_PREFIX)?
        .strip_suffix(DESCRIPTOR_SUFFIX)
        .filter(|env| validate_env_name(env).is_ok())
}

/// Environment names end up in file names, so no separators or traversal
pub fn validate_env_name(env: &str) -> Result<(), DeployError> {
    let valid = !env.is_empty()
        && env != "."
        && env != ".."
        && env
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !env.contains("..");
    if valid {
        Ok(())
    } else {
        Err(DeployError::ConfigError(format!(
            "Invalid environment name '{}'",
            env
        )))
    }
}

/// The descriptor `koram init` writes
pub fn default_descriptor(env: &str, name: &str) -> DeploymentConfig {
    let mut config = DeploymentConfig {
        name: name.to_string(),
        environment: Some(env.to_string()),
        build_env: Some(format!(".env.{}", env)),
        ..Default::default()
    };
    config.server.user = "root".to_string();
    config.deploy.path = format!("/var/www/{}", name);
    config.env.insert("PORT".to_string(), EnvValue::from("3000"));
    config
        .env
        .insert("NODE_ENV".to_string(), EnvValue::from("production"));
    config.processes.push(ProcessEntry {
        name: name.to_string(),
        command: format!("pm2 start .output/server/index.mjs --name {}", name),
        logs_path: None,
    });
    config
}

/// Command-line overrides, applied after credentials
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub alias: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
}

pub fn apply_overrides(config: &mut DeploymentConfig, overrides: &Overrides) {
    if let Some(host) = &overrides.host {
        config.server.host = host.clone();
    }
    if let Some(user) = &overrides.user {
        config.server.user = user.clone();
    }
    if let Some(path) = &overrides.path {
        config.deploy.path = path.clone();
    }
}

/// Merge stored credentials into the server block.
///
/// An alias must resolve. Without one, the `(user, host)` pair is looked up only
/// when the descriptor carries no password of its own.
pub async fn overlay_credentials(
    config: &mut DeploymentConfig,
    provider: &dyn CredentialProvider,
    alias: Option<&str>,
) -> Result<(), DeployError> {
    let query = match alias {
        Some(alias) => CredentialQuery::alias(alias),
        None if config.server.secret().is_none()
            && !config.server.host.is_empty()
            && !config.server.user.is_empty() =>
        {
            CredentialQuery::server(&config.server.user, &config.server.host)
        }
        None => return Ok(()),
    };

    match provider.resolve(&query).await? {
        Some(creds) => {
            debug!("Using stored credentials for {}@{}", creds.user, creds.host);
            config.server.host = creds.host;
            config.server.user = creds.user;
            if let Some(password) = creds.password {
                config.server.password = Some(password.expose_secret().to_string());
            }
            Ok(())
        }
        None if alias.is_some() => Err(DeployError::CredentialError(format!(
            "No stored credentials for alias '{}'",
            alias.unwrap_or_default()
        ))),
        None => Ok(()),
    }
}

/// Fields a deployment cannot start without
pub fn validate(config: &DeploymentConfig) -> Result<(), DeployError> {
    if config.server.host.trim().is_empty() {
        return Err(DeployError::ConfigError("server.host is not set".to_string()));
    }
    if config.server.user.trim().is_empty() {
        return Err(DeployError::ConfigError("server.user is not set".to_string()));
    }
    let path = config.deploy.path.trim();
    if path.is_empty() || path == "/" {
        return Err(DeployError::ConfigError(
            "deploy.path must be a directory other than /".to_string(),
        ));
    }
    Ok(())
}

/// Load, overlay credentials and overrides, then validate
pub async fn resolve_config(
    loader: &ConfigLoader,
    env: Option<&str>,
    provider: &dyn CredentialProvider,
    overrides: &Overrides,
) -> Result<(String, DeploymentConfig), DeployError> {
    let (env, mut config) = loader.load(env).await?;
    overlay_credentials(&mut config, provider, overrides.alias.as_deref()).await?;
    apply_overrides(&mut config, overrides);
    validate(&config)?;
    Ok((env, config))
}
