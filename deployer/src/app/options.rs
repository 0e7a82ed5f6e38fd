//! Application configuration options

use std::path::PathBuf;

use crate::config::loader::Overrides;
use crate::credentials::FileCredentialProvider;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Project root holding the descriptors and the build
    pub project_root: PathBuf,

    /// Explicit environment name, e.g. `production`
    pub environment: Option<String>,

    /// Credential alias and command-line overrides
    pub overrides: Overrides,

    /// Credential store
    pub credentials_file: PathBuf,

    /// Source remote shell profiles before remote commands
    pub remote_profiles: bool,

    /// Dashboard server configuration
    pub server: ServerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            environment: None,
            overrides: Overrides::default(),
            credentials_file: FileCredentialProvider::default_path(),
            remote_profiles: true,
            server: ServerOptions::default(),
        }
    }
}

/// Dashboard server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4680,
        }
    }
}
