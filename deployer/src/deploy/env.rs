//! Command environment resolution
//!
//! Commands are turned into a fully resolved invocation before they run, so
//! call sites never concatenate `source` directives themselves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tokio::process::Command;

use crate::config::descriptor::EnvValue;
use crate::utils::shell_quote;

/// A program, its arguments and the variables to set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ResolvedCommand {
    /// A tokio command ready to spawn in `cwd`
    pub fn to_command(&self, cwd: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).current_dir(cwd);
        command
    }
}

/// Strategy turning a shell command line into a [`ResolvedCommand`]
pub trait ShellEnvironment: Send + Sync {
    fn resolve(&self, command: &str) -> ResolvedCommand;
}

/// Login-like shell on Unix workstations.
///
/// Sources the user's profile and version-manager loaders, and puts the
/// project's `node_modules/.bin` first on `PATH`.
#[derive(Debug, Clone)]
pub struct ProfileShell {
    shell: String,
    home: Option<PathBuf>,
}

impl ProfileShell {
    pub fn new(shell: impl Into<String>, home: Option<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            home,
        }
    }

    /// `$SHELL`, falling back to `/bin/sh`
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self::new(shell, dirs::home_dir())
    }

    fn profiles(&self) -> Vec<PathBuf> {
        let Some(home) = &self.home else {
            return Vec::new();
        };
        let rc = if self.shell.ends_with("zsh") {
            Some(".zshrc")
        } else if self.shell.ends_with("bash") {
            Some(".bashrc")
        } else {
            None
        };
        rc.into_iter()
            .chain([".profile", ".nvm/nvm.sh"])
            .map(|f| home.join(f))
            .collect()
    }

    /// Shell prelude sourcing every existing profile, errors silenced
    pub fn prelude(&self) -> String {
        self.profiles()
            .iter()
            .map(|p| {
                let p = shell_quote(&p.to_string_lossy());
                format!("[ -f {p} ] && . {p} >/dev/null 2>&1;")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ShellEnvironment for ProfileShell {
    fn resolve(&self, command: &str) -> ResolvedCommand {
        let prelude = self.prelude();
        let line = if prelude.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", prelude, command)
        };

        let mut env = BTreeMap::new();
        let path = std::env::var("PATH").unwrap_or_default();
        env.insert("PATH".to_string(), format!("./node_modules/.bin:{}", path));

        ResolvedCommand {
            program: self.shell.clone(),
            args: vec!["-c".to_string(), line],
            env,
        }
    }
}

/// The platform shell with no loaders
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainShell;

impl ShellEnvironment for PlainShell {
    fn resolve(&self, command: &str) -> ResolvedCommand {
        let (program, flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        ResolvedCommand {
            program: program.to_string(),
            args: vec![flag.to_string(), command.to_string()],
            env: BTreeMap::new(),
        }
    }
}

/// Environment used for local builds on this platform
pub fn local_environment() -> Box<dyn ShellEnvironment> {
    if cfg!(unix) {
        Box::new(ProfileShell::from_env())
    } else {
        Box::new(PlainShell)
    }
}

const REMOTE_PATH: &str =
    "export PATH=\"$HOME/.local/bin:$HOME/bin:/usr/local/bin:/usr/bin:/bin:$PATH\"";

const REMOTE_PROFILES: [&str; 3] = ["~/.profile", "~/.bashrc", "~/.nvm/nvm.sh"];

/// Prefix for remote commands.
///
/// Exports a usable `PATH`, sources the remote profiles, exports the
/// deployment env and runs the pre-deploy commands before the command itself.
/// Pre-deploy failures do not stop the command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteLoader {
    prelude: Vec<String>,
}

impl RemoteLoader {
    /// A loader that leaves commands untouched
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn new(env: &IndexMap<String, EnvValue>, pre_deploy: &[String], profiles: bool) -> Self {
        let mut prelude = Vec::new();
        if profiles {
            prelude.push(REMOTE_PATH.to_string());
            for profile in REMOTE_PROFILES {
                prelude.push(format!("[ -f {p} ] && . {p} >/dev/null 2>&1", p = profile));
            }
        }
        for (key, value) in env {
            if is_env_key(key) {
                prelude.push(format!("export {}={}", key, shell_quote(&value.to_string())));
            }
        }
        prelude.extend(pre_deploy.iter().filter(|c| !c.trim().is_empty()).cloned());
        Self { prelude }
    }

    pub fn is_plain(&self) -> bool {
        self.prelude.is_empty()
    }

    pub fn wrap(&self, command: &str) -> String {
        if self.prelude.is_empty() {
            return command.to_string();
        }
        format!("{}; {}", self.prelude.join("; "), command)
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
