//! Koram - Entry Point
//!
//! Developer CLI that builds a web project locally and deploys it to a remote
//! host over SSH.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use koram::app::options::{AppOptions, ServerOptions};
use koram::app::run::{run_dashboard, run_deploy, run_init, run_logs, run_ps};
use koram::config::loader::Overrides;
use koram::logs::{init_logging, LogLevel, LogOptions};
use koram::report::{ConsoleReporter, FanoutReporter, Reporter, TracingReporter};
use koram::utils::version_info;

#[derive(Debug, Parser)]
#[command(name = "koram", about = "Build locally, ship over SSH, reload remote processes")]
struct Cli {
    /// Project root
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// trace, debug, info, warn or error. RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: LogLevel,

    /// Emit diagnostic logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write daily log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default)]
struct TargetArgs {
    /// Environment name, selects `.koram-rc.<env>.json`
    env: Option<String>,

    /// Stored credential alias
    #[arg(long)]
    alias: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    user: Option<String>,

    /// Remote base path
    #[arg(long)]
    path: Option<String>,

    /// Do not source remote shell profiles
    #[arg(long)]
    no_profiles: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and deploy
    Deploy(TargetArgs),

    /// Serve the deploy dashboard
    Dashboard {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 4680)]
        port: u16,
    },

    /// Write a starter descriptor
    Init {
        #[arg(default_value = "production")]
        env: String,

        /// Project name, defaults to package.json name
        #[arg(long)]
        name: Option<String>,

        /// Overwrite an existing descriptor
        #[arg(long)]
        force: bool,
    },

    /// Show recent logs of a remote process
    Logs {
        process: String,

        #[arg(long, default_value_t = 100)]
        lines: u32,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// List pm2 processes on the server
    Ps(TargetArgs),

    /// Print version information
    Version,
}

impl TargetArgs {
    fn apply(self, options: &mut AppOptions) {
        options.environment = self.env;
        options.remote_profiles = !self.no_profiles;
        options.overrides = Overrides {
            alias: self.alias,
            host: self.host,
            user: self.user,
            path: self.path,
        };
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(LogOptions {
        log_level: cli.log.log_level.clone(),
        log_dir: cli.log.log_dir.clone(),
        json_format: cli.log.log_json,
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    let console: Arc<dyn Reporter> = Arc::new(
        FanoutReporter::new()
            .with(Arc::new(ConsoleReporter::new()))
            .with(Arc::new(TracingReporter)),
    );
    let mut options = AppOptions {
        project_root: cli.project.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Version => {
            println!("{}", serde_json::to_string_pretty(&version_info())?);
        }
        Commands::Deploy(target) => {
            target.apply(&mut options);
            let summary = run_deploy(options, console).await?;
            info!("Deploy finished: {:?}", summary);
            if !summary.failed_processes.is_empty() || !summary.failed_artifacts.is_empty() {
                anyhow::bail!(
                    "deployed with failures (artifacts: {:?}, processes: {:?})",
                    summary.failed_artifacts,
                    summary.failed_processes
                );
            }
        }
        Commands::Dashboard { host, port } => {
            options.server = ServerOptions { host, port };
            run_dashboard(options, await_shutdown_signal()).await?;
        }
        Commands::Init { env, name, force } => {
            options.environment = Some(env);
            let path = run_init(options, name, force).await?;
            console.success(&format!("Wrote {}", path.display()));
        }
        Commands::Logs {
            process,
            lines,
            target,
        } => {
            target.apply(&mut options);
            if let Err(e) = run_logs(options, &process, lines, console.clone()).await {
                error!("{}", e);
                console.error(&e.to_string());
                return Err(e.into());
            }
        }
        Commands::Ps(target) => {
            target.apply(&mut options);
            if let Err(e) = run_ps(options, console.clone()).await {
                error!("{}", e);
                console.error(&e.to_string());
                return Err(e.into());
            }
        }
    }

    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
