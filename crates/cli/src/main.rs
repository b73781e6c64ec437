mod auth_commands;
mod config_commands;
mod sandbox_commands;
mod session_commands;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use {
    clap::{Parser, Subcommand},
    clawgate_config::{
        ClawgateConfig, ConfigError, ConfigSource, ConfigStore, FileSource, load_config,
        resolve_config_path,
    },
    clawgate_gateway::{GatewayError, GatewayOptions, GatewayServer, LogLevelHook, exit_codes},
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "clawgate", version, about = "clawgate: multi-agent gateway control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (json5, json, toml or yaml). Defaults to discovery.
    #[arg(long, global = true, env = "CLAWGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter (trace, debug, info, warn, error). Overrides `logging.level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Listen address, overriding `gateway.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Listen port, overriding `gateway.port`.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Sandbox diagnostics.
    Sandbox {
        #[command(subcommand)]
        action: sandbox_commands::SandboxAction,
    },
    /// Auth profile management.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
    /// Session inspection.
    Sessions {
        #[command(subcommand)]
        action: session_commands::SessionAction,
    },
}

// ── Telemetry ────────────────────────────────────────────────────────────────

/// Install the subscriber. The returned hook swaps the level filter at
/// runtime; it is a no-op when `RUST_LOG` is set.
fn init_telemetry(cli: &Cli) -> LogLevelHook {
    let from_env = EnvFilter::try_from_default_env().ok();
    let env_pinned = from_env.is_some();
    let filter = from_env.unwrap_or_else(|| {
        EnvFilter::try_new(cli.log_level.as_deref().unwrap_or("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let (filter, handle) = reload::Layer::new(filter);

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let cli_pinned = cli.log_level.is_some();
    Arc::new(move |level: &str| {
        if env_pinned || cli_pinned {
            return Ok(());
        }
        handle.reload(EnvFilter::try_new(level)?)?;
        info!(level, "log level changed");
        Ok(())
    })
}

// ── Config loading ───────────────────────────────────────────────────────────

/// A file source with `--bind`/`--port` layered on top, so reloads keep them.
struct OverrideSource {
    file: FileSource,
    bind: Option<String>,
    port: Option<u16>,
}

impl ConfigSource for OverrideSource {
    fn load(&self) -> Result<ClawgateConfig, ConfigError> {
        let mut cfg = self.file.load()?;
        apply_overrides(&mut cfg, self.bind.as_deref(), self.port);
        Ok(cfg)
    }

    fn path(&self) -> Option<&Path> {
        self.file.path()
    }
}

fn apply_overrides(cfg: &mut ClawgateConfig, bind: Option<&str>, port: Option<u16>) {
    if let Some(bind) = bind {
        cfg.gateway.bind = bind.to_string();
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }
}

/// The validated config the command runs against. No file means defaults.
pub(crate) fn load_snapshot(explicit: Option<&Path>) -> Result<ClawgateConfig, ConfigError> {
    match resolve_config_path(explicit) {
        Some(path) => {
            let cfg = load_config(&path)?;
            clawgate_config::validate(&cfg)?;
            Ok(cfg)
        },
        None => Ok(ClawgateConfig::default()),
    }
}

fn open_store(
    explicit: Option<&Path>,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<ConfigStore, ConfigError> {
    match resolve_config_path(explicit) {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            ConfigStore::open(Arc::new(OverrideSource {
                file: FileSource::new(path),
                bind,
                port,
            }))
        },
        None => {
            info!("no config file found, using defaults");
            let mut cfg = ClawgateConfig::default();
            apply_overrides(&mut cfg, bind.as_deref(), port);
            clawgate_config::validate(&cfg)?;
            Ok(ConfigStore::new(cfg, None))
        },
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────────

async fn run_gateway(
    config: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    hook: LogLevelHook,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(config.as_deref(), bind, port)?);
    if let Err(e) = hook(&store.snapshot().logging.level) {
        warn!(error = %e, "configured log level not applied");
    }

    let server = GatewayServer::new(store, GatewayOptions {
        log_level_hook: Some(hook),
        ..Default::default()
    });
    let stop = server.stop_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        stop.cancel();
    });
    server.run().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<GatewayError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return exit_codes::CONFIG_INVALID;
    }
    exit_codes::FATAL
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let hook = init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "clawgate starting");

    let config = cli.config.clone();
    let result = match cli.command {
        Commands::Gateway { bind, port } => run_gateway(config, bind, port, hook).await,
        Commands::Config { action } => config_commands::handle_config(action, config.as_deref()).await,
        Commands::Sandbox { action } => {
            sandbox_commands::handle_sandbox(action, config.as_deref()).await
        },
        Commands::Auth { action } => auth_commands::handle_auth(action, config.as_deref()).await,
        Commands::Sessions { action } => {
            session_commands::handle_sessions(action, config.as_deref()).await
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            error!(error = %format!("{e:#}"), code, "clawgate exiting");
            eprintln!("error: {e:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, clawgate_gateway::LockError};

    #[test]
    fn overrides_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clawgate.json");
        std::fs::write(&path, r#"{ "gateway": { "port": 20000 } }"#).unwrap();
        let source = OverrideSource {
            file: FileSource::new(&path),
            bind: Some("0.0.0.0".into()),
            port: Some(21000),
        };
        let cfg = source.load().unwrap();
        assert_eq!(cfg.gateway.port, 21000);
        assert_eq!(cfg.gateway.bind, "0.0.0.0");
        assert_eq!(source.path(), Some(path.as_path()));
    }

    #[test]
    fn exit_codes_follow_the_error() {
        let held = anyhow::Error::new(GatewayError::Lock(LockError::Held {
            addr: "127.0.0.1:1".into(),
        }));
        assert_eq!(exit_code_for(&held), exit_codes::LOCK_HELD);

        let invalid = anyhow::Error::new(ConfigError::Invalid(Vec::new()));
        assert_eq!(exit_code_for(&invalid), exit_codes::CONFIG_INVALID);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::FATAL);
    }

    #[test]
    fn cli_parses_gateway_overrides() {
        let cli = Cli::try_parse_from(["clawgate", "gateway", "--port", "19000"]).unwrap();
        match cli.command {
            Commands::Gateway { bind, port } => {
                assert_eq!(bind, None);
                assert_eq!(port, Some(19000));
            },
            _ => panic!("expected gateway"),
        }
    }
}
