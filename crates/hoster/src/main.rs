use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{debug, info};

use hoster::api::{self, AppState};
use hoster::config::{self, AppConfig};
use hoster::placeholder;
use hoster::{APP_NAME, InstanceRegistry};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hoster - game server hosting backend.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output logs as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Write the default config and create instance directories
    Init(InitCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Write the placeholder server script into the default workspace and run it
    /// as that instance's executable
    #[arg(long)]
    with_placeholder: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
            Some(path) => {
                let expanded = config::expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => config::default_config_file()?,
        };
        let config = config::load_or_init_config(&config_file)?;

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            return;
        }

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{APP_NAME}={level},hoster_files={level},tower_http={level}"
            ))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> String {
        if self.common.trace {
            "trace".to_string()
        } else if self.common.debug {
            "debug".to_string()
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.clone(),
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            }
        }
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let registry = Arc::new(
        InstanceRegistry::from_config(&ctx.config).context("initializing server instances")?,
    );
    info!(
        "Managing {} instance(s): {}",
        registry.len(),
        registry.names().join(", ")
    );

    let state = AppState::new(registry.clone(), ctx.config.server.default_instance.clone());
    let app = api::create_router(state, ctx.config.max_upload_size());

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("Stopping managed servers...");
    registry.shutdown_all().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if !ctx.config_file.exists() {
        config::write_default_config(&ctx.config_file)?;
    }
    println!("Config: {}", ctx.config_file.display());

    let data_dir = ctx.config.data_dir()?;
    for (name, instance) in &ctx.config.instances {
        let workspace = instance.workspace_path(name, &data_dir)?;
        let backups = instance.backups_path(name, &data_dir)?;
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;
        std::fs::create_dir_all(&backups)
            .with_context(|| format!("creating backups directory {}", backups.display()))?;
        println!("Instance '{}': {}", name, workspace.display());

        if cmd.with_placeholder && *name == ctx.config.server.default_instance {
            let script = placeholder::write_placeholder(&workspace)?;
            config::set_instance_executable(
                &ctx.config_file,
                name,
                placeholder::PLACEHOLDER_FILE_NAME,
            )?;
            println!(
                "Placeholder server: {} (set as executable for '{}')",
                script.display(),
                name
            );
        }
    }

    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}
