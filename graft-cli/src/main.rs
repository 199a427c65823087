use anyhow::{Context, Result};
use clap::Parser;
use graft_config::{ConfigLoader, GraftConfig};
use graft_core::{MessageFormat, Value};
use graft_ipc::{CallTarget, AUTO_NARGOUT};
use graft_logging::{init_logging_from_config, init_remote_tracing, init_simple_tracing};
use graft_master::{MasterKwargs, MasterValue, Session};
use graft_remote::BuiltinEngine;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod cli;
mod values;

use cli::{Cli, Commands, ConfigCommands};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<GraftConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

/// Serve the built-in engine to the master at `address`
async fn remote_command(format: MessageFormat, address: &str) -> Result<()> {
    info!(%format, %address, "Starting remote engine");
    graft_remote::run(BuiltinEngine::new(), address, format)
        .await
        .context(format!("Remote engine for {} failed", address))?;
    info!("Remote engine shut down");
    Ok(())
}

/// Launch the configured remote, optionally with another wire encoding
async fn start_session(config: &GraftConfig, format: Option<MessageFormat>) -> Result<Session> {
    let mut session_config = config.session.clone();
    if let Some(format) = format {
        session_config.message_format = format;
    }
    info!(
        executable = %session_config.executable,
        format = %session_config.message_format,
        "Starting session"
    );
    Session::launch(session_config)
        .await
        .context("Failed to start the remote engine")
}

/// Turn Ctrl-C into an interrupt of the call in flight
fn forward_interrupts(session: &Session) -> Option<JoinHandle<()>> {
    if !session.config().forward_interrupts {
        return None;
    }
    let handle = session.interrupt_handle();
    Some(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt requested, forwarding to the remote");
            handle.interrupt();
        }
    }))
}

/// Run `work` against a fresh session, then shut the session down
/// whether or not `work` succeeded
async fn with_session<F, Fut>(config: &GraftConfig, format: Option<MessageFormat>, work: F) -> Result<()>
where
    F: FnOnce(Session) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let session = start_session(config, format).await?;
    let watcher = forward_interrupts(&session);

    let result = work(session.clone()).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    session.close().await;
    result
}

async fn call_command(session: Session, name: &str, args: &[String], nargout: Option<i64>) -> Result<()> {
    let args = args
        .iter()
        .map(|arg| values::parse_argument(arg))
        .collect::<Result<Vec<_>>>()?;
    let nargout = nargout.unwrap_or(AUTO_NARGOUT);

    let value = session
        .call_with(CallTarget::from(name), args, MasterKwargs::new(), nargout)
        .await
        .context(format!("Call to {} failed", name))?;

    if nargout > 1 {
        for output in value.into_outputs() {
            print_value(&output).await?;
        }
        Ok(())
    } else {
        print_value(&value).await
    }
}

async fn get_command(session: Session, name: &str, code: Option<&str>) -> Result<()> {
    if let Some(code) = code {
        session
            .call("eval", vec![Value::from(code)])
            .await
            .context("Evaluation failed")?;
    }
    let value = session
        .get_global(name)
        .await
        .context(format!("Failed to read {}", name))?;
    print_value(&value).await
}

/// Print a value; objects are shown the way the remote displays them
async fn print_value(value: &MasterValue) -> Result<()> {
    match value {
        Value::Object(object) => {
            let shown = object
                .render()
                .await
                .context("Failed to display remote object")?;
            println!("{}", shown.trim_end());
        }
        Value::Null => {}
        other => println!("{}", values::describe(other)),
    }
    Ok(())
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("Configuration file is valid");
            info!("Configuration validation passed");
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            error!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<()> {
    info!("Generating configuration at: {:?}", output);

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create directory {:?}", parent))?;
    }

    std::fs::write(output, GraftConfig::generate_sample())
        .context(format!("Failed to write configuration to {:?}", output))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Handle configuration display
fn handle_config_show(config: &GraftConfig, format: &str) -> Result<()> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output =
                serde_yaml::to_string(config).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output =
                serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The remote's stdout belongs to the master, so it gets its own stderr-only setup
    if let Commands::Remote { format, address } = &cli.command {
        init_remote_tracing(cli.log_level.as_deref())?;
        return remote_command(*format, address).await;
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.log_level.as_deref() {
        Some(level) => init_simple_tracing(level)?,
        None => init_logging_from_config(&config.logging)?,
    }

    match &cli.command {
        Commands::Remote { .. } => Ok(()),
        Commands::Call {
            name,
            args,
            nargout,
            format,
        } => {
            with_session(&config, *format, |session| async move {
                call_command(session, name, args, *nargout).await
            })
            .await
        }
        Commands::Get { name, eval, format } => {
            with_session(&config, *format, |session| async move {
                get_command(session, name, eval.as_deref()).await
            })
            .await
        }
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
            ConfigCommands::Show { format } => handle_config_show(&config, format),
        },
    }
}
