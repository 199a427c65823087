use anyhow::Result;
use graft_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from configuration.
///
/// Everything goes to stderr so that command output on stdout stays clean.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = env_filter(config.level.as_str());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // Use try_init to avoid panic if global subscriber already set
    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing inside a remote engine process.
///
/// The remote's stdout is echoed by the master as program output, so logs
/// must stay on stderr and carry no terminal colours.
pub fn init_remote_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", level);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    tracing::debug!(pid = std::process::id(), "Remote tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialisation_is_harmless() {
        init_simple_tracing("debug").unwrap();
        init_simple_tracing("not a level ((").unwrap();
        init_remote_tracing(Some("trace")).unwrap();
        init_logging_from_config(&LoggingConfig {
            format: LogFormat::Json,
            include_location: true,
            ..Default::default()
        })
        .unwrap();
    }
}
