//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use graft_core::MessageFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the built-in engine to a master (started by the master itself)
    Remote {
        /// Wire encoding: json or cbor
        #[arg(long, value_name = "FORMAT", default_value = "cbor")]
        format: MessageFormat,

        /// Endpoint of the master, e.g. tcp://127.0.0.1:4000
        #[arg(long, value_name = "ADDRESS")]
        address: String,
    },

    /// Launch a remote, call one function and print the result
    Call {
        /// Function name; dotted names reach into namespaces
        name: String,

        /// Arguments as JSON literals; anything that is not JSON is passed as text
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Number of outputs to request (default: let the remote decide)
        #[arg(long, value_name = "N")]
        nargout: Option<i64>,

        /// Override the configured wire encoding
        #[arg(long, value_name = "FORMAT")]
        format: Option<MessageFormat>,
    },

    /// Launch a remote, evaluate code and print a global
    Get {
        /// Name of the global to print
        name: String,

        /// Code evaluated before reading the global
        #[arg(long, value_name = "CODE")]
        eval: Option<String>,

        /// Override the configured wire encoding
        #[arg(long, value_name = "FORMAT")]
        format: Option<MessageFormat>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Write a sample configuration file with every default spelled out
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH", default_value = "graft.yaml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
