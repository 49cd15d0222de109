//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Pulse control plane - fleet auth, node enrollment and agent distribution
#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PULSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PULSE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "PULSE_HOST")]
    pub host: Option<String>,

    /// Data directory for persisted state
    #[arg(long, env = "PULSE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PULSE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PULSE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
