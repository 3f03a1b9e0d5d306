//! Common command-line arguments for service binaries

use std::path::PathBuf;

use clap::Args;

/// Service startup arguments shared by every binary
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Configuration file
    #[arg(short = 'c', long, default_value = "config/hpsrv.yaml", env = "HPSRV_CONFIG")]
    pub config: PathBuf,

    /// Disable colored output (useful for log files)
    #[arg(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            config: PathBuf::from("config/hpsrv.yaml"),
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level
    pub fn parse_log_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
