use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use report_embed_core::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "report-embed",
    about = "Diagnostics for embedded analytics reports",
    author,
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "REPORT_EMBED_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "REPORT_EMBED_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate an embed URL and print the result as JSON.
    CheckUrl {
        url: String,
        /// Host suffix the URL is expected to resolve to.
        #[arg(long)]
        host_suffix: Option<String>,
    },
    /// Request an embed token and print a redacted diagnostics record.
    FetchToken {
        #[arg(long)]
        report: String,
        #[arg(long)]
        dataset: String,
        /// Token service base URL; defaults to REPORT_EMBED_TOKEN_BASE.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// List dashboards from a catalog file.
    Catalog {
        #[arg(long)]
        file: PathBuf,
        /// Only show dashboards this user may open.
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        json: bool,
    },
}
