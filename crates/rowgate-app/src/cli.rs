//! Command-line definition for the `rowgate` binary.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "rowgate",
    about = "Rowgate is a single-binary configurable API server.",
    disable_version_flag = true
)]
pub struct Cli {
    /// Show version and exit.
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Only check if the config file is valid.
    #[arg(short = 'c', long)]
    pub check: bool,

    /// Print logs in text or json format.
    #[arg(short = 'l', long = "logtype", value_enum, default_value_t = LogType::Text)]
    pub logtype: LogType,

    /// Do not colorize log output.
    #[arg(long = "no-color")]
    pub no_color: bool,

    /// The config file is in YAML format.
    #[arg(short = 'y', long)]
    pub yaml: bool,

    /// Path to the configuration document.
    #[arg(value_name = "config-file", required_unless_present = "version")]
    pub config_file: Option<PathBuf>,
}

/// Log output formats selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogType {
    /// Human-readable output.
    Text,
    /// One JSON object per log event.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_invocations() {
        let cli = Cli::try_parse_from(["rowgate", "api.json"]).expect("config file only");
        assert!(!cli.check);
        assert_eq!(cli.logtype, LogType::Text);
        assert_eq!(cli.config_file.as_deref(), Some(std::path::Path::new("api.json")));

        let cli = Cli::try_parse_from(["rowgate", "--check", "--yaml", "api.yaml"])
            .expect("check mode");
        assert!(cli.check);
        assert!(cli.yaml);

        let cli = Cli::try_parse_from(["rowgate", "-v"]).expect("version without file");
        assert!(cli.version);
        assert!(cli.config_file.is_none());

        let cli = Cli::try_parse_from(["rowgate", "--logtype", "json", "--no-color", "api.json"])
            .expect("log options");
        assert_eq!(cli.logtype, LogType::Json);
        assert!(cli.no_color);
    }

    #[test]
    fn config_file_is_required_without_version() {
        assert!(Cli::try_parse_from(["rowgate"]).is_err());
        assert!(Cli::try_parse_from(["rowgate", "--logtype", "xml", "api.json"]).is_err());
    }
}
