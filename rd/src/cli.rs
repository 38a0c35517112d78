//! CLI definitions for the server binary

use clap::Parser;
use std::path::PathBuf;

/// Ralpher - Ralph loop orchestrator daemon
#[derive(Debug, Parser)]
#[command(name = "rd", about = "Ralph loop orchestrator daemon", version)]
pub struct Cli {
    /// Path to a YAML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (silly, trace, debug, info, warn, error, fatal)
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Data directory override
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["rd"]);
        assert!(cli.config.is_none());
        assert!(cli.log_level.is_none());
        assert!(cli.data_dir.is_none());
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["rd", "-l", "debug", "--data-dir", "/srv/ralpher"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/ralpher")));
    }
}
