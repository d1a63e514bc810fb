//! CLI argument parsing for jitprobe

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Output format for endpoint readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// `/proc`-style column text (default)
    Text,
    /// One JSON document per reading
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "jitprobe")]
#[command(version)]
#[command(
    about = "Probe busy-waits, sleeps, timers and tasklets for scheduling latency",
    long_about = None
)]
pub struct Cli {
    /// Load configuration from a TOML file (flags override it)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Delay selector duration in ticks (jitbusy, jitsched, jitqueue, jitschedto)
    #[arg(long = "delay", value_name = "TICKS")]
    pub delay: Option<u64>,

    /// Timer inter-fire delay in ticks (jitimer)
    #[arg(long = "tdelay", value_name = "TICKS")]
    pub tdelay: Option<u64>,

    /// Tick rate in ticks per second
    #[arg(long = "hz", value_name = "HZ")]
    pub hz: Option<u32>,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Number of consecutive reads of the endpoint
    #[arg(short = 'n', long = "count", value_name = "N", default_value = "1")]
    pub count: u32,

    /// List the available endpoints and exit
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Endpoint to read (e.g. jitbusy, jitimer, /proc/currentime)
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_endpoint() {
        let cli = Cli::parse_from(["jitprobe", "jitimer"]);
        assert_eq!(cli.endpoint.as_deref(), Some("jitimer"));
    }

    #[test]
    fn test_cli_empty_without_endpoint() {
        let cli = Cli::parse_from(["jitprobe"]);
        assert!(cli.endpoint.is_none());
        assert!(!cli.list);
    }

    #[test]
    fn test_cli_delay_overrides() {
        let cli = Cli::parse_from([
            "jitprobe", "--delay", "250", "--tdelay", "3", "--hz", "1000", "jitbusy",
        ]);
        assert_eq!(cli.delay, Some(250));
        assert_eq!(cli.tdelay, Some(3));
        assert_eq!(cli.hz, Some(1000));
    }

    #[test]
    fn test_cli_delay_defaults_unset() {
        let cli = Cli::parse_from(["jitprobe", "jitbusy"]);
        assert!(cli.delay.is_none());
        assert!(cli.tdelay.is_none());
        assert!(cli.hz.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_count_default() {
        let cli = Cli::parse_from(["jitprobe", "currentime"]);
        assert_eq!(cli.count, 1);
    }

    #[test]
    fn test_cli_count_short_flag() {
        let cli = Cli::parse_from(["jitprobe", "-n", "5", "jitsched"]);
        assert_eq!(cli.count, 5);
    }

    #[test]
    fn test_cli_format_json() {
        let cli = Cli::parse_from(["jitprobe", "--format", "json", "jitasklet"]);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_format_default_text() {
        let cli = Cli::parse_from(["jitprobe", "jitasklet"]);
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_cli_list_flag() {
        let cli = Cli::parse_from(["jitprobe", "--list"]);
        assert!(cli.list);
    }

    #[test]
    fn test_cli_debug_flag() {
        let cli = Cli::parse_from(["jitprobe", "--debug", "jitbusy"]);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_config_path() {
        let cli = Cli::parse_from(["jitprobe", "--config", "/etc/jit.toml", "jitbusy"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/jit.toml")));
    }

    #[test]
    fn test_cli_invalid_format_rejected() {
        let result = Cli::try_parse_from(["jitprobe", "--format", "xml", "jitbusy"]);
        assert!(result.is_err());
    }
}
