use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "cleave.yaml").
    #[arg(short, long, value_name = "FILE", env = "CLEAVE_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Automatically reload the configuration file when it changes.
    #[arg(
        short,
        long,
        env = "CLEAVE_CONFIG_AUTO_RELOAD",
        default_value = "false"
    )]
    pub auto_reload: bool,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "CLEAVE_LOG_LEVEL",
        default_value = "info"
    )]
    #[serde(with = "level_serde")]
    pub log_level: Level,
}

mod level_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Level>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        let args = [
            "cleave",
            "--config",
            "/path/to/cleave.yaml",
            "--auto-reload",
            "--log-level",
            "warn",
        ];
        let cli = Cli::parse_from(args);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/cleave.yaml")));
        assert!(cli.auto_reload);
        assert_eq!(cli.log_level, Level::WARN);
    }

    #[test]
    fn defaults_without_flags() {
        // Environment fallbacks are not exercised here; mutating the
        // process environment races with parallel tests.
        let cli = Cli::parse_from(["cleave"]);
        assert_eq!(cli.config, None);
        assert!(!cli.auto_reload);
        assert_eq!(cli.log_level, Level::INFO);
    }
}
