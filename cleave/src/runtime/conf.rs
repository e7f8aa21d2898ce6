//! Configuration model and loading.
//!
//! Precedence, lowest to highest: built-in defaults, the YAML config file,
//! CLI flags (which themselves fall back to `CLEAVE_*` environment
//! variables).

use std::time::Duration;

use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::adapter::{DivertOpts, NfqueueOpts, WinDivertOpts};
use crate::cli::Cli;
use crate::runtime::conf_serde::{duration, level};

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod defaults {
    use std::time::Duration;

    pub fn split_chunk() -> usize {
        5
    }

    pub fn collect_timeout() -> Duration {
        Duration::from_millis(250)
    }

    pub fn max_buffer_bytes() -> usize {
        64 * 1024
    }

    pub fn max_held_packets() -> usize {
        32
    }

    pub fn max_segment_payload() -> usize {
        1460
    }

    pub fn workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn worker_queue_size() -> usize {
        1024
    }

    pub fn flow_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn gc_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub fn max_flows_per_worker() -> usize {
        4096
    }

    pub fn max_bytes_per_worker() -> u64 {
        64 * 1024 * 1024
    }

    pub fn shutdown_fail_open_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn shutdown_fail_open_max_packets() -> usize {
        200_000
    }

    pub fn adapter_flush_timeout() -> Duration {
        Duration::from_secs(2)
    }
}

/// When a collecting flow is considered splittable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitMode {
    /// Split as soon as the first payload's worth of bytes is contiguous.
    Immediate,
    /// Wait for a complete TLS `ClientHello` record.
    #[default]
    TlsHello,
}

impl std::fmt::Display for SplitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitMode::Immediate => f.write_str("immediate"),
            SplitMode::TlsHello => f.write_str("tls-hello"),
        }
    }
}

/// Engine and worker tunables. Every field has a default; a missing config
/// file yields a fully usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConf {
    pub split_mode: SplitMode,
    /// Bytes in the first fabricated split segment.
    pub split_chunk: usize,
    /// Per-flow collection deadline.
    #[serde(with = "duration")]
    pub collect_timeout: Duration,
    /// Reassembly window per flow.
    pub max_buffer_bytes: usize,
    /// Per-flow cap on held packets.
    pub max_held_packets: usize,
    /// Cap on bytes per fabricated segment (0 = unlimited).
    pub max_segment_payload: usize,
    pub workers: usize,
    pub worker_queue_size: usize,
    #[serde(with = "duration")]
    pub flow_idle_timeout: Duration,
    #[serde(with = "duration")]
    pub gc_interval: Duration,
    pub max_flows_per_worker: usize,
    pub max_reassembly_bytes_per_worker: u64,
    pub max_held_bytes_per_worker: u64,
    #[serde(with = "duration")]
    pub shutdown_fail_open_timeout: Duration,
    pub shutdown_fail_open_max_packets: usize,
    #[serde(with = "duration")]
    pub adapter_flush_timeout: Duration,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            split_mode: SplitMode::default(),
            split_chunk: defaults::split_chunk(),
            collect_timeout: defaults::collect_timeout(),
            max_buffer_bytes: defaults::max_buffer_bytes(),
            max_held_packets: defaults::max_held_packets(),
            max_segment_payload: defaults::max_segment_payload(),
            workers: defaults::workers(),
            worker_queue_size: defaults::worker_queue_size(),
            flow_idle_timeout: defaults::flow_idle_timeout(),
            gc_interval: defaults::gc_interval(),
            max_flows_per_worker: defaults::max_flows_per_worker(),
            max_reassembly_bytes_per_worker: defaults::max_bytes_per_worker(),
            max_held_bytes_per_worker: defaults::max_bytes_per_worker(),
            shutdown_fail_open_timeout: defaults::shutdown_fail_open_timeout(),
            shutdown_fail_open_max_packets: defaults::shutdown_fail_open_max_packets(),
            adapter_flush_timeout: defaults::adapter_flush_timeout(),
        }
    }
}

impl EngineConf {
    pub fn validate(&self) -> Result<(), ConfError> {
        if self.split_chunk < 1 {
            return Err(ConfError::Invalid("split_chunk must be >= 1".into()));
        }
        if self.max_buffer_bytes < 1 {
            return Err(ConfError::Invalid("max_buffer_bytes must be >= 1".into()));
        }
        if self.max_held_packets < 1 {
            return Err(ConfError::Invalid("max_held_packets must be >= 1".into()));
        }
        if self.collect_timeout < Duration::from_millis(1) {
            return Err(ConfError::Invalid("collect_timeout must be >= 1ms".into()));
        }
        if self.workers < 1 {
            return Err(ConfError::Invalid("workers must be >= 1".into()));
        }
        if self.worker_queue_size < 1 {
            return Err(ConfError::Invalid("worker_queue_size must be >= 1".into()));
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    #[serde(with = "level")]
    pub log_level: Level,
    /// Reload the configuration when the file changes on disk.
    pub auto_reload: bool,
    pub engine: EngineConf,
    /// Capture backend parameters; only the section matching the built-in
    /// backend is consulted.
    pub nfqueue: NfqueueOpts,
    pub windivert: WinDivertOpts,
    pub divert: DivertOpts,
}

// Hand-written because `tracing::Level` has no `Default`.
impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            auto_reload: false,
            engine: EngineConf::default(),
            nfqueue: NfqueueOpts::default(),
            windivert: WinDivertOpts::default(),
            divert: DivertOpts::default(),
        }
    }
}

impl Conf {
    /// Merge defaults, the optional YAML file, and CLI values, then
    /// validate.
    pub fn load(cli: &Cli) -> Result<Self, ConfError> {
        let mut figment = Figment::from(Serialized::defaults(Conf::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Serialized::defaults(cli));

        let conf: Conf = figment.extract().map_err(Box::new)?;
        conf.engine.validate()?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let conf = EngineConf::default();
        assert_eq!(conf.split_mode, SplitMode::TlsHello);
        assert_eq!(conf.split_chunk, 5);
        assert_eq!(conf.collect_timeout, Duration::from_millis(250));
        assert_eq!(conf.max_buffer_bytes, 65536);
        assert_eq!(conf.max_held_packets, 32);
        assert_eq!(conf.max_segment_payload, 1460);
        assert!(conf.workers >= 1);
        assert_eq!(conf.worker_queue_size, 1024);
        assert_eq!(conf.flow_idle_timeout, Duration::from_secs(30));
        assert_eq!(conf.gc_interval, Duration::from_secs(5));
        assert_eq!(conf.max_flows_per_worker, 4096);
        assert_eq!(conf.max_reassembly_bytes_per_worker, 64 * 1024 * 1024);
        assert_eq!(conf.max_held_bytes_per_worker, 64 * 1024 * 1024);
        assert_eq!(conf.shutdown_fail_open_timeout, Duration::from_secs(5));
        assert_eq!(conf.shutdown_fail_open_max_packets, 200_000);
        assert_eq!(conf.adapter_flush_timeout, Duration::from_secs(2));
        conf.validate().unwrap();
    }

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleave.yaml");
        std::fs::write(
            &path,
            "log_level: debug\nengine:\n  split_mode: immediate\n  split_chunk: 3\n  collect_timeout: 100ms\nnfqueue:\n  queue_num: 7\n",
        )
        .unwrap();

        let cli = Cli::parse_from(["cleave", "--config", path.to_str().unwrap()]);
        let conf = Conf::load(&cli).unwrap();
        assert_eq!(conf.engine.split_mode, SplitMode::Immediate);
        assert_eq!(conf.engine.split_chunk, 3);
        assert_eq!(conf.engine.collect_timeout, Duration::from_millis(100));
        assert_eq!(conf.nfqueue.queue_num, 7);
        // Untouched fields keep their defaults.
        assert_eq!(conf.engine.max_held_packets, 32);
    }

    #[test]
    fn invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleave.yaml");
        std::fs::write(&path, "engine:\n  split_chunk: 0\n").unwrap();

        let cli = Cli::parse_from(["cleave", "--config", path.to_str().unwrap()]);
        assert!(matches!(Conf::load(&cli), Err(ConfError::Invalid(_))));
    }

    #[test]
    fn unknown_engine_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleave.yaml");
        std::fs::write(&path, "engine:\n  split_chnk: 5\n").unwrap();

        let cli = Cli::parse_from(["cleave", "--config", path.to_str().unwrap()]);
        assert!(Conf::load(&cli).is_err());
    }

    #[test]
    fn split_mode_display() {
        assert_eq!(SplitMode::Immediate.to_string(), "immediate");
        assert_eq!(SplitMode::TlsHello.to_string(), "tls-hello");
    }
}
