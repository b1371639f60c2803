//! Runtime configuration file (external collaborator, §6).
//!
//! A JSON document read once at initialization. Unknown keys are ignored;
//! missing or malformed fields fall back to defaults; the file is capped at
//! 1 MiB.

#[cfg(feature = "config")]
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// `channel.metrics.*` section of the runtime configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Minimum total send+recv delta before an event is considered for
    /// emission.
    pub emit_min_ops: u64,
    /// Minimum elapsed time since the last emit before an event is
    /// considered for emission. Either threshold being met triggers
    /// emission.
    pub emit_min_ms: u64,
    /// Allocate a metrics pipe for every channel at creation.
    pub auto_enable: bool,
    /// Buffered capacity of an auto-created metrics pipe. Overflow silently
    /// drops events.
    pub pipe_capacity: usize,
}

impl MetricsConfig {
    pub fn emit_min_elapsed(&self) -> Duration {
        Duration::from_millis(self.emit_min_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            emit_min_ops: 1024,
            emit_min_ms: 50,
            auto_enable: false,
            pipe_capacity: 64,
        }
    }
}

/// Top-level runtime configuration. Presently only the `channel.metrics`
/// section is recognized; everything else in the document is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    pub metrics: MetricsConfig,
}

#[cfg(feature = "config")]
#[derive(Debug, Deserialize, Default)]
struct RawRoot {
    #[serde(default)]
    channel: RawChannel,
}

#[cfg(feature = "config")]
#[derive(Debug, Deserialize, Default)]
struct RawChannel {
    #[serde(default)]
    metrics: RawMetrics,
}

#[cfg(feature = "config")]
#[derive(Debug, Deserialize, Default)]
struct RawMetrics {
    emit_min_ops: Option<u64>,
    emit_min_ms: Option<u64>,
    auto_enable: Option<bool>,
    pipe_capacity: Option<usize>,
}

impl RuntimeConfig {
    /// Load from a file on disk. Any failure (missing file, malformed JSON,
    /// oversize file) logs a warning and falls back to [`RuntimeConfig::default`]
    /// rather than propagating an error -- the loader is best-effort, never a
    /// hard dependency of startup.
    pub fn load(path: impl AsRef<Path>) -> RuntimeConfig {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > MAX_CONFIG_BYTES => {
                log::warn!(
                    "runtime config {} exceeds {} bytes, using defaults",
                    path.display(),
                    MAX_CONFIG_BYTES
                );
                RuntimeConfig::default()
            }
            Ok(_) => match std::fs::read_to_string(path) {
                Ok(body) => Self::from_json_str(&body),
                Err(err) => {
                    log::warn!("failed to read runtime config {}: {}", path.display(), err);
                    RuntimeConfig::default()
                }
            },
            Err(_) => RuntimeConfig::default(),
        }
    }

    /// Parse from an in-memory JSON document, falling back to defaults field
    /// by field on malformed input.
    #[cfg(feature = "config")]
    pub fn from_json_str(body: &str) -> RuntimeConfig {
        let raw: RawRoot = match serde_json::from_str(body) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("malformed runtime config, using defaults: {}", err);
                return RuntimeConfig::default();
            }
        };

        let defaults = MetricsConfig::default();
        let m = raw.channel.metrics;
        RuntimeConfig {
            metrics: MetricsConfig {
                emit_min_ops: m.emit_min_ops.unwrap_or(defaults.emit_min_ops),
                emit_min_ms: m.emit_min_ms.unwrap_or(defaults.emit_min_ms),
                auto_enable: m.auto_enable.unwrap_or(defaults.auto_enable),
                pipe_capacity: m.pipe_capacity.unwrap_or(defaults.pipe_capacity),
            },
        }
    }

    #[cfg(not(feature = "config"))]
    pub fn from_json_str(_body: &str) -> RuntimeConfig {
        RuntimeConfig::default()
    }
}

#[cfg(all(test, feature = "config"))]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.metrics.emit_min_ops, 1024);
        assert_eq!(cfg.metrics.emit_min_ms, 50);
        assert_eq!(cfg.metrics.auto_enable, false);
        assert_eq!(cfg.metrics.pipe_capacity, 64);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = RuntimeConfig::from_json_str(
            r#"{"channel": {"metrics": {"emit_min_ops": 2048, "spurious": 1}}, "bogus_top_level": true}"#,
        );
        assert_eq!(cfg.metrics.emit_min_ops, 2048);
        assert_eq!(cfg.metrics.emit_min_ms, 50);
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let cfg = RuntimeConfig::from_json_str("{ this is not json");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn partial_document_keeps_remaining_defaults() {
        let cfg = RuntimeConfig::from_json_str(r#"{"channel": {"metrics": {"auto_enable": true}}}"#);
        assert_eq!(cfg.metrics.auto_enable, true);
        assert_eq!(cfg.metrics.pipe_capacity, 64);
    }
}
