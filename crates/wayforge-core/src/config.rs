//! Engine-wide tunables: channel sizing, default timeouts and
//! the knobs the reference checkpointer and each-iteration expansion honor.
//! Deserializable so a host binary can load it from its own config file
//! alongside its activity registry.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Engine-wide configuration. Every field has a sane default; construct with
/// [`EngineConfig::default`] and override only what a deployment needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded capacity of the path-snapshot channel the orchestrator reads
    /// from. Backpressures path tasks under heavy fan-out.
    pub snapshot_channel_capacity: usize,
    /// Per-attempt activity timeout used when a step's selected retry policy
    /// sets none.
    pub default_activity_timeout_ms: u64,
    /// Optional wall-clock deadline for the whole execution. `None` means no
    /// deadline beyond what an individual activity enforces.
    pub default_workflow_deadline_ms: Option<u64>,
    /// Directory handed to an on-disk checkpointer a host application
    /// brings itself. The in-memory reference checkpointer shipped with
    /// this crate ignores it.
    pub checkpoint_dir: Option<PathBuf>,
    /// Upper bound on the number of items an `each` step may expand to, in
    /// place to keep a runaway expression from fanning out unbounded work.
    pub max_each_fanout: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_channel_capacity: 256,
            default_activity_timeout_ms: 30_000,
            default_workflow_deadline_ms: None,
            checkpoint_dir: None,
            max_each_fanout: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn default_activity_timeout(&self) -> Duration {
        Duration::from_millis(self.default_activity_timeout_ms)
    }

    pub fn default_workflow_deadline(&self) -> Option<Duration> {
        self.default_workflow_deadline_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_workflow_deadline() {
        let config = EngineConfig::default();
        assert_eq!(config.default_workflow_deadline(), None);
        assert_eq!(config.default_activity_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn accepts_a_configured_checkpoint_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        assert_eq!(config.checkpoint_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_each_fanout": 5}"#).unwrap();
        assert_eq!(config.max_each_fanout, 5);
        assert_eq!(config.snapshot_channel_capacity, 256);
    }
}
