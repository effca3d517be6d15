//! Runtime properties for the channelization pipeline.
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::TimeComparisonStrategy;
use crate::Result;

/// Tunable pipeline properties, loadable from a JSON file. Unset fields
/// take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EhaProperties {
    /// Master switch for channel derivation.
    pub derivation_enabled: bool,
    /// Wait budget for one derivation algorithm invocation.
    pub derivation_timeout_ms: u64,
    /// Size of the derivation worker pool.
    pub derivation_workers: usize,
    /// Resolve algorithmic derivations by trigger channel instead of by
    /// parent set.
    pub use_trigger_channels: bool,
    /// Generate local solar times on published values.
    pub enable_lst: bool,
    /// Timestamp domain that decides which of two samples is newer.
    pub time_comparison: TimeComparisonStrategy,
    /// Capacity of each dispatch topic queue.
    pub queue_bound: usize,
    /// Channelize fill packets and idle frames too.
    pub publish_fill_headers: bool,
    /// Broadcast interval of the suspect channel table.
    pub suspect_broadcast_interval_ms: u64,
}

impl Default for EhaProperties {
    fn default() -> Self {
        EhaProperties {
            derivation_enabled: true,
            derivation_timeout_ms: 5_000,
            derivation_workers: 4,
            use_trigger_channels: false,
            enable_lst: false,
            time_comparison: TimeComparisonStrategy::default(),
            queue_bound: 1_024,
            publish_fill_headers: false,
            suspect_broadcast_interval_ms: 5_000,
        }
    }
}

impl EhaProperties {
    /// Load properties from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    #[must_use]
    pub fn derivation_timeout(&self) -> Duration {
        Duration::from_millis(self.derivation_timeout_ms)
    }

    #[must_use]
    pub fn suspect_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.suspect_broadcast_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let props = EhaProperties::default();
        assert!(props.derivation_enabled);
        assert_eq!(props.derivation_timeout(), Duration::from_secs(5));
        assert!(!props.use_trigger_channels);
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"derivation_timeout_ms": 250, "time_comparison": "ert"}}"#
        )
        .unwrap();
        let props = EhaProperties::from_file(file.path()).unwrap();
        assert_eq!(props.derivation_timeout_ms, 250);
        assert_eq!(props.time_comparison, TimeComparisonStrategy::Ert);
        assert_eq!(props.queue_bound, 1_024, "unset fields keep defaults");
    }
}
