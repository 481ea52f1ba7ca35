//-----------------------------------------------------------------------------
// Module config
// Link configuration parameters

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use crate::fetch::PoolConfig;

/// Configuration of a CalLink
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Lock timeout of external process channels opened without an explicit timeout
    pub default_timeout_ms: u64,
    /// Minimum buffer capacity of a new span
    pub min_span_capacity: u32,
    /// Extra capacity when a span buffer grows
    pub span_growth_slack: u32,
    /// Minimum capacity of a new element block
    pub min_element_block: usize,
    /// Name of the worker thread
    pub worker_name: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            default_timeout_ms: 1000,
            min_span_capacity: 64,
            span_growth_slack: 64,
            min_element_block: 64,
            worker_name: "cal_link".to_string(),
        }
    }
}

impl LinkConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_span_capacity: self.min_span_capacity,
            span_growth_slack: self.span_growth_slack,
        }
    }

    /// Load from a json file
    #[cfg(feature = "serde")]
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: &P) -> Result<LinkConfig, crate::LinkError> {
        let path: &std::path::Path = path.as_ref();
        info!("Load link config {}", path.display());
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader).map_err(|e| std::io::Error::other(format!("serde_json::from_reader failed: {}", e)))?;
        Ok(config)
    }

    /// Save to a json file
    #[cfg(feature = "serde")]
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: &P) -> Result<(), crate::LinkError> {
        let path: &std::path::Path = path.as_ref();
        info!("Save link config {}", path.display());
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        let s = serde_json::to_string_pretty(self).map_err(|e| std::io::Error::other(format!("serde_json::to_string failed: {}", e)))?;
        std::io::Write::write_all(&mut writer, s.as_ref())?;
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------
// Test module
