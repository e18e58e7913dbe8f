use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Data carried from one run to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// Sender addresses treated like sender blacklist entries.
    #[serde(default)]
    pub blocked_senders: Vec<String>,
}

impl StateFile {
    /// Read the state, or start empty when the file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write state file {}", path.display()))?;
        Ok(())
    }
}
