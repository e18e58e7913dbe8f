use std::net::IpAddr;

/// Errors raised by the filtering core.
///
/// Application-level code (configuration loading, `main`) works with
/// `anyhow::Result`; everything below the driver reports one of these.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Folder '{folder}' not found, existing folders: {}", existing.join(", "))]
    FolderNotFound {
        folder: String,
        existing: Vec<String>,
    },
    #[error("Action '{action}' failed: {reason}")]
    ActionExecution { action: String, reason: String },
    #[error("Reputation lookup for {0} was inconclusive: {1}")]
    ResolutionDegraded(IpAddr, String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

impl FilterError {
    pub fn action(action: &str, reason: impl ToString) -> Self {
        FilterError::ActionExecution {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }
}
