pub mod apksigner;
pub mod apktool;
pub mod keytool;
pub mod zipalign;

use crate::config::ToolPaths;
use std::path::PathBuf;

/// Result of resolving one configured tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub label: &'static str,
    pub configured: PathBuf,
    pub resolved: Option<PathBuf>,
}

impl ToolStatus {
    pub fn is_available(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Looks every tool up on `PATH` (or at its configured path).
pub fn preflight(tools: &ToolPaths) -> Vec<ToolStatus> {
    tools
        .iter()
        .map(|(label, configured)| ToolStatus {
            label,
            configured: configured.to_path_buf(),
            resolved: which::which(configured).ok(),
        })
        .collect()
}

pub fn missing_tools(tools: &ToolPaths) -> Vec<ToolStatus> {
    preflight(tools)
        .into_iter()
        .filter(|status| !status.is_available())
        .collect()
}
