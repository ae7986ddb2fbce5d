use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::session::FittingResult;
use crate::styles::FitStyle;

/// Snapshot of a finished (or aborted) run, written as `summary.json`
/// next to the generated images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: String,
    pub fit_style: FitStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub aborted_for_reauth: bool,
    pub items: Vec<FittingResult>,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}
