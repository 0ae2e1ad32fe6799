use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Per-user home for gate state when `ATELIER_DATA_DIR` is not set,
/// e.g. `~/.local/share/atelier/` on Linux. Not created here.
pub fn platform_data_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", "atelier")
        .map(|dirs| dirs.data_dir().to_owned())
        .context("could not determine platform data directory")
}
