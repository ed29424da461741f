//! Default file locations for the primary store and extracts.
//!
//! Everything lives under one data directory: `NYC311_DATA_DIR` when set,
//! otherwise `data/` at the workspace root.

use std::path::{Path, PathBuf};

/// Environment variable that relocates the data directory.
pub const ENV_DATA_DIR: &str = "NYC311_DATA_DIR";

/// Workspace root, two levels above this crate's manifest.
///
/// Falls back to the manifest directory for out-of-tree builds.
#[must_use]
pub fn project_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .ancestors()
        .nth(2)
        .unwrap_or(manifest)
        .to_path_buf()
}

#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var_os(ENV_DATA_DIR)
        .filter(|dir| !dir.is_empty())
        .map_or_else(|| project_root().join("data"), PathBuf::from)
}

/// Default primary `DuckDB` file.
#[must_use]
pub fn primary_db_path() -> PathBuf {
    data_dir().join("nyc311.duckdb")
}

/// Default extract, the sample file for the 2023 calendar year.
#[must_use]
pub fn default_extract_path() -> PathBuf {
    data_dir().join("nyc_311_2023_sample.csv")
}

/// Creates `dir` and its parents when missing.
///
/// # Errors
///
/// Returns the I/O error from directory creation.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    log::debug!("Creating data directory {}", dir.display());
    std::fs::create_dir_all(dir)
}
