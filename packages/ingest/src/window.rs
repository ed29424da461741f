//! Derivation of the sync window for an extract.
//!
//! An extract named like `nyc_311_2023.csv` covers calendar year 2023. The
//! first standalone 4-digit year token (1900-2099) in the file name decides
//! the window; an explicit override always wins.

use std::path::Path;
use std::sync::LazyLock;

use chrono::Utc;
use nyc311_request_models::SyncWindow;
use regex::Regex;

/// A standalone year: not part of a longer run of digits.
static YEAR_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])((?:19|20)[0-9]{2})(?:[^0-9]|$)").unwrap_or_else(|_| unreachable!())
});

/// Errors from window resolution.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// No year token in the identifier and no override given.
    #[error("No year token in {identifier:?} and no explicit window given")]
    Unresolvable {
        /// The identifier that was searched.
        identifier: String,
    },
}

fn year_token(identifier: &str) -> Option<i32> {
    let name = Path::new(identifier)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(identifier);

    YEAR_TOKEN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Resolves the window for `identifier`, preferring `override_window`.
///
/// # Errors
///
/// Returns [`WindowError::Unresolvable`] if there is no override and the
/// identifier's file name has no year token.
pub fn resolve(
    identifier: &str,
    override_window: Option<SyncWindow>,
) -> Result<SyncWindow, WindowError> {
    if let Some(window) = override_window {
        return Ok(window);
    }

    year_token(identifier)
        .and_then(SyncWindow::calendar_year)
        .ok_or_else(|| WindowError::Unresolvable {
            identifier: identifier.to_string(),
        })
}

/// The calendar year containing today (UTC).
#[must_use]
pub fn current_year_window() -> SyncWindow {
    SyncWindow::containing_year(Utc::now().date_naive()).unwrap_or_else(|| unreachable!())
}

/// Like [`resolve`], but falls back to `fallback` with a warning.
///
/// Used by callers for which an unresolvable window is not fatal.
#[must_use]
pub fn resolve_or_fallback(
    identifier: &str,
    override_window: Option<SyncWindow>,
    fallback: SyncWindow,
) -> SyncWindow {
    match resolve(identifier, override_window) {
        Ok(window) => window,
        Err(e) => {
            log::warn!("{e}; falling back to window {fallback}");
            fallback
        }
    }
}
