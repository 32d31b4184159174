//! Built-in policy scripts written on first start.

use std::io;
use std::path::PathBuf;
use tracing::info;
use vigil_runtime::config::ScriptsConfig;

/// Default event policy.
pub const DEFAULT_EVENT_SCRIPT: &str = include_str!("../scripts/reject-event.lua");

/// Default filter policy.
pub const DEFAULT_FILTER_SCRIPT: &str = include_str!("../scripts/reject-filter.lua");

/// Writes any missing policy script with its built-in content.
///
/// Existing files are never touched. Returns the paths that were created.
///
/// # Errors
///
/// Returns an I/O error if the directory or a file cannot be written.
pub fn ensure_default_scripts(scripts: &ScriptsConfig) -> io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(&scripts.dir)?;

    let mut created = Vec::new();
    for (path, body) in [
        (scripts.event_path(), DEFAULT_EVENT_SCRIPT),
        (scripts.filter_path(), DEFAULT_FILTER_SCRIPT),
    ] {
        if path.exists() {
            continue;
        }
        let mut content = body.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        std::fs::write(&path, content)?;
        info!(path = %path.display(), "Wrote default policy script");
        created.push(path);
    }
    Ok(created)
}
