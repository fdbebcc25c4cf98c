use std::path::PathBuf;

/// XDG app name used for all state writes.
pub const APP_NAME: &str = "aviary";

/// Resolve the state root directory (`~/.local/state/aviary` on Linux).
///
/// Services accept an explicit base directory as well, so tests never
/// touch this path.
pub fn state_root() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| {
        dirs.state_dir()
            .unwrap_or_else(|| dirs.data_local_dir())
            .to_path_buf()
    })
}
