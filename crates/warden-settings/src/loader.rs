//! Config file discovery.
//!
//! Looks for the config file in order:
//! 1. The path given on the command line
//! 2. `./warden.toml`
//! 3. `<config_dir>/warden/warden.toml` (e.g. `~/.config/warden/warden.toml`)

use crate::SettingsError;
use std::path::{Path, PathBuf};

/// Config file name looked up in each location.
pub const CONFIG_FILE_NAME: &str = "warden.toml";

/// Locates the `warden.toml` to load.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Pick the config path for this process.
    ///
    /// An explicit path is returned as given, even if it does not exist, so
    /// the caller reports the read error for it.
    ///
    /// # Errors
    /// `SettingsError::NotFound` if no explicit path is given and neither
    /// default location exists; `SettingsError::Io` if the working directory
    /// cannot be determined.
    pub fn resolve(explicit: Option<&Path>) -> Result<PathBuf, SettingsError> {
        let cwd = std::env::current_dir()?;
        Self::resolve_from(explicit, &cwd, Self::global_config_path())
    }

    /// [`ConfigLoader::resolve`] with the search roots supplied.
    pub fn resolve_from(
        explicit: Option<&Path>,
        cwd: &Path,
        global: Option<PathBuf>,
    ) -> Result<PathBuf, SettingsError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }

        let candidates: Vec<PathBuf> = std::iter::once(Self::local_config_path(cwd))
            .chain(global)
            .collect();
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }

        Err(SettingsError::NotFound {
            searched: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// `<cwd>/warden.toml`.
    pub fn local_config_path(cwd: &Path) -> PathBuf {
        cwd.join(CONFIG_FILE_NAME)
    }

    /// `<config_dir>/warden/warden.toml`, if the platform has a config dir.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("warden").join(CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "").unwrap();
        let explicit = Path::new("/elsewhere/custom.toml");

        let path = ConfigLoader::resolve_from(Some(explicit), dir.path(), None).unwrap();
        assert_eq!(path, explicit);
    }

    #[test]
    fn test_local_before_global() {
        let cwd = tempfile::tempdir().unwrap();
        let global_dir = tempfile::tempdir().unwrap();
        let global = global_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&global, "").unwrap();
        fs::write(cwd.path().join(CONFIG_FILE_NAME), "").unwrap();

        let path = ConfigLoader::resolve_from(None, cwd.path(), Some(global)).unwrap();
        assert_eq!(path, cwd.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_falls_back_to_global() {
        let cwd = tempfile::tempdir().unwrap();
        let global_dir = tempfile::tempdir().unwrap();
        let global = global_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&global, "").unwrap();

        let path = ConfigLoader::resolve_from(None, cwd.path(), Some(global.clone())).unwrap();
        assert_eq!(path, global);
    }

    #[test]
    fn test_not_found_lists_searched_paths() {
        let cwd = tempfile::tempdir().unwrap();
        let global = Some(PathBuf::from("/nonexistent/warden.toml"));
        let err = ConfigLoader::resolve_from(None, cwd.path(), global).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, SettingsError::NotFound { .. }));
        assert!(message.contains("/nonexistent/warden.toml"));
        assert!(message.contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_global_config_path_ends_with_warden_toml() {
        if let Some(path) = ConfigLoader::global_config_path() {
            assert!(path.ends_with("warden/warden.toml"));
        }
    }
}
