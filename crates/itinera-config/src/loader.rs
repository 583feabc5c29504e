use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Resolve a user-supplied path, expanding ~ to the home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Directory holding itinera's own state (`~/.itinera`).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".itinera")
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.itinera/config.json
    let home_config = data_dir().join("config.json");
    if home_config.exists() {
        return home_config;
    }

    // Default location (defaults apply if it is missing)
    home_config
}

/// Load configuration from a JSON file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.agent.max_iterations, 5);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.agent.system_prompt = "Plan trips to Lisbon.".into();
        cfg.index.documents = vec!["guides/*.pdf".into()];
        save_config(&path, &cfg).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.agent.system_prompt, "Plan trips to Lisbon.");
        assert_eq!(loaded.index.documents, vec!["guides/*.pdf".to_string()]);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err}").contains("failed to parse config"));
    }

    #[test]
    fn plain_paths_are_untouched() {
        assert_eq!(resolve_path("/tmp/guide.pdf"), PathBuf::from("/tmp/guide.pdf"));
        assert_eq!(resolve_path("guide.pdf"), PathBuf::from("guide.pdf"));
    }
}
