use std::fs;
use std::path::Path;

use fm_core::EngineConfig;

use crate::error::{Result, StoreError};

/// Parse and validate an engine config from TOML text. Missing sections
/// and keys take their defaults.
pub fn parse_config(text: &str) -> Result<EngineConfig> {
    let config: EngineConfig =
        toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
    config
        .validate()
        .map_err(|e| StoreError::Config(e.to_string()))?;
    Ok(config)
}

/// Resolve the engine config: an explicit path must exist; otherwise
/// `fallback` is read if present, else defaults apply.
pub fn load_config(explicit: Option<&Path>, fallback: &Path) -> Result<EngineConfig> {
    let path = match explicit {
        Some(p) => p,
        None if fallback.exists() => fallback,
        None => {
            tracing::debug!("no config file, using defaults");
            return Ok(EngineConfig::default());
        }
    };
    let text = fs::read_to_string(path).map_err(|e| {
        StoreError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let config = parse_config(&text)
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Render a config as TOML, e.g. to seed a fresh data directory.
pub fn render_config(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| StoreError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            "embedding_dims = 16\n\n[observer]\nhalf_life_ms = 1000\n",
        )
        .unwrap();
        assert_eq!(config.embedding_dims.0, 16);
        assert_eq!(config.observer.half_life_ms, 1000);
        assert_eq!(config.analyzer, EngineConfig::default().analyzer);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = parse_config("[observer]\ndecay_floor = 1.5\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(err.to_string().contains("decay_floor"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(matches!(
            parse_config("embedding_dims = [").unwrap_err(),
            StoreError::Config(_)
        ));
    }

    #[test]
    fn test_missing_fallback_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(None, &dir.path().join("fm.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_missing_explicit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml")), &dir.path().join("fm.toml"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_fallback_file_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fm.toml");
        fs::write(&path, "[branch]\nmax_branches = 3\n").unwrap();
        let config = load_config(None, &path).unwrap();
        assert_eq!(config.branch.max_branches, 3);
    }

    #[test]
    fn test_rendered_default_parses_back() {
        let text = render_config(&EngineConfig::default()).unwrap();
        assert_eq!(parse_config(&text).unwrap(), EngineConfig::default());
    }
}
