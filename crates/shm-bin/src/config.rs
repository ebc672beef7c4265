//! Optional `shimmer.toml` defaults for the diagnostic client.
//!
//! Discovery: an explicit `--config` path, then `shimmer.toml` in the
//! working directory, then `$XDG_CONFIG_HOME/shimmer/shimmer.toml`.
//! Unknown fields are ignored so the file can grow without breaking old
//! binaries.

use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PatternConfig {
    #[serde(default = "PatternConfig::default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl PatternConfig {
    const fn default_fps() -> u32 {
        60
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
}

pub fn discover() -> PathBuf {
    let local = PathBuf::from("shimmer.toml");
    if local.exists() {
        return local;
    }
    if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(base).join("shimmer").join("shimmer.toml");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("shimmer")
            .join("shimmer.toml");
    }
    PathBuf::from("shimmer.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<ConfigFile> {
    let path = path.unwrap_or_else(discover);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let file: ConfigFile = toml::from_str(&content)?;
            info!(target: "runtime.config", path = %path.display(), "config loaded");
            Ok(file)
        }
        Err(_) => Ok(ConfigFile::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let cfg: ConfigFile = toml::from_str(
            "[connection]\nendpoint = \"demo\"\n[pattern]\nfps = 30\n",
        )
        .unwrap();
        assert_eq!(cfg.connection.endpoint.as_deref(), Some("demo"));
        assert_eq!(cfg.pattern.fps, 30);
        assert_eq!(cfg.connection.fallback, None);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let cfg: ConfigFile =
            toml::from_str("[connection]\nendpoint = \"x\"\nfuture_knob = 3\n").unwrap();
        assert_eq!(cfg.connection.endpoint.as_deref(), Some("x"));
    }
}
