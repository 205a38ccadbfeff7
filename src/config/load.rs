//! Configuration loading: TOML file, environment overrides, and the
//! atomic first-run write of defaults.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::Config;

pub fn default_config_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:\\MeshFS\\meshfs.toml")
    } else {
        PathBuf::from("/etc/meshfs/meshfs.toml")
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Loads the explicit path if given (errors are fatal there), otherwise
/// the default path, otherwise defaults — writing them out for the next
/// run when possible.
pub fn load_or_init(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load(path);
    }
    let path = default_config_path();
    if path.exists() {
        return load(&path);
    }
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    if let Err(err) = write_config(&path, &config) {
        tracing::warn!("could not write default config to {}: {err}", path.display());
    }
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(name) = std::env::var("MESHFS_NODE_NAME")
        && !name.trim().is_empty()
    {
        config.node.name = name;
    }
    if let Ok(root) = std::env::var("MESHFS_ROOT")
        && !root.trim().is_empty()
    {
        config.filesystem.root_path = PathBuf::from(root);
    }
}

pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config("config path has no parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::Config(format!("failed to create temp file in {}: {e}", dir.display())))?;
    fs::write(temp.path(), data)
        .map_err(|e| Error::Config(format!("failed to write config temp file: {e}")))?;
    temp.persist(path)
        .map_err(|e| Error::Config(format!("failed to persist config to {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meshfs.toml");

        let mut config = Config::default();
        config.node.name = "node-a".to_string();
        config.network.tcp_port = 9111;
        config.peers = vec!["127.0.0.1:9000".to_string()];
        write_config(&path, &config).expect("write config");

        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.node.name, "node-a");
        assert_eq!(loaded.network.tcp_port, 9111);
        assert_eq!(loaded.peers, vec!["127.0.0.1:9000".to_string()]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meshfs.toml");
        fs::write(&path, "this is not toml [").unwrap();
        let err = load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
    }

    #[test]
    fn missing_explicit_path_is_fatal() {
        let err = load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
    }
}
