//! Loading of deployment configuration and scenario topologies.
//!
//! Configuration is TOML; every section is optional and falls back to the
//! defaults in `morpho_core::config`. A config that fails validation is an
//! error here, never something the control loop clamps later.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use morpho_core::topology::TopologySpec;
use morpho_core::{ControlConfig, Topology};

use crate::error::{Result, StoreError};

pub const DATA_DIR_ENV: &str = "MORPHO_DATA_DIR";

/// `$MORPHO_DATA_DIR`, else `~/.morpho`.
pub fn default_data_dir() -> PathBuf {
    data_dir_from(
        env::var(DATA_DIR_ENV).ok(),
        env::var("HOME").or_else(|_| env::var("USERPROFILE")).ok(),
    )
}

fn data_dir_from(explicit: Option<String>, home: Option<String>) -> PathBuf {
    match explicit.filter(|d| !d.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".morpho"),
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| StoreError::io(path, e))
}

/// Parse and validate a TOML config held in memory.
pub fn parse_config(text: &str) -> Result<ControlConfig> {
    parse_config_at(text, Path::new("<inline>"))
}

fn parse_config_at(text: &str, path: &Path) -> Result<ControlConfig> {
    let cfg: ControlConfig = toml::from_str(text).map_err(|source| StoreError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<ControlConfig> {
    let cfg = parse_config_at(&read(path)?, path)?;
    tracing::info!(path = %path.display(), tick_seconds = cfg.tick_seconds, "config loaded");
    Ok(cfg)
}

/// Load a topology from a `.json` file, or TOML for any other extension.
pub fn load_topology(path: &Path) -> Result<Topology> {
    let text = read(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let spec: TopologySpec = if is_json {
        serde_json::from_str(&text)?
    } else {
        toml::from_str(&text).map_err(|source| StoreError::Toml {
            path: path.to_path_buf(),
            source,
        })?
    };
    let topology = Topology::from_spec(&spec)?;
    tracing::info!(
        path = %path.display(),
        nodes = topology.len(),
        links = topology.link_count(),
        "topology loaded"
    );
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_is_defaults() {
        assert_eq!(parse_config("").unwrap(), ControlConfig::default());
    }

    #[test]
    fn test_partial_sections_override() {
        let cfg = parse_config(
            r#"
            tick_seconds = 2.0

            [detector.latency]
            hot = 0.6
            very_hot = 1.2
            hysteresis = 0.05

            [gateway]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.tick_seconds, 2.0);
        assert_eq!(cfg.detector.latency.hot, 0.6);
        assert_eq!(cfg.gateway.max_attempts, 5);
        assert_eq!(cfg.weaver, ControlConfig::default().weaver);
    }

    #[test]
    fn test_unstable_config_is_refused() {
        let err = parse_config(
            "[field]\ncoupling = [[0.0, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.0, 0.0]]\n",
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)), "{err}");
    }

    #[test]
    fn test_malformed_toml_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tick_seconds = [").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, StoreError::Toml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/morpho.toml")).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_topology_from_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("mesh.toml");
        fs::write(
            &toml_path,
            r#"
            nodes = ["a", "b", "c"]

            [[links]]
            id = "ab"
            from = "a"
            to = "b"

            [[links]]
            id = "bc"
            from = "b"
            to = "c"
            capacity = 2.0
            "#,
        )
        .unwrap();
        let topo = load_topology(&toml_path).unwrap();
        assert_eq!(topo.len(), 3);
        assert_eq!(topo.link_count(), 2);

        let json_path = dir.path().join("pair.json");
        fs::write(
            &json_path,
            r#"{"nodes": ["x", "y"], "links": [{"id": "xy", "from": "x", "to": "y"}]}"#,
        )
        .unwrap();
        let topo = load_topology(&json_path).unwrap();
        assert_eq!(topo.len(), 2);
        assert!(topo.link_by_id("xy").is_some());
    }

    #[test]
    fn test_topology_with_unknown_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(
            &path,
            r#"{"nodes": ["x"], "links": [{"id": "xy", "from": "x", "to": "y"}]}"#,
        )
        .unwrap();
        assert!(matches!(load_topology(&path), Err(StoreError::Topology(_))));
    }

    #[test]
    fn test_data_dir_resolution() {
        assert_eq!(
            data_dir_from(Some("/srv/morpho".into()), Some("/home/op".into())),
            PathBuf::from("/srv/morpho")
        );
        assert_eq!(
            data_dir_from(Some("  ".into()), Some("/home/op".into())),
            PathBuf::from("/home/op/.morpho")
        );
        assert_eq!(data_dir_from(None, None), PathBuf::from("./.morpho"));
    }
}
