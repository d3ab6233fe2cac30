use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use crate::core::error::Result;
use crate::search::federation::StaticDirectory;
use crate::search::tweaks::Tweaks;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub instance_home: PathBuf,                 // root of per-instance scratch dirs
    pub home_dir: String,                       // results are reported relative to it
    pub listen_port: u16,
    pub local_host: String,                     // this node's address as the directory knows it
    pub post_proc_scripts: BTreeMap<String, Vec<String>>, // script transformations: name -> argv

    pub backend: BackendConfig,
    pub optimizer: OptimizerConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub tool: String,                           // empty: select per search mode
    pub legacy_expressions: bool,               // pass the compatibility expression
    pub nodes: u32,                             // 0: backend default
    pub keep_files: bool,                       // keep scratch files for debugging

    // tail readers
    pub open_poll_ms: u64,
    pub open_poll_limit_ms: u64,
    pub read_poll_ms: u64,
    pub read_attempts: u32,
    pub index_queue_capacity: usize,

    pub tweaks: Tweaks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub combine_limit: i32,                     // -1 for no limit
    pub except_modes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub service_name: String,
    pub default_port: u16,
    pub tenant: String,
    pub busyness_tolerance: i32,                // metrics within it count as equally busy
    pub directory: StaticDirectory,             // partitions, peers and busyness
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_home: std::env::temp_dir(),
            home_dir: String::new(),
            listen_port: 8765,
            local_host: "127.0.0.1".to_string(),
            post_proc_scripts: BTreeMap::new(),
            backend: BackendConfig::default(),
            optimizer: OptimizerConfig::default(),
            federation: FederationConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            tool: String::new(),
            legacy_expressions: false,
            nodes: 0,
            keep_files: false,
            open_poll_ms: 50,                   // poll for the backend output files
            open_poll_limit_ms: 5000,           // give up opening after 5 seconds
            read_poll_ms: 50,
            read_attempts: 20,                  // DATA reader retries after soft stop
            index_queue_capacity: 1024,
            tweaks: Tweaks::default(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            combine_limit: -1,
            except_modes: Vec::new(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            service_name: "ryft-rest-api".to_string(),
            default_port: 8765,
            tenant: String::new(),
            busyness_tolerance: 0,
            directory: StaticDirectory::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration, missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.instance_home.join(format!(".ryftgate-{}", self.listen_port))
    }

    /// Create an empty instance directory, removing leftovers of a
    /// previous run.
    pub fn prepare_instance_dir(&self) -> Result<PathBuf> {
        let dir = self.instance_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(
            &path,
            r#"{"listen_port": 9000, "backend": {"read_attempts": 3}, "optimizer": {"combine_limit": 2},
                "post_proc_scripts": {"upper": ["/usr/bin/tr", "a-z", "A-Z"]}}"#,
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.backend.read_attempts, 3);
        assert_eq!(cfg.backend.open_poll_ms, 50);
        assert_eq!(cfg.optimizer.combine_limit, 2);
        assert_eq!(cfg.federation.service_name, "ryft-rest-api");
        assert_eq!(cfg.post_proc_scripts["upper"], ["/usr/bin/tr", "a-z", "A-Z"]);
    }

    #[test]
    fn test_prepare_instance_dir() {
        let home = tempfile::tempdir().unwrap();
        let cfg = Config {
            instance_home: home.path().to_path_buf(),
            listen_port: 1234,
            ..Config::default()
        };

        let dir = cfg.prepare_instance_dir().unwrap();
        assert!(dir.ends_with(".ryftgate-1234"));
        fs::write(dir.join("leftover"), b"x").unwrap();

        let dir = cfg.prepare_instance_dir().unwrap();
        assert!(!dir.join("leftover").exists());
    }
}
