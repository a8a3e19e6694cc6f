//! Server configuration.
//!
//! Loaded from a JSON document; every field has a default so a
//! partial document (or `{}`) is valid. When loaded with
//! [`ServerConfig::from_file`], a couple of settings can be
//! overridden through the environment:
//!
//! - `MINIPS_LOG`: log level, e.g. `debug`.
//! - `MINIPS_API_PORT`: port of the monitoring server.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::node::NodeId;
use crate::node::ThreadId;

/// Settings consumed by the server core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Id of this node; part of the checkpoint file name.
    pub my_id: u32,
    /// Enables progress checkpoint dump and restore.
    pub checkpoint_toggle: bool,
    /// Prepended verbatim to the checkpoint file name, so a directory
    /// prefix needs its trailing separator.
    pub checkpoint_file_prefix: String,
    /// Set when this process is restarting into a cluster that grew
    /// by one node since the last checkpoint.
    pub has_scale_node: bool,
    /// The node that was added. Only read if `has_scale_node`.
    pub scale_node_id: u32,
    pub log_level: Option<String>,
    /// Port of the monitoring server; `None` disables it.
    pub api_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            my_id: 0,
            checkpoint_toggle: false,
            checkpoint_file_prefix: String::new(),
            has_scale_node: false,
            scale_node_id: 0,
            log_level: None,
            api_port: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ServerConfig {
    /// Parse a JSON document. Environment overrides are not applied.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, then apply the `MINIPS_*` environment
    /// overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&json)?.with_env_overrides()
    }

    /// Apply `MINIPS_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(level) = lookup("MINIPS_LOG") {
            self.log_level = Some(level);
        }
        if let Some(port) = lookup("MINIPS_API_PORT") {
            let port = port.parse().map_err(|_| ConfigError::Env {
                var: "MINIPS_API_PORT",
                value: port.clone(),
            })?;
            self.api_port = Some(port);
        }
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.has_scale_node && ThreadId::of(NodeId(self.scale_node_id), 0).is_none() {
            return Err(ConfigError::Invalid {
                field: "scale_node_id",
                reason: format!(
                    "node {} has no thread ids below {}",
                    self.scale_node_id,
                    u32::MAX
                ),
            });
        }
        Ok(())
    }

    /// Where this node's progress checkpoint lives.
    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}server_progress_{}",
            self.checkpoint_file_prefix, self.my_id
        ))
    }

    /// Where the shard serving `model_id` keeps its checkpoint.
    ///
    /// Model 0 uses [`Self::checkpoint_path`] itself; other models on
    /// the same node get a `_<model_id>` suffix so shards never share
    /// a file.
    pub fn checkpoint_path_for(&self, model_id: u32) -> PathBuf {
        let path = self.checkpoint_path();
        if model_id == 0 {
            return path;
        }
        let mut name = path.into_os_string();
        name.push(format!("_{model_id}"));
        PathBuf::from(name)
    }

    /// The node added since the last checkpoint, if any.
    pub fn scale_node(&self) -> Option<NodeId> {
        self.has_scale_node.then_some(NodeId(self.scale_node_id))
    }
}

#[test]
fn empty_document_is_default() {
    assert_eq!(ServerConfig::from_json("{}").unwrap(), ServerConfig::default());
}

#[test]
fn checkpoint_path_concatenates_prefix() {
    let config = ServerConfig::from_json(
        r#"{"my_id": 2, "checkpoint_toggle": true, "checkpoint_file_prefix": "/tmp/ckpt/"}"#,
    )
    .unwrap();
    assert_eq!(
        config.checkpoint_path(),
        PathBuf::from("/tmp/ckpt/server_progress_2")
    );
}

#[test]
fn checkpoint_path_is_unique_per_model() {
    let config = ServerConfig {
        my_id: 3,
        ..Default::default()
    };
    assert_eq!(config.checkpoint_path_for(0), config.checkpoint_path());
    assert_eq!(
        config.checkpoint_path_for(7),
        PathBuf::from("server_progress_3_7")
    );
}

#[test]
fn scale_node_requires_flag() {
    let mut config = ServerConfig {
        scale_node_id: 4,
        ..Default::default()
    };
    assert_eq!(config.scale_node(), None);
    config.has_scale_node = true;
    assert_eq!(config.scale_node(), Some(NodeId(4)));
}

#[test]
fn bad_json_is_an_error() {
    assert!(matches!(
        ServerConfig::from_json(r#"{"my_id": "x"}"#),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn scale_node_must_have_thread_ids() {
    let res = ServerConfig::from_json(r#"{"has_scale_node": true, "scale_node_id": 5000000}"#);
    assert!(matches!(
        res,
        Err(ConfigError::Invalid {
            field: "scale_node_id",
            ..
        })
    ));
    // Ignored while no scale node is configured.
    assert!(ServerConfig::from_json(r#"{"scale_node_id": 5000000}"#).is_ok());
    assert!(ServerConfig::from_json(r#"{"has_scale_node": true, "scale_node_id": 4294967}"#).is_ok());
}

#[test]
fn env_overrides_log_level_and_port() {
    let config = ServerConfig::default()
        .with_overrides_from(|var| match var {
            "MINIPS_LOG" => Some("debug".to_string()),
            "MINIPS_API_PORT" => Some("3030".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.log_level.as_deref(), Some("debug"));
    assert_eq!(config.api_port, Some(3030));

    let unchanged = ServerConfig::default().with_overrides_from(|_| None).unwrap();
    assert_eq!(unchanged, ServerConfig::default());
}

#[test]
fn bad_port_override_is_an_error() {
    let res = ServerConfig::default().with_overrides_from(|var| {
        (var == "MINIPS_API_PORT").then(|| "http".to_string())
    });
    match res {
        Err(ConfigError::Env { var, value }) => {
            assert_eq!(var, "MINIPS_API_PORT");
            assert_eq!(value, "http");
        }
        other => panic!("expected env error, got {other:?}"),
    }
}

#[test]
fn from_file_reads_document() {
    let dir = std::env::temp_dir().join(format!("minips-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("server.json");
    std::fs::write(&path, r#"{"my_id": 6, "checkpoint_toggle": true}"#).unwrap();

    let config = ServerConfig::from_file(&path).unwrap();
    assert_eq!(config.my_id, 6);
    assert!(config.checkpoint_toggle);

    assert!(matches!(
        ServerConfig::from_file(&dir.join("missing.json")),
        Err(ConfigError::Io { .. })
    ));
}
