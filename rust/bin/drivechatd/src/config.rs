//! Server-side configuration file.
//!
//! `drivechatd -c prod` reads `/etc/drivechat/prod.toml`; anything that
//! looks like a path is used as-is.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use task::config::TaskConfig;

const CONFIG_DIR: &str = "/etc/drivechat";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. The `--listen` flag wins over this.
    #[serde(default)]
    pub listen: Option<String>,
    pub storage: StorageConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

impl ServerConfig {
    /// Resolve a context name or a path to the config file location.
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            Path::new(CONFIG_DIR).join(format!("{name_or_path}.toml"))
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
