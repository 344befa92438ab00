use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::convert::parse_endpoint;
use crate::credential::BackendAuth;
use crate::normalize::DEFAULT_STRIPPED_FIELDS;
use crate::proxy::DEFAULT_MAX_BODY_BYTES;
use crate::registry::{DeploymentConfig, DeploymentRegistry, RegistryError};

pub const DEFAULT_API_VERSION: &str = "2024-02-01";
const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no deployments configured; add [[deployments]] to {0:?} or set AZURE_OPENAI_MODEL_MAPPER")]
    NoDeployments(PathBuf),
    #[error("deployment for model '{model}': {reason}")]
    InvalidDeployment { model: String, reason: String },
    #[error("invalid AZURE_OPENAI_MODEL_MAPPER entry '{0}', expected model=deployment")]
    InvalidModelMapper(String),
    #[error("invalid auth_header '{0}'")]
    InvalidAuthHeader(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEntry {
    pub model: String,
    #[serde(alias = "deployment_name")]
    pub deployment_id: String,
    /// Falls back to the top-level `endpoint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Falls back to the top-level `api_version`, then [`DEFAULT_API_VERSION`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Inline key (not recommended; prefer `api_key_env`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl DeploymentEntry {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref()
            && !key.trim().is_empty()
        {
            return Some(key.to_string());
        }
        if let Some(env_name) = self.api_key_env.as_deref()
            && let Ok(v) = env::var(env_name)
            && !v.trim().is_empty()
        {
            return Some(v);
        }
        None
    }
}

/// Outbound transport knobs. Unset means "whatever reqwest does".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct UpstreamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    #[default]
    Azure,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_route_prefix() -> String {
    "/v1".to_string()
}

fn default_auth_header() -> String {
    "api-key".to_string()
}

fn default_stripped_fields() -> Vec<String> {
    DEFAULT_STRIPPED_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub converter: ConverterKind,
    /// Inbound path prefix removed before building the backend path.
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    /// Header the backend reads the credential from.
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_stripped_fields")]
    pub stripped_fields: Vec<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Default endpoint for deployments that omit one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Default API version for deployments that omit one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub deployments: Vec<DeploymentEntry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: Some(CONFIG_VERSION),
            host: default_host(),
            port: default_port(),
            converter: ConverterKind::default(),
            route_prefix: default_route_prefix(),
            auth_header: default_auth_header(),
            stripped_fields: default_stripped_fields(),
            max_body_bytes: default_max_body_bytes(),
            upstream: UpstreamConfig::default(),
            endpoint: None,
            api_version: None,
            deployments: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address {raw}"))
    }

    pub fn backend_auth(&self) -> Result<BackendAuth, ConfigError> {
        BackendAuth::from_header_name(&self.auth_header)
            .map_err(|_| ConfigError::InvalidAuthHeader(self.auth_header.clone()))
    }

    /// Resolves defaults and secrets, validates, and freezes the table.
    pub fn build_registry(&self) -> Result<DeploymentRegistry, ConfigError> {
        if self.deployments.is_empty() {
            return Err(ConfigError::NoDeployments(config_file_path()));
        }
        let mut resolved = Vec::with_capacity(self.deployments.len());
        for entry in &self.deployments {
            resolved.push(self.resolve_deployment(entry)?);
        }
        Ok(DeploymentRegistry::new(resolved)?)
    }

    /// Resolves one entry against the top-level defaults.
    pub fn resolve_deployment(&self, entry: &DeploymentEntry) -> Result<DeploymentConfig, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDeployment {
            model: entry.model.clone(),
            reason: reason.to_string(),
        };

        if entry.deployment_id.trim().is_empty() {
            return Err(invalid("deployment_id is empty"));
        }
        let endpoint = entry
            .endpoint
            .as_deref()
            .or(self.endpoint.as_deref())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("no endpoint (set it on the deployment or top-level)"))?;
        parse_endpoint(endpoint).map_err(|e| invalid(&e.to_string()))?;

        let api_version = entry
            .api_version
            .as_deref()
            .or(self.api_version.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_API_VERSION);

        let auth_key = match entry.resolve_api_key() {
            Some(key) => {
                if axum::http::HeaderValue::from_str(&key).is_err() {
                    return Err(invalid("api key contains characters not allowed in a header"));
                }
                key
            }
            None => {
                if let Some(env_name) = entry.api_key_env.as_deref() {
                    warn!(
                        "deployment '{}': env {} is unset; caller bearer tokens will be forwarded",
                        entry.model, env_name
                    );
                }
                String::new()
            }
        };

        Ok(DeploymentConfig {
            model: entry.model.trim().to_string(),
            deployment_id: entry.deployment_id.trim().to_string(),
            api_version: api_version.trim().to_string(),
            auth_key,
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
        })
    }
}

/// Home directory for config and logs.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("DEPLOYMENT_PROXY_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deployment-proxy")
}

fn config_toml_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}

fn config_json_path() -> PathBuf {
    proxy_home_dir().join("config.json")
}

/// Path `load_config()` reads: TOML if present, else JSON, else the TOML default.
pub fn config_file_path() -> PathBuf {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        toml_path
    } else if config_json_path().exists() {
        config_json_path()
    } else {
        toml_path
    }
}

fn ensure_config_version(cfg: &mut ProxyConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

fn parse_config_text(path: &Path, text: &str) -> Result<ProxyConfig> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let mut cfg = if is_json {
        serde_json::from_str::<ProxyConfig>(text)
            .with_context(|| format!("failed to parse {path:?} as JSON"))?
    } else {
        toml::from_str::<ProxyConfig>(text)
            .with_context(|| format!("failed to parse {path:?} as TOML"))?
    };
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

pub async fn load_config_from(path: &Path) -> Result<ProxyConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {path:?}"))?;
    parse_config_text(path, &text)
}

/// Loads the config file (if any) and fills the deployment table from env when empty.
pub async fn load_config(explicit: Option<&Path>) -> Result<ProxyConfig> {
    let mut cfg = match explicit {
        Some(path) => load_config_from(path).await?,
        None => {
            let path = config_file_path();
            if path.exists() {
                load_config_from(&path).await?
            } else {
                ProxyConfig::default()
            }
        }
    };
    let added = bootstrap_from_env(&mut cfg, |k| env::var(k).ok())?;
    if added > 0 {
        info!("loaded {} deployment(s) from AZURE_OPENAI_MODEL_MAPPER", added);
    }
    Ok(cfg)
}

/// Fills an empty deployment table from the `AZURE_OPENAI_*` variables.
///
/// Returns the number of deployments added.
pub fn bootstrap_from_env<F>(cfg: &mut ProxyConfig, var: F) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !cfg.deployments.is_empty() {
        return Ok(0);
    }
    let non_empty = |k: &str| var(k).filter(|v| !v.trim().is_empty());
    let Some(mapper) = non_empty("AZURE_OPENAI_MODEL_MAPPER") else {
        return Ok(0);
    };

    if cfg.endpoint.is_none() {
        cfg.endpoint = non_empty("AZURE_OPENAI_ENDPOINT");
    }
    if cfg.api_version.is_none() {
        cfg.api_version = non_empty("AZURE_OPENAI_API_VER");
    }
    let shared_key = non_empty("AZURE_OPENAI_TOKEN");

    for pair in mapper.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((model, deployment)) = pair.split_once('=') else {
            return Err(ConfigError::InvalidModelMapper(pair.to_string()));
        };
        let (model, deployment) = (model.trim(), deployment.trim());
        if model.is_empty() || deployment.is_empty() {
            return Err(ConfigError::InvalidModelMapper(pair.to_string()));
        }
        cfg.deployments.push(DeploymentEntry {
            model: model.to_string(),
            deployment_id: deployment.to_string(),
            endpoint: None,
            api_version: None,
            api_key: shared_key.clone(),
            api_key_env: None,
        });
    }
    Ok(cfg.deployments.len())
}

const CONFIG_TOML_TEMPLATE: &str = r#"# deployment-proxy config.toml
#
# Maps logical model names to backend deployments.
# Paths:
# - Linux/macOS: ~/.deployment-proxy/config.toml
# - Windows:     %USERPROFILE%\.deployment-proxy\config.toml
# - DEPLOYMENT_PROXY_HOME overrides the directory; `serve --config` overrides the file.

version = 1

host = "127.0.0.1"
port = 8080

# Backend family used to rewrite requests. Only "azure" is available.
converter = "azure"
# Inbound path prefix removed before appending to /openai/deployments/{id}.
route_prefix = "/v1"
# Header the backend reads the credential from. Use "authorization" for Bearer auth.
auth_header = "api-key"

# Body fields removed before forwarding (`model` is always removed).
stripped_fields = ["top_p", "presence_penalty", "max_tokens"]

# Maximum inbound body size in bytes.
max_body_bytes = 10485760

# Defaults for deployments that omit them.
# endpoint = "https://your-resource.openai.azure.com"
# api_version = "2024-02-01"

[upstream]
# Unset means no proxy-side timeout.
# connect_timeout_ms = 5000
# request_timeout_ms = 600000

# One block per logical model.
#
# [[deployments]]
# model = "gpt-4o"
# deployment_id = "gpt-4o-prod"
# endpoint = "https://your-resource.openai.azure.com"
# api_version = "2024-02-01"
# # Prefer env-based secrets; without a key the caller's Bearer token is forwarded.
# api_key_env = "AZURE_OPENAI_KEY"
#
# [[deployments]]
# model = "text-embedding-ada-002"
# deployment_id = "ada-002"
"#;

pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    let dir = proxy_home_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_toml_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }

    if path.exists() {
        let backup_path = dir.join("config.toml.bak");
        if let Err(err) = fs::copy(&path, &backup_path).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
        }
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}
