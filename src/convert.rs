use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use reqwest::Url;
use thiserror::Error;

use crate::registry::DeploymentConfig;

/// Request as it travels through the pipeline.
///
/// `uri` starts out as the caller's origin-form URI; a converter replaces it
/// with the absolute backend URL.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid target url '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Rewrites a normalized request into one backend family's wire shape.
///
/// Implementations must leave `body` and the auth headers alone; the gateway
/// has already settled those.
pub trait RequestConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn convert(
        &self,
        request: ProxyRequest,
        deployment: &DeploymentConfig,
    ) -> Result<ProxyRequest, ConversionError>;
}

/// Parses a deployment endpoint and checks it can serve as a base URL.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, ConversionError> {
    let invalid = |reason: String| ConversionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = Url::parse(endpoint.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none() || url.cannot_be_a_base() {
        return Err(invalid("missing host".to_string()));
    }
    if url.query().is_some() {
        return Err(invalid("endpoint must not carry a query string".to_string()));
    }
    Ok(url)
}

/// Azure OpenAI: `{endpoint}/openai/deployments/{id}/{operation}?api-version=..`.
#[derive(Debug, Clone)]
pub struct AzureConverter {
    route_prefix: String,
}

impl Default for AzureConverter {
    fn default() -> Self {
        Self::new("/v1")
    }
}

impl AzureConverter {
    pub fn new(route_prefix: &str) -> Self {
        let trimmed = route_prefix.trim().trim_end_matches('/');
        let route_prefix = if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self { route_prefix }
    }

    /// Path below the deployment, e.g. `/v1/chat/completions` -> `/chat/completions`.
    fn operation_path<'a>(&self, path: &'a str) -> &'a str {
        let mut rest = path;
        if !self.route_prefix.is_empty() {
            if rest == self.route_prefix {
                rest = "";
            } else if rest.starts_with(&format!("{}/", self.route_prefix)) {
                rest = &rest[self.route_prefix.len()..];
            }
        }
        // Legacy `/engines/{model}/embeddings`: the engine segment is the deployment itself.
        if let Some(after) = rest.strip_prefix("/engines/") {
            rest = match after.find('/') {
                Some(idx) => &after[idx..],
                None => "",
            };
        }
        rest
    }
}

impl RequestConverter for AzureConverter {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn convert(
        &self,
        mut request: ProxyRequest,
        deployment: &DeploymentConfig,
    ) -> Result<ProxyRequest, ConversionError> {
        let mut url = parse_endpoint(&deployment.endpoint)?;
        if deployment.deployment_id.trim().is_empty() {
            return Err(ConversionError::Other(format!(
                "deployment for model {} has an empty deployment id",
                deployment.model
            )));
        }

        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ConversionError::InvalidEndpoint {
                    endpoint: deployment.endpoint.clone(),
                    reason: "endpoint cannot be a base url".to_string(),
                }
            })?;
            segments
                .pop_if_empty()
                .push("openai")
                .push("deployments")
                .push(&deployment.deployment_id);
        }
        let rest = self.operation_path(request.uri.path());
        if !rest.is_empty() {
            // Incoming path is already percent-encoded; append it as-is.
            let full = format!("{}{}", url.path(), rest);
            url.set_path(&full);
        }

        url.set_query(request.uri.query());
        let kept = url
            .query_pairs()
            .filter(|(k, _)| k != "api-version")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect::<Vec<_>>();
        url.set_query(None);
        {
            let mut q = url.query_pairs_mut();
            for (k, v) in &kept {
                q.append_pair(k, v);
            }
            q.append_pair("api-version", &deployment.api_version);
        }

        request.uri = url
            .as_str()
            .parse::<Uri>()
            .map_err(|e| ConversionError::InvalidTarget {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(request)
    }
}
