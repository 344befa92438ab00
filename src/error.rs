use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::convert::ConversionError;
use crate::credential::CredentialSource;

/// Everything that can stop a request before (or while) it is forwarded.
///
/// Every variant is terminal for the request; the gateway never retries.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("no model found in request body, route or raw body")]
    ModelResolution,
    #[error("deployment config for {model} not found")]
    DeploymentNotFound { model: String },
    #[error("no credential available for model {model}: deployment has no key and request has no bearer token")]
    MissingCredential { model: String },
    #[error("{origin} credential for model {model} is not a valid header value")]
    InvalidCredential {
        model: String,
        origin: CredentialSource,
    },
    #[error("convert request error for model {model}: {source}")]
    Conversion {
        model: String,
        #[source]
        source: ConversionError,
    },
    #[error("upstream request for model {model} failed: {message}")]
    Transport { model: String, message: String },
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::BodyRead(_) => "body_read_error",
            ProxyError::MalformedBody(_) => "malformed_body",
            ProxyError::ModelResolution => "model_resolution_error",
            ProxyError::DeploymentNotFound { .. } => "deployment_not_found",
            ProxyError::MissingCredential { .. } => "missing_credential",
            ProxyError::InvalidCredential { .. } => "invalid_credential",
            ProxyError::Conversion { .. } => "conversion_error",
            ProxyError::Transport { .. } => "upstream_transport_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BodyRead(_)
            | ProxyError::MalformedBody(_)
            | ProxyError::ModelResolution => StatusCode::BAD_REQUEST,
            ProxyError::DeploymentNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::MissingCredential { .. } => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidCredential {
                origin: CredentialSource::Deployment,
                ..
            } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidCredential {
                origin: CredentialSource::Caller,
                ..
            } => StatusCode::BAD_REQUEST,
            ProxyError::Conversion { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Transport { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Builds a transport error from a reqwest failure.
    ///
    /// reqwest includes the request URL in its `Display`; the URL never
    /// carries a credential (keys travel in headers), so it is kept.
    pub fn transport(model: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connect"
        } else {
            "request"
        };
        ProxyError::Transport {
            model: model.to_string(),
            message: format!("{kind}: {err}"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_is_structured_json() {
        let err = ProxyError::DeploymentNotFound {
            model: "gpt-9".to_string(),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = to_bytes(resp.into_body(), 1024).await.expect("body");
        let v: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(v["error"]["code"], "deployment_not_found");
        assert_eq!(
            v["error"]["message"],
            "deployment config for gpt-9 not found"
        );
    }

    #[test]
    fn status_mapping_separates_client_and_upstream_failures() {
        assert_eq!(ProxyError::ModelResolution.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::MissingCredential {
                model: "m".to_string()
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::InvalidCredential {
                model: "m".to_string(),
                origin: CredentialSource::Deployment,
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::InvalidCredential {
                model: "m".to_string(),
                origin: CredentialSource::Caller,
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Transport {
                model: "m".to_string(),
                message: "connect: refused".to_string()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
