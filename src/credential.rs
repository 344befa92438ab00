use std::fmt;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::error::ProxyError;
use crate::registry::DeploymentConfig;

/// Header the backend expects the credential in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAuth {
    /// Raw token in a dedicated header, e.g. Azure's `api-key`.
    Header(HeaderName),
    /// `Authorization: Bearer <token>`.
    Bearer,
}

impl Default for BackendAuth {
    fn default() -> Self {
        BackendAuth::Header(HeaderName::from_static("api-key"))
    }
}

impl BackendAuth {
    pub fn from_header_name(name: &str) -> Result<Self, axum::http::header::InvalidHeaderName> {
        let name = HeaderName::try_from(name.trim())?;
        if name == AUTHORIZATION {
            Ok(BackendAuth::Bearer)
        } else {
            Ok(BackendAuth::Header(name))
        }
    }

    pub fn header_name(&self) -> HeaderName {
        match self {
            BackendAuth::Header(name) => name.clone(),
            BackendAuth::Bearer => AUTHORIZATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Deployment,
    Caller,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialSource::Deployment => "deployment",
            CredentialSource::Caller => "caller",
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    token: String,
    pub source: CredentialSource,
}

impl ResolvedCredential {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("token", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

/// Token from the caller's `Authorization` header, `Bearer ` prefix removed.
pub fn caller_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
    if token.trim().is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Deployment key first, caller bearer token second.
pub fn resolve_credential(
    deployment: &DeploymentConfig,
    client_headers: &HeaderMap,
) -> Result<ResolvedCredential, ProxyError> {
    if deployment.has_auth_key() {
        return Ok(ResolvedCredential {
            token: deployment.auth_key.clone(),
            source: CredentialSource::Deployment,
        });
    }
    if let Some(token) = caller_token(client_headers) {
        return Ok(ResolvedCredential {
            token: token.to_string(),
            source: CredentialSource::Caller,
        });
    }
    Err(ProxyError::MissingCredential {
        model: deployment.model.clone(),
    })
}

/// Drops the caller's `Authorization` and sets the backend auth header.
pub fn inject_credential(
    headers: &mut HeaderMap,
    auth: &BackendAuth,
    credential: &ResolvedCredential,
    model: &str,
) -> Result<(), ProxyError> {
    let value = match auth {
        BackendAuth::Header(_) => HeaderValue::from_str(credential.token()),
        BackendAuth::Bearer => HeaderValue::from_str(&format!("Bearer {}", credential.token())),
    };
    let mut value = value.map_err(|_| {
        warn!(
            "credential for model {} (source: {}) is not a valid header value",
            model,
            credential.source.as_str()
        );
        ProxyError::InvalidCredential {
            model: model.to_string(),
            origin: credential.source,
        }
    })?;
    value.set_sensitive(true);

    headers.remove(AUTHORIZATION);
    headers.insert(auth.header_name(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(key: &str) -> DeploymentConfig {
        DeploymentConfig {
            model: "gpt-4".to_string(),
            deployment_id: "gpt4".to_string(),
            api_version: "2024-02-01".to_string(),
            auth_key: key.to_string(),
            endpoint: "https://example.openai.azure.com".to_string(),
        }
    }

    fn headers_with_auth(v: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(v).expect("header"));
        h
    }

    #[test]
    fn deployment_key_wins_over_caller_token() {
        let cred = resolve_credential(&deployment("K"), &headers_with_auth("Bearer T"))
            .expect("credential");
        assert_eq!(cred.token(), "K");
        assert_eq!(cred.source, CredentialSource::Deployment);
    }

    #[test]
    fn caller_token_used_when_deployment_has_no_key() {
        let cred = resolve_credential(&deployment(""), &headers_with_auth("Bearer T"))
            .expect("credential");
        assert_eq!(cred.token(), "T");
        assert_eq!(cred.source, CredentialSource::Caller);
    }

    #[test]
    fn header_without_bearer_prefix_is_taken_whole() {
        let cred = resolve_credential(&deployment(""), &headers_with_auth("raw-token"))
            .expect("credential");
        assert_eq!(cred.token(), "raw-token");
    }

    #[test]
    fn no_key_and_no_token_is_missing_credential() {
        let err = resolve_credential(&deployment(""), &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ProxyError::MissingCredential { .. }));

        let err = resolve_credential(&deployment("  "), &headers_with_auth("Bearer ")).unwrap_err();
        assert!(matches!(err, ProxyError::MissingCredential { .. }));
    }

    #[test]
    fn inject_replaces_caller_authorization() {
        let mut headers = headers_with_auth("Bearer T");
        let cred = resolve_credential(&deployment("K"), &headers).expect("credential");
        inject_credential(&mut headers, &BackendAuth::default(), &cred, "gpt-4").expect("inject");
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(headers.get("api-key").expect("api-key"), "K");
    }

    #[test]
    fn bearer_backend_auth_rewrites_authorization() {
        let auth = BackendAuth::from_header_name("Authorization").expect("name");
        assert_eq!(auth, BackendAuth::Bearer);
        let mut headers = headers_with_auth("Bearer T");
        let cred = resolve_credential(&deployment("K"), &headers).expect("credential");
        inject_credential(&mut headers, &auth, &cred, "gpt-4").expect("inject");
        assert_eq!(headers.get(AUTHORIZATION).expect("auth"), "Bearer K");
        assert_eq!(headers.get_all(AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn unencodable_token_is_invalid_not_missing() {
        let cred = ResolvedCredential {
            token: "bad\nkey".to_string(),
            source: CredentialSource::Deployment,
        };
        let mut headers = headers_with_auth("Bearer T");
        let err = inject_credential(&mut headers, &BackendAuth::default(), &cred, "gpt-4")
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::InvalidCredential {
                origin: CredentialSource::Deployment,
                ..
            }
        ));
        assert_eq!(err.code(), "invalid_credential");
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("bad"));
        // Headers are left alone when injection fails.
        assert_eq!(headers.get(AUTHORIZATION).expect("auth"), "Bearer T");
        assert!(headers.get("api-key").is_none());
    }

    #[test]
    fn debug_output_never_shows_the_token() {
        let cred = resolve_credential(&deployment("secret-key"), &HeaderMap::new())
            .expect("credential");
        assert!(!format!("{cred:?}").contains("secret-key"));
    }
}
