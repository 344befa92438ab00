use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::Path;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

mod stream;

use crate::convert::{ConversionError, ProxyRequest, RequestConverter};
use crate::credential::{BackendAuth, inject_credential, resolve_credential};
use crate::error::ProxyError;
use crate::logging::{RequestLog, RequestLogger, now_ms, redacted_headers};
use crate::normalize::RequestNormalizer;
use crate::registry::DeploymentRegistry;

use self::stream::relay_response;

/// Inbound body cap used when nothing else is configured.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str();
        // accept-encoding is dropped so event-stream bodies arrive uncompressed and the
        // trailing newline can be appended verbatim.
        if name_lower == "host"
            || name_lower == "content-length"
            || name_lower == "accept-encoding"
            || is_hop_by_hop_header(name_lower)
        {
            continue;
        }
        if extra.iter().any(|t| t == name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str();
        // The relayed body may differ from upstream length (event-stream trailer).
        if is_hop_by_hop_header(name_lower) || name_lower == "content-length" {
            continue;
        }
        if extra.iter().any(|t| t == name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// CORS preflight answer; never touches the pipeline.
pub fn preflight_response() -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS, POST"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    resp
}

/// Model-aware forwarding gateway.
///
/// Holds only read-only shared state; one clone is handed to every request.
#[derive(Clone)]
pub struct Gateway {
    client: Client,
    registry: Arc<DeploymentRegistry>,
    normalizer: Arc<RequestNormalizer>,
    converter: Arc<dyn RequestConverter>,
    auth: BackendAuth,
    max_body_bytes: usize,
    logger: RequestLogger,
}

impl Gateway {
    pub fn new(
        client: Client,
        registry: Arc<DeploymentRegistry>,
        converter: Arc<dyn RequestConverter>,
    ) -> Self {
        Self {
            client,
            registry,
            normalizer: Arc::new(RequestNormalizer::default()),
            converter,
            auth: BackendAuth::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            logger: RequestLogger::from_env(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: RequestNormalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn with_backend_auth(mut self, auth: BackendAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_request_logger(mut self, logger: RequestLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }

    /// Runs normalize → lookup → credential → convert. Any failure stops here.
    async fn prepare(
        &self,
        parts: Parts,
        body: Body,
        route_model: Option<&str>,
        log: &mut RequestLog,
    ) -> Result<ProxyRequest, ProxyError> {
        // The body can be consumed once; everything downstream works on this buffer.
        let raw_body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

        let normalized = self.normalizer.normalize(&raw_body, route_model)?;
        drop(raw_body);
        log.model = Some(normalized.model.clone());
        log.model_source = Some(normalized.model_source.as_str());
        log.stripped_fields = normalized.removed.clone();

        let deployment = self.registry.lookup(&normalized.model)?;
        log.deployment_id = Some(deployment.deployment_id.clone());

        let credential = resolve_credential(deployment, &parts.headers)?;
        log.credential_source = Some(credential.source.as_str());

        let mut headers = filter_request_headers(&parts.headers);
        inject_credential(&mut headers, &self.auth, &credential, &normalized.model)?;

        let request = ProxyRequest {
            method: parts.method,
            uri: parts.uri,
            headers,
            body: normalized.body,
        };
        let converted =
            self.converter
                .convert(request, deployment)
                .map_err(|source| ProxyError::Conversion {
                    model: normalized.model.clone(),
                    source,
                })?;
        log.target_url = Some(converted.uri.to_string());
        Ok(converted)
    }

    async fn forward(
        &self,
        request: ProxyRequest,
        model: &str,
    ) -> Result<reqwest::Response, ProxyError> {
        let target = reqwest::Url::parse(&request.uri.to_string()).map_err(|e| {
            ProxyError::Conversion {
                model: model.to_string(),
                source: ConversionError::InvalidTarget {
                    url: request.uri.to_string(),
                    reason: e.to_string(),
                },
            }
        })?;

        debug!(
            "outbound headers for [{}]: {:?}",
            model,
            redacted_headers(&request.headers)
        );

        self.client
            .request(request.method, target)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| ProxyError::transport(model, &e))
    }
}

fn finish_with_error(
    logger: &RequestLogger,
    mut log: RequestLog,
    start: Instant,
    err: ProxyError,
) -> Response<Body> {
    let status = err.status();
    if status.is_server_error() {
        warn!("request failed: {}", err);
    } else {
        info!("request rejected: {}", err);
    }
    log.status_code = status.as_u16();
    log.duration_ms = start.elapsed().as_millis() as u64;
    log.error_code = Some(err.code());
    logger.log(&log);
    err.into_response()
}

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Caller-supplied request id when it is a sane token, else a fresh uuid.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn with_request_id(mut resp: Response<Body>, id: &str) -> Response<Body> {
    if let Ok(v) = HeaderValue::from_str(id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn handle_proxy(
    gateway: Gateway,
    route_model: Option<String>,
    req: Request<Body>,
) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }

    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let id = request_id(&parts.headers);
    let origin_uri = parts.uri.to_string();
    let mut log = RequestLog {
        request_id: id.clone(),
        timestamp_ms: now_ms(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        ..Default::default()
    };

    let request = match gateway
        .prepare(parts, body, route_model.as_deref(), &mut log)
        .await
    {
        Ok(r) => r,
        Err(err) => return with_request_id(finish_with_error(&gateway.logger, log, start, err), &id),
    };
    let model = log.model.clone().unwrap_or_default();
    info!(
        "proxying request [{}] {} -> {} ({})",
        model, origin_uri, request.uri, id
    );

    let resp = match gateway.forward(request, &model).await {
        Ok(r) => r,
        Err(err) => return with_request_id(finish_with_error(&gateway.logger, log, start, err), &id),
    };
    with_request_id(relay_response(resp, gateway.logger.clone(), log, start), &id)
}

async fn list_models(gateway: Gateway) -> Json<serde_json::Value> {
    let data = gateway
        .registry()
        .deployments()
        .into_iter()
        .map(|d| model_object(&d.model))
        .collect::<Vec<_>>();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn get_model(gateway: Gateway, model: String) -> Result<Json<serde_json::Value>, ProxyError> {
    let d = gateway.registry().lookup(&model)?;
    Ok(Json(model_object(&d.model)))
}

fn model_object(model: &str) -> serde_json::Value {
    serde_json::json!({
        "id": model,
        "object": "model",
        "created": 0,
        "owned_by": "deployment-proxy",
    })
}

async fn preflight() -> Response<Body> {
    preflight_response()
}

async fn fallback(req: Request<Body>) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }
    let body = Json(serde_json::json!({
        "error": {
            "code": "route_not_found",
            "message": format!("no route for {} {}", req.method(), req.uri().path()),
        }
    }));
    (StatusCode::NOT_FOUND, body).into_response()
}

pub fn router(gateway: Gateway) -> Router {
    // In axum 0.8, path parameters use `/{param}`.
    let g_chat = gateway.clone();
    let g_completions = gateway.clone();
    let g_embeddings = gateway.clone();
    let g_engines = gateway.clone();
    let g_list = gateway.clone();
    let g_model = gateway.clone();

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/v1/chat/completions",
            post({
                let g = g_chat.clone();
                move |req| handle_proxy(g.clone(), None, req)
            })
            .options(move |req| handle_proxy(g_chat.clone(), None, req)),
        )
        .route(
            "/v1/completions",
            post({
                let g = g_completions.clone();
                move |req| handle_proxy(g.clone(), None, req)
            })
            .options(move |req| handle_proxy(g_completions.clone(), None, req)),
        )
        .route(
            "/v1/embeddings",
            post({
                let g = g_embeddings.clone();
                move |req| handle_proxy(g.clone(), None, req)
            })
            .options(move |req| handle_proxy(g_embeddings.clone(), None, req)),
        )
        .route(
            "/v1/engines/{model}/embeddings",
            post({
                let g = g_engines.clone();
                move |Path(model): Path<String>, req: Request<Body>| {
                    handle_proxy(g.clone(), Some(model), req)
                }
            })
            .options(move |req| handle_proxy(g_engines.clone(), None, req)),
        )
        .route(
            "/v1/models",
            get(move || list_models(g_list.clone())).options(preflight),
        )
        .route(
            "/v1/models/{model}",
            get(move |Path(model): Path<String>| get_model(g_model.clone(), model))
                .options(preflight),
        )
        .fallback(fallback)
}
