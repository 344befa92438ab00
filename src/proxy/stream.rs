use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Response, header};
use futures_util::{StreamExt, future, stream};
use tracing::{info, warn};

use crate::logging::{RequestLog, RequestLogger, StreamSummary};

use super::filter_response_headers;

/// Media type check that ignores parameters (`; charset=utf-8`) and case.
pub(super) fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|base| base.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

#[derive(Default)]
struct RelayState {
    bytes_relayed: u64,
    first_chunk_ms: Option<u64>,
    completed: bool,
    trailer_appended: bool,
    upstream_error: bool,
}

fn lock(state: &Mutex<RelayState>) -> MutexGuard<'_, RelayState> {
    match state.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// Writes the request log once the relay body is dropped, whether it ran to
/// completion or the caller went away mid-stream.
struct RelayFinalize {
    logger: RequestLogger,
    log: RequestLog,
    start: Instant,
    event_stream: bool,
    state: Arc<Mutex<RelayState>>,
}

impl Drop for RelayFinalize {
    fn drop(&mut self) {
        let summary = {
            let guard = lock(&self.state);
            StreamSummary {
                bytes_relayed: guard.bytes_relayed,
                first_chunk_ms: guard.first_chunk_ms,
                completed: guard.completed,
                trailer_appended: guard.trailer_appended,
                upstream_error: guard.upstream_error,
            }
        };
        let model = self.log.model.as_deref().unwrap_or("-");

        if !summary.completed && !summary.upstream_error {
            info!(
                "caller disconnected before [{}] {} finished ({} bytes relayed)",
                model, self.log.path, summary.bytes_relayed
            );
        }
        if self.event_stream && !summary.trailer_appended && !summary.upstream_error {
            warn!(
                "event-stream trailer not delivered for [{}] {}",
                model, self.log.path
            );
        }

        let mut log = std::mem::take(&mut self.log);
        log.duration_ms = self.start.elapsed().as_millis() as u64;
        log.stream = Some(summary);
        self.logger.log(&log);
    }
}

/// Streams the backend response back to the caller.
///
/// Status and end-to-end headers are passed through; an event-stream body
/// gets exactly one `\n` appended once the backend payload has ended.
pub(super) fn relay_response(
    resp: reqwest::Response,
    logger: RequestLogger,
    mut log: RequestLog,
    start: Instant,
) -> Response<Body> {
    let status = resp.status();
    let event_stream = is_event_stream(resp.headers());
    let headers = filter_response_headers(resp.headers());
    log.status_code = status.as_u16();
    if !status.is_success() {
        warn!(
            "upstream returned status {} for [{}] {}",
            status.as_u16(),
            log.model.as_deref().unwrap_or("-"),
            log.path
        );
    }

    let state = Arc::new(Mutex::new(RelayState::default()));
    let finalize = RelayFinalize {
        logger,
        log,
        start,
        event_stream,
        state: state.clone(),
    };

    let chunk_state = state.clone();
    let upstream = resp.bytes_stream().map(move |item| {
        let mut guard = lock(&chunk_state);
        match item {
            Ok(chunk) => {
                if guard.first_chunk_ms.is_none() {
                    guard.first_chunk_ms = Some(start.elapsed().as_millis() as u64);
                }
                guard.bytes_relayed += chunk.len() as u64;
                Ok(chunk)
            }
            Err(e) => {
                guard.upstream_error = true;
                warn!("upstream stream error: {}", e);
                Err(e)
            }
        }
    });

    // Polled once the upstream stream has ended.
    let trailer_state = state;
    let trailer = stream::once(async move {
        let mut guard = lock(&trailer_state);
        guard.completed = !guard.upstream_error;
        if event_stream && guard.completed {
            guard.trailer_appended = true;
            Some(Ok::<Bytes, reqwest::Error>(Bytes::from_static(b"\n")))
        } else {
            None
        }
    })
    .filter_map(move |item| {
        // Lives until the whole body is dropped.
        let _finalize = &finalize;
        future::ready(item)
    });

    let mut response = Response::new(Body::from_stream(upstream.chain(trailer)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
