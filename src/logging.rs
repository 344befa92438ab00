use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use serde::Serialize;

use crate::config::proxy_home_dir;

fn env_bool(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

fn is_sensitive_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "authorization"
            | "proxy-authorization"
            | "cookie"
            | "set-cookie"
            | "api-key"
            | "x-api-key"
            | "x-goog-api-key"
    )
}

/// Header list safe to log: credential-carrying values are replaced.
pub fn redacted_headers(headers: &HeaderMap) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_ascii_lowercase();
            let value = if is_sensitive_header(&name_lower) || value.is_sensitive() {
                "[REDACTED]".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            HeaderEntry {
                name: name.as_str().to_string(),
                value,
            }
        })
        .collect()
}

/// One line of `requests.jsonl`.
#[derive(Debug, Serialize, Clone, Default)]
pub struct RequestLog {
    pub request_id: String,
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stripped_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamSummary>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub bytes_relayed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_ms: Option<u64>,
    pub completed: bool,
    pub trailer_appended: bool,
    pub upstream_error: bool,
}

#[derive(Debug, Clone, Copy)]
struct RequestLogOptions {
    enabled: bool,
    max_bytes: u64,
    max_files: usize,
    only_errors: bool,
}

fn request_log_options() -> RequestLogOptions {
    static OPT: OnceLock<RequestLogOptions> = OnceLock::new();
    *OPT.get_or_init(|| {
        let enabled = env_bool("DEPLOYMENT_PROXY_REQUEST_LOG").unwrap_or(true);
        let max_bytes = std::env::var("DEPLOYMENT_PROXY_REQUEST_LOG_MAX_BYTES")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(50 * 1024 * 1024);
        let max_files = std::env::var("DEPLOYMENT_PROXY_REQUEST_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(10);
        let only_errors = env_bool("DEPLOYMENT_PROXY_REQUEST_LOG_ONLY_ERRORS").unwrap_or(false);
        RequestLogOptions {
            enabled,
            max_bytes,
            max_files,
            only_errors,
        }
    })
}

fn request_log_path() -> PathBuf {
    proxy_home_dir().join("logs").join("requests.jsonl")
}

fn log_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn rotate_and_prune_if_needed(path: &Path, max_bytes: u64, max_files: usize) {
    if max_bytes == 0 {
        return;
    }
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < max_bytes {
        return;
    }

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("requests")
        .to_string();
    let rotated_path = path.with_file_name(format!("{prefix}.{}.jsonl", now_ms()));
    let _ = fs::rename(path, &rotated_path);

    let Some(dir) = path.parent() else {
        return;
    };
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    let mut rotated: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|s| s.starts_with(&format!("{prefix}.")) && s.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    if rotated.len() <= max_files {
        return;
    }
    rotated.sort();
    let remove_count = rotated.len() - max_files;
    for p in rotated.into_iter().take(remove_count) {
        let _ = fs::remove_file(p);
    }
}

fn append_line(path: &Path, entry: &RequestLog, max_bytes: u64, max_files: usize) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _guard = match log_lock().lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
    rotate_and_prune_if_needed(path, max_bytes, max_files);
    if let Ok(line) = serde_json::to_string(entry)
        && let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path)
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Destination of `requests.jsonl` lines; `None` means the file log is off.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    path: Option<PathBuf>,
}

impl RequestLogger {
    /// `~/.deployment-proxy/logs/requests.jsonl` unless `DEPLOYMENT_PROXY_REQUEST_LOG=0`.
    pub fn from_env() -> Self {
        Self {
            path: request_log_options().enabled.then(request_log_path),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends `entry`. Failures to write are ignored.
    pub fn log(&self, entry: &RequestLog) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let opt = request_log_options();
        if opt.only_errors && (200..300).contains(&entry.status_code) {
            return;
        }
        append_line(path, entry, opt.max_bytes, opt.max_files);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    #[test]
    fn redaction_covers_backend_and_caller_credentials() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer T"));
        h.insert("api-key", HeaderValue::from_static("K"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        let mut custom = HeaderValue::from_static("secret");
        custom.set_sensitive(true);
        h.insert("x-custom-auth", custom);

        let entries = redacted_headers(&h);
        let find = |n: &str| {
            entries
                .iter()
                .find(|e| e.name == n)
                .map(|e| e.value.clone())
                .expect("entry")
        };
        assert_eq!(find("authorization"), "[REDACTED]");
        assert_eq!(find("api-key"), "[REDACTED]");
        assert_eq!(find("x-custom-auth"), "[REDACTED]");
        assert_eq!(find("content-type"), "application/json");
    }

    #[test]
    fn log_lines_are_appended_and_rotated() {
        let dir = std::env::temp_dir().join(format!("deployment-proxy-log-{}", uuid::Uuid::new_v4()));
        let path = dir.join("requests.jsonl");
        let entry = RequestLog {
            timestamp_ms: 1,
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            status_code: 200,
            model: Some("gpt-4".to_string()),
            ..Default::default()
        };

        append_line(&path, &entry, 1024 * 1024, 2);
        append_line(&path, &entry, 1024 * 1024, 2);
        let text = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(text.lines().count(), 2);
        let first: serde_json::Value =
            serde_json::from_str(text.lines().next().expect("line")).expect("json");
        assert_eq!(first["model"], "gpt-4");
        assert!(first.get("error_code").is_none());

        // A tiny size cap forces the existing file to be rotated away.
        append_line(&path, &entry, 1, 2);
        let rotated = std::fs::read_dir(&dir)
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("requests."))
            .filter(|e| e.file_name() != "requests.jsonl")
            .count();
        assert_eq!(rotated, 1);
        assert_eq!(
            std::fs::read_to_string(&path).expect("read").lines().count(),
            1
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn request_logger_writes_only_to_its_own_path() {
        let dir = std::env::temp_dir().join(format!("deployment-proxy-log-{}", uuid::Uuid::new_v4()));
        let logger = RequestLogger::at(dir.join("requests.jsonl"));
        assert_eq!(logger.path(), Some(dir.join("requests.jsonl").as_path()));

        logger.log(&RequestLog {
            request_id: "req-1".to_string(),
            status_code: 404,
            error_code: Some("deployment_not_found"),
            ..Default::default()
        });
        let text = std::fs::read_to_string(dir.join("requests.jsonl")).expect("read log");
        let line: serde_json::Value = serde_json::from_str(text.trim()).expect("json");
        assert_eq!(line["request_id"], "req-1");
        assert_eq!(line["error_code"], "deployment_not_found");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
