use std::sync::OnceLock;

use axum::body::Bytes;
use regex::bytes::Regex;
use serde_json::{Map, Value};

use crate::error::ProxyError;

/// Fields removed from every forwarded body unless the config says otherwise.
pub const DEFAULT_STRIPPED_FIELDS: &[&str] = &["top_p", "presence_penalty", "max_tokens"];

const MODEL_FIELD: &str = "model";

/// Parsed inbound body with the model pulled out and stripped fields removed.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBody {
    /// `None` when the body had no `model`, or it was `null` / empty.
    pub model: Option<String>,
    /// Stripped fields that were actually present, in stripped-set order.
    pub removed: Vec<String>,
    pub fields: Map<String, Value>,
}

/// Output of [`RequestNormalizer::normalize`]: what the gateway forwards.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub model: String,
    pub model_source: ModelSource,
    pub removed: Vec<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Body,
    Route,
    RawBody,
}

impl ModelSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelSource::Body => "body",
            ModelSource::Route => "route",
            ModelSource::RawBody => "raw_body",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    stripped: Vec<String>,
}

impl Default for RequestNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPPED_FIELDS.iter().copied())
    }
}

impl RequestNormalizer {
    pub fn new<I, S>(stripped: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = Vec::new();
        for f in stripped {
            let f = f.into();
            // `model` is always removed separately; keeping it here would hide it from extraction.
            if f.trim().is_empty() || f == MODEL_FIELD || fields.contains(&f) {
                continue;
            }
            fields.push(f);
        }
        Self { stripped: fields }
    }

    pub fn stripped_fields(&self) -> &[String] {
        &self.stripped
    }

    pub fn parse(&self, raw: &[u8]) -> Result<NormalizedBody, ProxyError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ProxyError::MalformedBody(format!("invalid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(ProxyError::MalformedBody(
                "request body must be a JSON object".to_string(),
            ));
        };

        let model = match fields.remove(MODEL_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(ProxyError::MalformedBody(format!(
                    "field 'model' must be a string, got {}",
                    json_type_name(&other)
                )));
            }
        };

        let mut removed = Vec::new();
        for name in &self.stripped {
            if fields.remove(name).is_some() {
                removed.push(name.clone());
            }
        }

        Ok(NormalizedBody {
            model,
            removed,
            fields,
        })
    }

    /// Parses, strips and re-serializes `raw`, then settles the model name.
    ///
    /// Precedence: body `model`, then `route_model`, then a tolerant scan of
    /// the raw (pre-strip) bytes.
    pub fn normalize(
        &self,
        raw: &[u8],
        route_model: Option<&str>,
    ) -> Result<NormalizedRequest, ProxyError> {
        let NormalizedBody {
            model,
            removed,
            fields,
        } = self.parse(raw)?;

        let body = serde_json::to_vec(&Value::Object(fields))
            .map_err(|e| ProxyError::MalformedBody(format!("failed to re-serialize body: {e}")))?;

        let (model, model_source) = if let Some(m) = model {
            (m, ModelSource::Body)
        } else if let Some(m) = route_model.filter(|m| !m.trim().is_empty()) {
            (m.to_string(), ModelSource::Route)
        } else if let Some(m) = scan_model_from_raw(raw) {
            (m, ModelSource::RawBody)
        } else {
            return Err(ProxyError::ModelResolution);
        };

        Ok(NormalizedRequest {
            model,
            model_source,
            removed,
            body: Bytes::from(body),
        })
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn model_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""model"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("model pattern is valid")
    })
}

/// Finds the first non-empty `"model": "<string>"` pair anywhere in `raw`.
///
/// Does not require `raw` to be valid JSON as a whole.
pub fn scan_model_from_raw(raw: &[u8]) -> Option<String> {
    for caps in model_pattern().captures_iter(raw) {
        let Some(m) = caps.get(0) else {
            continue;
        };
        let Some(quoted_start) = caps.get(1).map(|c| c.start() - 1) else {
            continue;
        };
        // Re-parse the quoted literal so escapes are decoded the JSON way.
        let literal = &raw[quoted_start..m.end()];
        if let Ok(s) = serde_json::from_slice::<String>(literal)
            && !s.is_empty()
        {
            return Some(s);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn to_value(b: &[u8]) -> Value {
        serde_json::from_slice(b).expect("json")
    }

    #[test]
    fn model_is_extracted_and_removed_from_body() {
        let n = RequestNormalizer::default();
        let raw = br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
        let out = n.normalize(raw, None).expect("normalize");
        assert_eq!(out.model, "gpt-4");
        assert_eq!(out.model_source, ModelSource::Body);
        assert_eq!(
            to_value(&out.body),
            json!({"messages":[{"role":"user","content":"hi"}],"stream":true})
        );
        assert!(out.removed.is_empty());
    }

    #[test]
    fn stripped_fields_are_removed_and_others_kept() {
        let n = RequestNormalizer::default();
        let raw = br#"{"model":"gpt-4","top_p":0.9,"presence_penalty":1,"max_tokens":20,"temperature":0.2,"user":"u1"}"#;
        let out = n.normalize(raw, None).expect("normalize");
        assert_eq!(to_value(&out.body), json!({"temperature":0.2,"user":"u1"}));
        assert_eq!(
            out.removed,
            vec!["top_p".to_string(), "presence_penalty".to_string(), "max_tokens".to_string()]
        );
    }

    #[test]
    fn stripped_field_set_is_configurable() {
        let n = RequestNormalizer::new(["logit_bias", "model", ""]);
        assert_eq!(n.stripped_fields(), &["logit_bias".to_string()]);
        let raw = br#"{"model":"m","logit_bias":{},"top_p":1}"#;
        let out = n.normalize(raw, None).expect("normalize");
        assert_eq!(to_value(&out.body), json!({"top_p":1}));
    }

    #[test]
    fn body_model_wins_over_route() {
        let n = RequestNormalizer::default();
        let out = n
            .normalize(br#"{"model":"gpt-4","input":"x"}"#, Some("gpt-3.5"))
            .expect("normalize");
        assert_eq!(out.model, "gpt-4");
    }

    #[test]
    fn route_model_used_when_body_lacks_one() {
        let n = RequestNormalizer::default();
        let out = n
            .normalize(br#"{"input":"x","meta":{"model":"nested"}}"#, Some("ada-002"))
            .expect("normalize");
        assert_eq!(out.model, "ada-002");
        assert_eq!(out.model_source, ModelSource::Route);
    }

    #[test]
    fn empty_model_falls_back_to_route_then_raw_scan() {
        let n = RequestNormalizer::default();
        let raw = br#"{"model":"","metadata":{"model":"gpt-4o"}}"#;
        let out = n.normalize(raw, Some("")).expect("normalize");
        assert_eq!(out.model, "gpt-4o");
        assert_eq!(out.model_source, ModelSource::RawBody);
    }

    #[test]
    fn missing_model_everywhere_is_a_resolution_error() {
        let n = RequestNormalizer::default();
        let err = n.normalize(br#"{"messages":[]}"#, None).unwrap_err();
        assert!(matches!(err, ProxyError::ModelResolution));
    }

    #[test]
    fn non_string_model_is_malformed() {
        let n = RequestNormalizer::default();
        let err = n.normalize(br#"{"model":42}"#, Some("route")).unwrap_err();
        match err {
            ProxyError::MalformedBody(msg) => assert!(msg.contains("number"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unparseable_or_non_object_body_is_malformed() {
        let n = RequestNormalizer::default();
        assert!(matches!(
            n.normalize(b"", Some("m")).unwrap_err(),
            ProxyError::MalformedBody(_)
        ));
        assert!(matches!(
            n.normalize(b"{not json", Some("m")).unwrap_err(),
            ProxyError::MalformedBody(_)
        ));
        assert!(matches!(
            n.normalize(b"[1,2]", Some("m")).unwrap_err(),
            ProxyError::MalformedBody(_)
        ));
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let n = RequestNormalizer::default();
        let raw = br#"{"model":"gpt-4","top_p":1,"messages":[],"temperature":1}"#;
        let first = n.normalize(raw, None).expect("first");
        let second = n.normalize(&first.body, Some(&first.model)).expect("second");
        assert_eq!(to_value(&first.body), to_value(&second.body));
        assert_eq!(second.model, "gpt-4");
        assert!(second.removed.is_empty());
    }

    #[test]
    fn raw_scan_decodes_escapes_and_skips_empty_values() {
        assert_eq!(
            scan_model_from_raw(br#"{"model" : "", "x": {"model":"a\"b"}}"#),
            Some("a\"b".to_string())
        );
        assert_eq!(scan_model_from_raw(br#"{"model": 3}"#), None);
        assert_eq!(
            scan_model_from_raw(br#"garbage "model":"gpt-4" trailing"#),
            Some("gpt-4".to_string())
        );
    }
}
