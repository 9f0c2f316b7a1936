//! Method table and handlers for the reference sidecar.
//!
//! `translate` is a placeholder: it tags the input with the target language
//! instead of calling a real engine.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ServiceInfo;
use crate::ipc::protocol::JsonObject;

/// Methods the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Health,
    Translate,
    Shutdown,
    /// Test hook: exit with status 2 without answering.
    Crash,
}

impl Method {
    /// Methods reported in `health.capabilities`. `crash` is a test hook and
    /// is not advertised.
    pub const ADVERTISED: [Method; 3] = [Method::Health, Method::Translate, Method::Shutdown];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "health" => Some(Method::Health),
            "translate" => Some(Method::Translate),
            "shutdown" => Some(Method::Shutdown),
            "crash" => Some(Method::Crash),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Health => "health",
            Method::Translate => "translate",
            Method::Shutdown => "shutdown",
            Method::Crash => "crash",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResult {
    pub version: String,
    pub build: String,
    pub capabilities: Vec<&'static str>,
}

pub fn health(info: &ServiceInfo) -> HealthResult {
    HealthResult {
        version: info.version.clone(),
        build: info.build.clone(),
        capabilities: Method::ADVERTISED.iter().map(Method::name).collect(),
    }
}

/// Validated `translate` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslateRequest {
    pub text: String,
    pub to_lang: String,
    pub from_lang: Option<String>,
    /// Artificial latency used to exercise client timeouts.
    pub delay: Option<Duration>,
}

impl TranslateRequest {
    /// Validate `params`. The error string becomes the `invalid_params`
    /// message.
    pub fn from_params(params: &JsonObject) -> Result<Self, String> {
        let text = non_empty_string(params, "text")?;
        let to_lang = non_empty_string(params, "toLang")?;
        let from_lang = params
            .get("fromLang")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let delay = params
            .get("delayMs")
            .and_then(|v| v.as_u64())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            text,
            to_lang,
            from_lang,
            delay,
        })
    }
}

fn non_empty_string(params: &JsonObject, key: &str) -> Result<String, String> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(format!("params.{} must be a non-empty string", key)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResult {
    pub translated_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_lang: Option<String>,
    pub engine: &'static str,
    pub timing_ms: u64,
}

/// Run the placeholder translation, honoring the optional delay.
pub async fn translate(request: TranslateRequest) -> TranslateResult {
    let start = Instant::now();

    if let Some(delay) = request.delay {
        tokio::time::sleep(delay).await;
    }

    TranslateResult {
        translated_text: format!("[{}] {}", request.to_lang, request.text),
        detected_lang: request.from_lang,
        engine: "mock",
        timing_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_method_lookup() {
        assert_eq!(Method::from_name("health"), Some(Method::Health));
        assert_eq!(Method::from_name("crash"), Some(Method::Crash));
        assert_eq!(Method::from_name("Health"), None);
        assert_eq!(Method::from_name("__unknown__"), None);
    }

    #[test]
    fn test_health_capabilities() {
        let result = health(&ServiceInfo {
            version: "1.2.3".into(),
            build: "ci".into(),
        });
        assert_eq!(result.capabilities, vec!["health", "translate", "shutdown"]);
        assert_eq!(result.version, "1.2.3");
        assert_eq!(result.build, "ci");
    }

    #[test]
    fn test_translate_params_validation() {
        let missing_text = TranslateRequest::from_params(&params(json!({"toLang": "zh"})));
        assert_eq!(
            missing_text,
            Err("params.text must be a non-empty string".to_string())
        );

        let empty_lang =
            TranslateRequest::from_params(&params(json!({"text": "hi", "toLang": ""})));
        assert_eq!(
            empty_lang,
            Err("params.toLang must be a non-empty string".to_string())
        );

        let wrong_type = TranslateRequest::from_params(&params(json!({"text": 5, "toLang": "zh"})));
        assert!(wrong_type.is_err());
    }

    #[test]
    fn test_translate_params_optional_fields() {
        let request = TranslateRequest::from_params(&params(json!({
            "text": "hello",
            "toLang": "zh",
            "fromLang": "en",
            "delayMs": 25
        })))
        .unwrap();
        assert_eq!(request.from_lang.as_deref(), Some("en"));
        assert_eq!(request.delay, Some(Duration::from_millis(25)));

        let no_delay = TranslateRequest::from_params(&params(json!({
            "text": "hello",
            "toLang": "zh",
            "delayMs": -10
        })))
        .unwrap();
        assert_eq!(no_delay.delay, None);
    }

    #[tokio::test]
    async fn test_translate_output() {
        let input = params(json!({"text": "hello", "toLang": "zh"}));
        let request = TranslateRequest::from_params(&input).unwrap();
        let result = translate(request).await;

        assert_eq!(result.translated_text, "[zh] hello");
        assert_eq!(result.engine, "mock");
        assert_eq!(result.detected_lang, None);

        let encoded = serde_json::to_value(&result).unwrap();
        assert!(encoded.get("detectedLang").is_none());
        assert_eq!(encoded["translatedText"], json!("[zh] hello"));
    }

    #[tokio::test]
    async fn test_translate_delay_is_measured() {
        let request = TranslateRequest::from_params(&params(json!({
            "text": "slow",
            "toLang": "en",
            "delayMs": 30
        })))
        .unwrap();
        let result = translate(request).await;
        assert!(result.timing_ms >= 30, "timingMs was {}", result.timing_ms);
    }
}
