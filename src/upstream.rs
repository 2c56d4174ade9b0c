use crate::accounts::Account;
use crate::config::RuntimeConfig;
use crate::normalize::GenerationRequest;
use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?');

const RATE_LIMIT_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "rate_limit",
    "too many requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Quota or rate limiting on this account; the next account may succeed.
    RateLimited,
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamFailure {
    pub status: Option<u16>,
    pub message: String,
    pub class: FailureClass,
}

impl UpstreamFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>, class: FailureClass) -> Self {
        Self {
            status,
            message: message.into(),
            class,
        }
    }

    /// Builds a failure whose class is derived from the status and message.
    pub fn classified(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(status, &message);
        Self::new(status, message, class)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.class == FailureClass::RateLimited
    }
}

/// HTTP 429, or any rate-limit/quota marker in the diagnostic text, is
/// `RateLimited`. Everything else is `Fatal`.
pub fn classify(status: Option<u16>, message: &str) -> FailureClass {
    if status == Some(429) {
        return FailureClass::RateLimited;
    }
    let lower = message.to_ascii_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        FailureClass::RateLimited
    } else {
        FailureClass::Fatal
    }
}

/// One generation call against the upstream API with one account. No retries.
#[async_trait]
pub trait ImageUpstream: Send + Sync {
    /// Returns the base64 image payload.
    async fn generate(
        &self,
        account: &Account,
        request: &GenerationRequest,
    ) -> Result<String, UpstreamFailure>;
}

#[derive(Clone)]
pub struct WorkersAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout_ms: u64,
}

impl WorkersAiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
            timeout_ms,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &RuntimeConfig) -> Self {
        Self::new(
            http,
            config.api_base_url.clone(),
            config.model.clone(),
            config.request_timeout_ms,
        )
    }

    pub fn endpoint(&self, account: &Account) -> String {
        let account_id = utf8_percent_encode(&account.account_id, PATH_SEGMENT);
        join_url(
            &self.base_url,
            &format!("accounts/{account_id}/ai/run/{}", self.model.trim_start_matches('/')),
        )
    }
}

#[async_trait]
impl ImageUpstream for WorkersAiClient {
    async fn generate(
        &self,
        account: &Account,
        request: &GenerationRequest,
    ) -> Result<String, UpstreamFailure> {
        let form = build_form(request)?;
        let resp = self
            .http
            .post(self.endpoint(account))
            .timeout(Duration::from_millis(self.timeout_ms))
            .bearer_auth(&account.token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| transport_failure(err, self.timeout_ms))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| transport_failure(err, self.timeout_ms))?;
        if !status.is_success() {
            return Err(UpstreamFailure::classified(
                Some(status.as_u16()),
                format!("upstream status {}: {}", status, text),
            ));
        }

        let value: Value = serde_json::from_str(&text).map_err(|err| {
            UpstreamFailure::new(
                Some(status.as_u16()),
                format!("invalid upstream response: {err}"),
                FailureClass::Fatal,
            )
        })?;
        extract_image(&value).map(str::to_string).ok_or_else(|| {
            UpstreamFailure::new(
                Some(status.as_u16()),
                "upstream response contained no image",
                FailureClass::Fatal,
            )
        })
    }
}

/// Where a successful response may carry the image, tried in this order.
pub const IMAGE_EXTRACTORS: &[(&str, fn(&Value) -> Option<&str>)] = &[
    ("result.image", image_in_result),
    ("image", image_at_top_level),
    ("result", result_as_image),
];

pub fn extract_image(value: &Value) -> Option<&str> {
    IMAGE_EXTRACTORS
        .iter()
        .filter_map(|(_, extract)| extract(value))
        .find(|image| !image.is_empty())
}

fn image_in_result(value: &Value) -> Option<&str> {
    value.get("result")?.get("image")?.as_str()
}

fn image_at_top_level(value: &Value) -> Option<&str> {
    value.get("image")?.as_str()
}

fn result_as_image(value: &Value) -> Option<&str> {
    value.get("result")?.as_str()
}

fn build_form(request: &GenerationRequest) -> Result<Form, UpstreamFailure> {
    let mut form = Form::new()
        .text("prompt", request.prompt().to_string())
        .text("steps", request.steps().to_string())
        .text("width", request.width().to_string())
        .text("height", request.height().to_string());
    if let Some(seed) = request.seed() {
        form = form.text("seed", seed.to_string());
    }
    for (i, image) in request.reference_images().iter().enumerate() {
        let file_name = image
            .file_name
            .clone()
            .unwrap_or_else(|| format!("input_image_{i}.png"));
        let mut part = Part::bytes(image.data.to_vec()).file_name(file_name);
        if let Some(content_type) = image
            .content_type
            .as_deref()
            .filter(|ct| ct.parse::<mime::Mime>().is_ok())
        {
            part = part.mime_str(content_type).map_err(|err| {
                UpstreamFailure::new(None, err.to_string(), FailureClass::Fatal)
            })?;
        }
        form = form.part(format!("input_image_{i}"), part);
    }
    Ok(form)
}

fn transport_failure(err: reqwest::Error, timeout_ms: u64) -> UpstreamFailure {
    let status = err.status().map(|s| s.as_u16());
    if err.is_timeout() {
        return UpstreamFailure::classified(
            status,
            format!("upstream request timed out after {timeout_ms}ms"),
        );
    }
    UpstreamFailure::classified(status, format!("upstream request failed: {err}"))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account(id: &str) -> Account {
        Account {
            index: 1,
            token: "tok".into(),
            account_id: id.into(),
        }
    }

    #[test]
    fn status_429_is_rate_limited() {
        assert_eq!(classify(Some(429), "slow down"), FailureClass::RateLimited);
    }

    #[test]
    fn body_markers_are_rate_limited_case_insensitively() {
        for body in [
            "Daily QUOTA exceeded",
            "Rate limit reached for account",
            "error: Too Many Requests",
            "{\"errors\":[{\"code\":\"rate_limit\"}]}",
        ] {
            assert_eq!(classify(Some(400), body), FailureClass::RateLimited, "{body}");
        }
    }

    #[test]
    fn other_failures_are_fatal() {
        assert_eq!(classify(Some(400), "invalid prompt"), FailureClass::Fatal);
        assert_eq!(classify(Some(500), "internal"), FailureClass::Fatal);
        assert_eq!(
            classify(None, "upstream request timed out after 100ms"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn extraction_strategies_run_in_order() {
        assert_eq!(
            extract_image(&json!({"result": {"image": "nested"}, "image": "top"})),
            Some("nested")
        );
        assert_eq!(extract_image(&json!({"image": "top"})), Some("top"));
        assert_eq!(extract_image(&json!({"result": "raw"})), Some("raw"));
        assert_eq!(
            extract_image(&json!({"result": {"image": ""}, "image": "top"})),
            Some("top")
        );
        assert_eq!(extract_image(&json!({"result": {"other": 1}})), None);
        assert_eq!(extract_image(&json!({"success": true})), None);
    }

    #[test]
    fn endpoint_embeds_account_and_model() {
        let client = WorkersAiClient::new(
            reqwest::Client::new(),
            "https://api.example.com/client/v4/",
            "@cf/black-forest-labs/flux-2-dev",
            1_000,
        );
        assert_eq!(
            client.endpoint(&account("abc123")),
            "https://api.example.com/client/v4/accounts/abc123/ai/run/@cf/black-forest-labs/flux-2-dev"
        );
        assert_eq!(
            client.endpoint(&account("a/b c")),
            "https://api.example.com/client/v4/accounts/a%2Fb%20c/ai/run/@cf/black-forest-labs/flux-2-dev"
        );
    }
}
