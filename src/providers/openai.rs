use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::retry::{
    RATE_LIMIT_BASE_DELAY, is_rate_limited, next_delay, retry_after, wait_with_backoff,
};
use super::{GeneratedImage, ImageFuture, ImageProvider, ImageSource, ProviderKind};
use crate::prompts::preview;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "dall-e-3";
const DEFAULT_SIZE: &str = "1024x1024";
const DEFAULT_QUALITY: &str = "hd";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    base_url: String,
    model: String,
    size: String,
    quality: String,
    max_retries: usize,
    retry_delay: Duration,
}

impl OpenAI {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            size: DEFAULT_SIZE.to_string(),
            quality: DEFAULT_QUALITY.to_string(),
            max_retries: 3,
            retry_delay: RATE_LIMIT_BASE_DELAY,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        let size = size.into();
        if !size.trim().is_empty() {
            self.size = size;
        }
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        let quality = quality.into();
        if !quality.trim().is_empty() {
            self.quality = quality;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// First wait between attempts; later waits double from here.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

impl ImageProvider for OpenAI {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn generate(self, prompt: String) -> ImageFuture {
        Box::pin(async move { request_image(self, prompt).await })
    }
}

async fn request_image(provider: OpenAI, prompt: String) -> Result<GeneratedImage> {
    let client = reqwest::Client::new();
    let url = format!("{}/images/generations", provider.base_url);
    let body = json!({
        "model": provider.model,
        "prompt": prompt,
        "size": provider.size,
        "quality": provider.quality,
        "n": 1
    });

    let max_attempts = provider.max_retries;
    let mut attempt = 0usize;
    let mut delay = provider.retry_delay;
    loop {
        attempt += 1;
        info!("generating with OpenAI (attempt {}/{})", attempt, max_attempts);
        let response = match client
            .post(&url)
            .bearer_auth(&provider.key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if attempt < max_attempts => {
                warn!("OpenAI request failed on attempt {}: {}", attempt, err);
                sleep(delay).await;
                delay = next_delay(delay);
                continue;
            }
            Err(err) => return Err(err).with_context(|| "OpenAI request failed"),
        };

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            let image = extract_image(&text)?;
            if let Some(revised) = image.revised_prompt.as_deref() {
                info!("revised prompt: {}", preview(revised, 100));
            }
            return Ok(image);
        }
        if is_rate_limited(status, &text) && attempt < max_attempts {
            delay = wait_with_backoff("OpenAI", attempt, max_attempts, delay, retry_after).await;
            continue;
        }
        let message = extract_openai_error(&text).unwrap_or(text);
        if status.is_server_error() && attempt < max_attempts {
            warn!("OpenAI API error ({}) on attempt {}: {}", status, attempt, message);
            sleep(delay).await;
            delay = next_delay(delay);
            continue;
        }
        return Err(anyhow!("OpenAI API error ({}): {}", status, message));
    }
}

fn extract_image(text: &str) -> Result<GeneratedImage> {
    let payload: ImagesResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI images response")?;
    let data = payload
        .data
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no image returned from OpenAI"))?;
    let revised_prompt = data.revised_prompt.filter(|value| !value.trim().is_empty());

    let source = if let Some(url) = data.url.filter(|value| !value.trim().is_empty()) {
        ImageSource::Url(url)
    } else if let Some(encoded) = data.b64_json.filter(|value| !value.trim().is_empty()) {
        let bytes = BASE64
            .decode(encoded.trim())
            .with_context(|| "failed to decode OpenAI b64_json image")?;
        debug!("decoded {} bytes of inline image data", bytes.len());
        ImageSource::Bytes(bytes)
    } else {
        return Err(anyhow!("OpenAI response has neither url nor b64_json"));
    };

    Ok(GeneratedImage {
        source,
        revised_prompt,
    })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let mut parts = Vec::new();
    if let Some(message) = error.message.filter(|value| !value.trim().is_empty()) {
        parts.push(message);
    }
    if let Some(kind) = error.kind.filter(|value| !value.trim().is_empty()) {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = error.code.filter(|value| !value.trim().is_empty()) {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        Some("unknown error".to_string())
    } else {
        Some(parts.join(" | "))
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{CannedResponse, serve_responses};
    use tokio::time::Instant;

    const IMAGE_BODY: &str = r#"{"data":[{"url":"https://x/panel.png"}]}"#;

    fn local(base_url: &str) -> OpenAI {
        OpenAI::new("key")
            .with_base_url(base_url)
            .with_retry_delay(Duration::from_millis(10))
    }

    #[test]
    fn extracts_url_and_revised_prompt() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_image_url.json"
        ));
        let image = extract_image(payload).unwrap();
        assert_eq!(
            image.url(),
            Some("https://images.example.com/panel-1.png")
        );
        assert_eq!(
            image.revised_prompt.as_deref(),
            Some("A cartoon yacht owner in a captain's hat waving from a tiny dinghy.")
        );
    }

    #[test]
    fn decodes_inline_image_bytes() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_image_b64.json"
        ));
        let image = extract_image(payload).unwrap();
        assert_eq!(
            image.source,
            ImageSource::Bytes(vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
        );
        assert!(image.revised_prompt.is_none());
    }

    #[test]
    fn empty_data_is_an_error() {
        let err = extract_image(r#"{"created": 1, "data": []}"#).unwrap_err();
        assert!(err.to_string().contains("no image returned"));
    }

    #[test]
    fn formats_api_errors() {
        let body = r#"{"error":{"message":"Your request was rejected","type":"invalid_request_error","code":"content_policy_violation"}}"#;
        assert_eq!(
            extract_openai_error(body).as_deref(),
            Some(
                "Your request was rejected | type: invalid_request_error | code: content_policy_violation"
            )
        );
        assert_eq!(extract_openai_error("not json"), None);
    }

    #[tokio::test]
    async fn backs_off_on_rate_limit_then_succeeds() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(429, r#"{"error":{"message":"Rate limit reached"}}"#)
                .with_header("Retry-After", "0"),
            CannedResponse::new(200, IMAGE_BODY),
        ])
        .await;

        let image = local(&base_url).generate("TR waves.".to_string()).await.unwrap();

        assert_eq!(image.url(), Some("https://x/panel.png"));
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("POST /images/generations "));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(500, r#"{"error":{"message":"internal"}}"#),
            CannedResponse::new(200, IMAGE_BODY),
        ])
        .await;

        let image = local(&base_url).generate("TR waves.".to_string()).await.unwrap();

        assert_eq!(image.url(), Some("https://x/panel.png"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_at_once_with_api_message() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(
                400,
                r#"{"error":{"message":"Your request was rejected","code":"content_policy_violation"}}"#,
            ),
            CannedResponse::new(200, IMAGE_BODY),
        ])
        .await;

        let err = local(&base_url).generate("TR waves.".to_string()).await.unwrap_err();

        assert!(err.to_string().contains("OpenAI API error (400"));
        assert!(err.to_string().contains("Your request was rejected"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waits_between_transport_failures() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let started = Instant::now();
        let err = OpenAI::new("key")
            .with_base_url(&base_url)
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(200))
            .generate("TR waves.".to_string())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("OpenAI request failed"));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
