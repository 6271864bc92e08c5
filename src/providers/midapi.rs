use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{GeneratedImage, ImageFuture, ImageProvider, ImageSource, ProviderKind};
use crate::prompts::preview;

const DEFAULT_BASE_URL: &str = "https://api.midapi.ai/v1";
const DEFAULT_MODEL: &str = "midjourney-v7";
const DEFAULT_MODE: &str = "fast";
const DEFAULT_ASPECT_RATIO: &str = "1:1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Midjourney through the MidAPI proxy: submit a job, then poll it.
#[derive(Debug, Clone)]
pub struct MidApi {
    key: String,
    base_url: String,
    model: String,
    mode: String,
    aspect_ratio: String,
    reference_url: Option<String>,
    poll_interval: Duration,
    max_wait: Duration,
    max_retries: usize,
    retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ImagineOutcome {
    Job(String),
    Direct(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Completed(String),
    Failed(String),
    Pending(String),
}

impl MidApi {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            mode: DEFAULT_MODE.to_string(),
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            reference_url: None,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(120),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
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

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        let mode = mode.into();
        if !mode.trim().is_empty() {
            self.mode = mode;
        }
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        let aspect_ratio = aspect_ratio.into();
        if !aspect_ratio.trim().is_empty() {
            self.aspect_ratio = aspect_ratio;
        }
        self
    }

    pub fn with_reference_url(mut self, reference_url: Option<String>) -> Self {
        self.reference_url = reference_url;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(100));
        self.max_wait = max_wait;
        self
    }

    pub fn with_retries(mut self, max_retries: usize, delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = delay;
        self
    }

    fn payload(&self, prompt: &str) -> Value {
        let mut payload = json!({
            "prompt": prompt,
            "model": self.model,
            "mode": self.mode,
            "aspect_ratio": self.aspect_ratio
        });
        if let Some(reference) = self.reference_url.as_deref() {
            payload["cref"] = json!(reference);
        }
        payload
    }
}

impl ImageProvider for MidApi {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MidApi
    }

    fn generate(self, prompt: String) -> ImageFuture {
        Box::pin(async move { imagine(self, prompt).await })
    }
}

async fn imagine(provider: MidApi, prompt: String) -> Result<GeneratedImage> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .with_context(|| "failed to build HTTP client")?;
    let url = format!("{}/imagine", provider.base_url);
    let body = provider.payload(&prompt);
    if let Some(reference) = provider.reference_url.as_deref() {
        info!("using character reference: {}", preview(reference, 50));
    }

    let max_attempts = provider.max_retries;
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        info!("generating with MidAPI (attempt {}/{})", attempt, max_attempts);
        let response = match client
            .post(&url)
            .bearer_auth(&provider.key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if attempt < max_attempts => {
                warn!("MidAPI request failed on attempt {}: {}", attempt, err);
                sleep(provider.retry_delay).await;
                continue;
            }
            Err(err) => return Err(err).with_context(|| "MidAPI request failed"),
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            if attempt < max_attempts {
                warn!("MidAPI error ({}): {}", status, text);
                sleep(provider.retry_delay).await;
                continue;
            }
            return Err(anyhow!("MidAPI error ({}): {}", status, text));
        }
        let outcome = match parse_imagine(&text) {
            Ok(outcome) => outcome,
            Err(err) if attempt < max_attempts => {
                warn!("unusable MidAPI response on attempt {}: {:#}", attempt, err);
                sleep(provider.retry_delay).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        let image_url = match outcome {
            ImagineOutcome::Direct(url) => url,
            ImagineOutcome::Job(job_id) => {
                info!("job started: {}", job_id);
                wait_for_job(&client, &provider, &job_id).await?
            }
        };
        return Ok(GeneratedImage {
            source: ImageSource::Url(image_url),
            revised_prompt: None,
        });
    }
}

async fn wait_for_job(client: &reqwest::Client, provider: &MidApi, job_id: &str) -> Result<String> {
    let url = format!("{}/job/{}", provider.base_url, job_id);
    let started = Instant::now();

    while started.elapsed() < provider.max_wait {
        match client
            .get(&url)
            .bearer_auth(&provider.key)
            .timeout(POLL_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(text) => match parse_job(&text) {
                    Ok(JobState::Completed(image_url)) => return Ok(image_url),
                    Ok(JobState::Failed(reason)) => {
                        return Err(anyhow!("MidAPI job {} failed: {}", job_id, reason));
                    }
                    Ok(JobState::Pending(status)) => debug!("job {} status: {}", job_id, status),
                    Err(err) => warn!("job {} poll returned an unreadable body: {:#}", job_id, err),
                },
                Err(err) => warn!("job {} poll body error: {}", job_id, err),
            },
            Ok(response) => warn!("job {} poll returned {}", job_id, response.status()),
            Err(err) => warn!("job {} poll error: {}", job_id, err),
        }
        sleep(provider.poll_interval).await;
    }

    Err(anyhow!(
        "timed out after {}s waiting for MidAPI job {}",
        provider.max_wait.as_secs(),
        job_id
    ))
}

#[derive(Debug, Deserialize)]
struct ImagineResponse {
    job_id: Option<String>,
    url: Option<String>,
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: Option<String>,
    url: Option<String>,
    image_url: Option<String>,
    output: Option<JobOutput>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JobOutput {
    url: Option<String>,
}

fn parse_imagine(text: &str) -> Result<ImagineOutcome> {
    let payload: ImagineResponse =
        serde_json::from_str(text).with_context(|| "failed to parse MidAPI imagine response")?;
    if let Some(job_id) = non_empty(payload.job_id) {
        return Ok(ImagineOutcome::Job(job_id));
    }
    if let Some(url) = non_empty(payload.url).or_else(|| non_empty(payload.image_url)) {
        return Ok(ImagineOutcome::Direct(url));
    }
    Err(anyhow!("unexpected MidAPI response: {}", text))
}

fn parse_job(text: &str) -> Result<JobState> {
    let payload: JobResponse =
        serde_json::from_str(text).with_context(|| "failed to parse MidAPI job response")?;
    let status = payload
        .status
        .unwrap_or_else(|| "unknown".to_string())
        .to_lowercase();
    match status.as_str() {
        "completed" => Ok(non_empty(payload.url)
            .or_else(|| non_empty(payload.image_url))
            .or_else(|| payload.output.and_then(|output| non_empty(output.url)))
            .map(JobState::Completed)
            .unwrap_or_else(|| JobState::Failed("completed without an image URL".to_string()))),
        "failed" => {
            let reason = match payload.error {
                Some(Value::String(message)) => message,
                Some(Value::Null) | None => "Unknown error".to_string(),
                Some(other) => other.to_string(),
            };
            Ok(JobState::Failed(reason))
        }
        _ => Ok(JobState::Pending(status)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{CannedResponse, serve_responses};

    fn local(base_url: &str) -> MidApi {
        MidApi::new("key")
            .with_base_url(base_url)
            .with_polling(Duration::from_millis(100), Duration::from_secs(5))
            .with_retries(3, Duration::from_millis(10))
    }

    #[test]
    fn imagine_prefers_job_then_direct_urls() {
        assert_eq!(
            parse_imagine(r#"{"job_id":"abc"}"#).unwrap(),
            ImagineOutcome::Job("abc".to_string())
        );
        assert_eq!(
            parse_imagine(r#"{"image_url":"https://x/y.png"}"#).unwrap(),
            ImagineOutcome::Direct("https://x/y.png".to_string())
        );
        let err = parse_imagine(r#"{"message":"queued"}"#).unwrap_err();
        assert!(err.to_string().contains("unexpected MidAPI response"));
    }

    #[test]
    fn completed_job_reads_nested_output_url() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/midapi_job_completed.json"
        ));
        assert_eq!(
            parse_job(payload).unwrap(),
            JobState::Completed("https://cdn.midapi.example/job-42/grid.png".to_string())
        );
    }

    #[test]
    fn failed_job_carries_reason() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/midapi_job_failed.json"
        ));
        assert_eq!(
            parse_job(payload).unwrap(),
            JobState::Failed("prompt rejected by moderation".to_string())
        );
        assert_eq!(
            parse_job(r#"{"status":"completed"}"#).unwrap(),
            JobState::Failed("completed without an image URL".to_string())
        );
    }

    #[test]
    fn unknown_status_keeps_waiting() {
        assert_eq!(
            parse_job(r#"{"status":"Processing"}"#).unwrap(),
            JobState::Pending("processing".to_string())
        );
        assert_eq!(
            parse_job("{}").unwrap(),
            JobState::Pending("unknown".to_string())
        );
    }

    #[test]
    fn payload_includes_reference_when_set() {
        let provider = MidApi::new("key")
            .with_mode("turbo")
            .with_reference_url(Some("https://ref/tr.png".to_string()));
        let payload = provider.payload("TR on deck.");
        assert_eq!(payload["mode"], "turbo");
        assert_eq!(payload["model"], "midjourney-v7");
        assert_eq!(payload["aspect_ratio"], "1:1");
        assert_eq!(payload["cref"], "https://ref/tr.png");

        let plain = MidApi::new("key").payload("TR on deck.");
        assert!(plain.get("cref").is_none());
    }

    #[tokio::test]
    async fn keeps_polling_past_unreadable_job_bodies() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(200, r#"{"job_id":"j1"}"#),
            CannedResponse::new(200, "<html>gateway hiccup</html>"),
            CannedResponse::new(200, r#"{"status":"processing"}"#),
            CannedResponse::new(200, r#"{"status":"completed","url":"https://x/ok.png"}"#),
        ])
        .await;

        let image = local(&base_url).generate("TR on deck.".to_string()).await.unwrap();

        assert_eq!(image.url(), Some("https://x/ok.png"));
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].starts_with("POST /imagine "));
        assert!(seen[1..].iter().all(|line| line.starts_with("GET /job/j1 ")));
    }

    #[tokio::test]
    async fn retries_unreadable_imagine_body_then_takes_direct_url() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(200, "<html>gateway hiccup</html>"),
            CannedResponse::new(200, r#"{"image_url":"https://x/direct.png"}"#),
        ])
        .await;

        let image = local(&base_url).generate("TR on deck.".to_string()).await.unwrap();

        assert_eq!(image.url(), Some("https://x/direct.png"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retries_server_errors_until_attempts_run_out() {
        let (base_url, seen) = serve_responses(vec![
            CannedResponse::new(502, "bad gateway"),
            CannedResponse::new(500, r#"{"error":"boom"}"#),
            CannedResponse::new(200, r#"{"url":"https://x/never.png"}"#),
        ])
        .await;

        let err = local(&base_url)
            .with_retries(2, Duration::from_millis(10))
            .generate("TR on deck.".to_string())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("MidAPI error (500"));
        assert!(err.to_string().contains("boom"));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn completed_job_without_url_is_fatal() {
        let (base_url, _) = serve_responses(vec![
            CannedResponse::new(200, r#"{"job_id":"j2"}"#),
            CannedResponse::new(200, r#"{"status":"completed"}"#),
        ])
        .await;

        let err = local(&base_url).generate("TR on deck.".to_string()).await.unwrap_err();

        assert!(err.to_string().contains("MidAPI job j2 failed"));
        assert!(err.to_string().contains("without an image URL"));
    }

    #[tokio::test]
    async fn gives_up_when_job_never_finishes() {
        let mut responses = vec![CannedResponse::new(200, r#"{"job_id":"slow"}"#)];
        responses.extend((0..20).map(|_| CannedResponse::new(200, r#"{"status":"queued"}"#)));
        let (base_url, _) = serve_responses(responses).await;

        let err = local(&base_url)
            .with_polling(Duration::from_millis(100), Duration::from_millis(350))
            .generate("TR on deck.".to_string())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("MidAPI job slow"));
    }
}
