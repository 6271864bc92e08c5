use anyhow::{Context, Result, anyhow};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::settings::Settings;

mod midapi;
mod openai;
mod retry;

pub use midapi::MidApi;
pub use openai::OpenAI;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    MidApi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::MidApi => "midapi",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" | "dall-e" | "dalle" => Ok(ProviderKind::OpenAI),
            "midapi" | "midjourney" | "mj" => Ok(ProviderKind::MidApi),
            other => Err(anyhow!(
                "unknown provider '{}' (expected openai or midapi)",
                other
            )),
        }
    }

    fn key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::MidApi => "MIDAPI_KEY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub source: ImageSource,
    pub revised_prompt: Option<String>,
}

impl GeneratedImage {
    pub fn url(&self) -> Option<&str> {
        match &self.source {
            ImageSource::Url(url) => Some(url),
            ImageSource::Bytes(_) => None,
        }
    }
}

pub type ImageFuture = Pin<Box<dyn Future<Output = Result<GeneratedImage>> + Send>>;

pub trait ImageProvider: Clone + Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn generate(self, prompt: String) -> ImageFuture;
}

/// CLI values that take precedence over settings for a single run.
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub mode: Option<String>,
    pub reference_url: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    MidApi(MidApi),
}

impl ImageProvider for ProviderImpl {
    fn kind(&self) -> ProviderKind {
        match self {
            ProviderImpl::OpenAI(provider) => provider.kind(),
            ProviderImpl::MidApi(provider) => provider.kind(),
        }
    }

    fn generate(self, prompt: String) -> ImageFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.generate(prompt),
            ProviderImpl::MidApi(provider) => provider.generate(prompt),
        }
    }
}

pub fn build_provider(
    kind: ProviderKind,
    key: String,
    settings: &Settings,
    overrides: &ProviderOverrides,
) -> Result<ProviderImpl> {
    let max_retries = settings.generation.max_retries.max(1);
    match kind {
        ProviderKind::OpenAI => {
            let config = &settings.openai;
            let provider = OpenAI::new(key)
                .with_base_url(env_or("OPENAI_BASE_URL", &config.base_url))
                .with_model(pick(&overrides.model, &config.model))
                .with_size(pick(&overrides.size, &config.size))
                .with_quality(pick(&overrides.quality, &config.quality))
                .with_max_retries(max_retries);
            Ok(ProviderImpl::OpenAI(provider))
        }
        ProviderKind::MidApi => {
            let config = &settings.midapi;
            let mode = pick(&overrides.mode, &config.mode);
            if !matches!(mode.as_str(), "relaxed" | "fast" | "turbo") {
                return Err(anyhow!(
                    "invalid MidAPI mode '{}' (expected relaxed, fast or turbo)",
                    mode
                ));
            }
            let reference_url = overrides
                .reference_url
                .clone()
                .or_else(|| get_env("TR_REFERENCE_URL"))
                .or_else(|| config.reference_url.clone())
                .filter(|value| !value.trim().is_empty());
            let provider = MidApi::new(key)
                .with_base_url(env_or("MIDAPI_BASE_URL", &config.base_url))
                .with_model(pick(&overrides.model, &config.model))
                .with_mode(mode)
                .with_aspect_ratio(config.aspect_ratio.clone())
                .with_reference_url(reference_url)
                .with_polling(
                    Duration::from_secs(config.poll_interval_secs),
                    Duration::from_secs(config.max_wait_secs),
                )
                .with_retries(max_retries, Duration::from_secs(config.retry_delay_secs));
            Ok(ProviderImpl::MidApi(provider))
        }
    }
}

pub fn resolve_key(kind: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key.filter(|value| !value.trim().is_empty()) {
        return Ok(key.trim().to_string());
    }
    get_env(kind.key_env()).ok_or_else(|| {
        anyhow!(
            "API key not found for provider {} (set {} or pass --key)",
            kind.as_str(),
            kind.key_env()
        )
    })
}

pub async fn download_image(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .with_context(|| "failed to build HTTP client")?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to download image: {}", url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("image download failed ({}): {}", status, url));
    }
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read image body: {}", url))?;
    Ok(bytes.to_vec())
}

fn pick(value: &Option<String>, fallback: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn env_or(key: &str, fallback: &str) -> String {
    get_env(key).unwrap_or_else(|| fallback.to_string())
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
