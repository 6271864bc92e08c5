use anyhow::{Context, Result, anyhow};
use globset::GlobBuilder;
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::{OffsetDateTime, format_description};
use tracing::{debug, error, info, warn};

use crate::prompts::{self, preview};
use crate::providers::{self, ImageProvider, ImageSource, ProviderKind};
use crate::script::{self, ComicScript, Panel};
use crate::settings::Settings;

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpg,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            other => Err(anyhow!("unsupported output format '{}' (expected png or jpg)", other)),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
        }
    }

    fn mime(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelStatus {
    Generated,
    Skipped,
    Failed,
    DownloadFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComicStatus {
    Success,
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct PanelResult {
    pub number: u32,
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: PanelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub title: String,
    pub slug: String,
    pub provider: String,
    pub status: ComicStatus,
    pub generated_at: String,
    pub panels: Vec<PanelResult>,
}

impl GenerationReport {
    pub fn count(&self, status: PanelStatus) -> usize {
        self.panels
            .iter()
            .filter(|panel| panel.status == status)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub skip_existing: bool,
}

pub struct ComicGenerator<P: ImageProvider> {
    provider: P,
    settings: Settings,
    options: GeneratorOptions,
}

impl<P: ImageProvider> ComicGenerator<P> {
    pub fn new(provider: P, settings: Settings, options: GeneratorOptions) -> Self {
        Self {
            provider,
            settings,
            options,
        }
    }

    pub fn panel_path(&self, slug: &str, number: u32) -> PathBuf {
        self.options.output_dir.join(format!(
            "comic-{}-panel{}.{}",
            slug,
            number,
            self.options.format.extension()
        ))
    }

    pub async fn generate_comic(&self, script_path: &Path) -> Result<GenerationReport> {
        let script = script::load_script(script_path)?;
        info!("processing: {}", script_path.display());
        info!("  title: {}", script.title);
        info!("  slug: {}", script.slug);
        info!("  panels: {}", script.panels.len());
        self.generate_script(&script).await
    }

    pub async fn generate_script(&self, script: &ComicScript) -> Result<GenerationReport> {
        fs::create_dir_all(&self.options.output_dir).with_context(|| {
            format!(
                "failed to create output directory: {}",
                self.options.output_dir.display()
            )
        })?;

        let mut panels = Vec::new();
        for panel in script.drawable_panels() {
            info!("panel {}: {}", panel.number, panel.title);
            panels.push(self.generate_panel(script, panel).await?);
        }

        let partial = panels.iter().any(|panel| {
            matches!(
                panel.status,
                PanelStatus::Failed | PanelStatus::DownloadFailed
            )
        });
        let generated_at = OffsetDateTime::now_utc()
            .format(&format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(GenerationReport {
            title: script.title.clone(),
            slug: script.slug.clone(),
            provider: self.provider.kind().as_str().to_string(),
            status: if partial {
                ComicStatus::Partial
            } else {
                ComicStatus::Success
            },
            generated_at,
            panels,
        })
    }

    async fn generate_panel(&self, script: &ComicScript, panel: &Panel) -> Result<PanelResult> {
        let output = self.panel_path(&script.slug, panel.number);
        if self.options.skip_existing && output.exists() {
            info!("  skipping (already exists): {}", output.display());
            return Ok(PanelResult {
                number: panel.number,
                file: Some(output.display().to_string()),
                url: None,
                status: PanelStatus::Skipped,
                error: None,
            });
        }

        let prompt = match self.provider.kind() {
            ProviderKind::OpenAI => prompts::render_openai_prompt(panel, script, &self.settings)?,
            ProviderKind::MidApi => prompts::render_midjourney_prompt(panel, &self.settings)?,
        };
        debug!("  prompt: {}", preview(&prompt, 150));

        let image = match self.provider.clone().generate(prompt).await {
            Ok(image) => image,
            Err(err) => {
                warn!("  failed to generate panel {}: {:#}", panel.number, err);
                return Ok(failed(panel.number, None, PanelStatus::Failed, err));
            }
        };
        let url = image.url().map(str::to_string);
        let bytes = match image.source {
            ImageSource::Bytes(bytes) => bytes,
            ImageSource::Url(url) => match providers::download_image(&url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("  generated but failed to download: {:#}", err);
                    return Ok(failed(
                        panel.number,
                        Some(url),
                        PanelStatus::DownloadFailed,
                        err,
                    ));
                }
            },
        };

        match save_panel(&bytes, &output, self.options.format) {
            Ok(()) => {
                info!("  saved: {}", output.display());
                Ok(PanelResult {
                    number: panel.number,
                    file: Some(output.display().to_string()),
                    url,
                    status: PanelStatus::Generated,
                    error: None,
                })
            }
            Err(err) => {
                warn!("  failed to save panel {}: {:#}", panel.number, err);
                Ok(failed(panel.number, url, PanelStatus::Failed, err))
            }
        }
    }

    pub async fn batch_generate(
        &self,
        scripts_dir: &Path,
        pattern: &str,
    ) -> Result<Vec<GenerationReport>> {
        let scripts = find_scripts(scripts_dir, pattern)?;
        if scripts.is_empty() {
            warn!(
                "no scripts found matching {} in {}",
                pattern,
                scripts_dir.display()
            );
            return Ok(Vec::new());
        }

        info!("batch generating {} comics", scripts.len());
        let mut reports = Vec::new();
        for path in scripts {
            match self.generate_comic(&path).await {
                Ok(report) => reports.push(report),
                Err(err) => error!("failed to process {}: {:#}", path.display(), err),
            }
        }

        let complete = reports
            .iter()
            .filter(|report| report.status == ComicStatus::Success)
            .count();
        let partial = reports.len() - complete;
        info!("summary: {} complete, {} partial", complete, partial);
        info!("output: {}", self.options.output_dir.display());
        Ok(reports)
    }
}

fn failed(number: u32, url: Option<String>, status: PanelStatus, err: anyhow::Error) -> PanelResult {
    PanelResult {
        number,
        file: None,
        url,
        status,
        error: Some(format!("{:#}", err)),
    }
}

/// Script files in `dir` whose file name matches `pattern`, sorted by name.
pub fn find_scripts(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid script pattern: {}", pattern))?
        .compile_matcher();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list scripts: {}", dir.display()))?;

    let mut scripts = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if matcher.is_match(name) {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// Writes the panel in `format`, converting when the provider returned
/// something else. PNG output also gets a JPEG sidecar.
pub fn save_panel(bytes: &[u8], path: &Path, format: OutputFormat) -> Result<()> {
    let sniffed = infer::get(bytes).map(|kind| kind.mime_type());
    let encoded = if sniffed == Some(format.mime()) {
        bytes.to_vec()
    } else {
        debug!(
            "converting {} to {}",
            sniffed.unwrap_or("unknown image"),
            format.mime()
        );
        let decoded =
            image::load_from_memory(bytes).with_context(|| "failed to decode generated image")?;
        match format {
            OutputFormat::Png => encode_png(&decoded)?,
            OutputFormat::Jpg => encode_jpeg(&decoded)?,
        }
    };
    write_atomic(path, &encoded)?;

    if format == OutputFormat::Png {
        let sidecar = path.with_extension("jpg");
        let result = image::load_from_memory(&encoded)
            .with_context(|| "failed to decode panel for JPEG copy")
            .and_then(|decoded| encode_jpeg(&decoded))
            .and_then(|jpeg| write_atomic(&sidecar, &jpeg));
        match result {
            Ok(()) => debug!("  also saved JPEG: {}", sidecar.display()),
            Err(err) => warn!("  could not create JPEG copy: {:#}", err),
        }
    }
    Ok(())
}

fn encode_png(image: &image::DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .with_context(|| "failed to encode PNG")?;
    Ok(bytes)
}

fn encode_jpeg(image: &image::DynamicImage) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .with_context(|| "failed to encode JPEG")?;
    Ok(bytes)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}
