use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};

pub mod generator;
pub mod logging;
pub mod overlay;
mod paths;
pub mod prompts;
pub mod providers;
pub mod script;
pub mod settings;
#[cfg(test)]
mod test_util;

pub use generator::{
    ComicGenerator, ComicStatus, GenerationReport, GeneratorOptions, OutputFormat, PanelStatus,
};
pub use overlay::{OverlayOptions, OverlaySummary, OverlayTool};
pub use providers::{ImageProvider, MidApi, OpenAI, ProviderKind};
pub use script::{ComicScript, DialogueLine, Panel};
pub use settings::Settings;

#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    pub script: Option<String>,
    pub batch: bool,
    pub scripts_dir: Option<String>,
    pub pattern: Option<String>,
    pub output: Option<String>,
    pub format: Option<String>,
    pub regenerate: bool,
    pub provider: String,
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub mode: Option<String>,
    pub reference_url: Option<String>,
    pub key: Option<String>,
    pub settings_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OverlayConfig {
    pub script: String,
    pub output: Option<String>,
    pub images_dir: Option<String>,
    pub font_size: Option<f32>,
    pub settings_path: Option<String>,
}

/// Generates panel images for one script or a batch and returns the
/// report(s) as pretty JSON.
pub async fn run_generate(config: GenerateConfig) -> Result<String> {
    if config.script.is_none() && !config.batch {
        return Err(anyhow!(
            "nothing to generate\n\nusage:\n  comic-forge generate <SCRIPT>\n  comic-forge generate --batch [--scripts-dir DIR] [--pattern GLOB]"
        ));
    }
    let settings = settings::load_settings(config.settings_path.as_deref().map(Path::new))?;

    let kind = ProviderKind::parse(&config.provider)?;
    let key = providers::resolve_key(kind, config.key.as_deref())?;
    let overrides = providers::ProviderOverrides {
        model: config.model,
        size: config.size,
        quality: config.quality,
        mode: config.mode,
        reference_url: config.reference_url,
    };
    let provider = providers::build_provider(kind, key, &settings, &overrides)?;

    let format = OutputFormat::parse(
        config
            .format
            .as_deref()
            .unwrap_or(&settings.generation.format),
    )?;
    let options = GeneratorOptions {
        output_dir: resolve_dir(config.output.as_deref(), &settings.generation.output_dir),
        format,
        skip_existing: !config.regenerate,
    };
    let scripts_dir = resolve_dir(config.scripts_dir.as_deref(), &settings.generation.scripts_dir);
    let pattern = config
        .pattern
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| settings.generation.pattern.clone());

    let generator = ComicGenerator::new(provider, settings, options);
    if config.batch {
        let reports = generator.batch_generate(&scripts_dir, &pattern).await?;
        return serde_json::to_string_pretty(&reports)
            .with_context(|| "failed to serialize generation reports");
    }

    let script = config
        .script
        .as_deref()
        .map(|value| PathBuf::from(paths::expand_tilde(value)))
        .ok_or_else(|| anyhow!("script path is required"))?;
    let report = generator.generate_comic(&script).await?;
    serde_json::to_string_pretty(&report).with_context(|| "failed to serialize generation report")
}

/// Letters the generated panels of one script and returns a short summary.
pub fn run_overlay(config: OverlayConfig) -> Result<String> {
    let settings = settings::load_settings(config.settings_path.as_deref().map(Path::new))?;
    let script = PathBuf::from(paths::expand_tilde(&config.script));
    if !script.is_file() {
        return Err(anyhow!("script not found: {}", script.display()));
    }

    let options = OverlayOptions {
        images_dir: resolve_dir(config.images_dir.as_deref(), &settings.overlay.images_dir),
        output_dir: resolve_dir(config.output.as_deref(), &settings.overlay.output_dir),
        font_size: config.font_size,
    };
    let tool = OverlayTool::new(&settings.overlay, options);
    let summary = tool.process_comic(&script)?;
    Ok(format_overlay_summary(&summary))
}

fn format_overlay_summary(summary: &OverlaySummary) -> String {
    let mut lines = vec![format!(
        "{}: {}/{} panels lettered",
        summary.title, summary.processed, summary.total
    )];
    for path in &summary.outputs {
        lines.push(format!("  {}", path.display()));
    }
    lines.join("\n")
}

fn resolve_dir(value: Option<&str>, fallback: &str) -> PathBuf {
    let value = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback);
    PathBuf::from(paths::expand_tilde(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_requires_script_or_batch() {
        let err = run_generate(GenerateConfig {
            provider: "openai".to_string(),
            ..GenerateConfig::default()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("nothing to generate"));
    }

    #[test]
    fn overlay_rejects_missing_script() {
        test_util::with_temp_home(|_| {
            let err = run_overlay(OverlayConfig {
                script: "/nonexistent/comic-draft-x.md".to_string(),
                ..OverlayConfig::default()
            })
            .unwrap_err();
            assert!(err.to_string().contains("script not found"));
        });
    }

    #[test]
    fn summary_lists_outputs() {
        let summary = OverlaySummary {
            title: "Dock Day".to_string(),
            processed: 1,
            total: 2,
            outputs: vec![PathBuf::from("final/comic-dock-day-panel1-final.png")],
        };
        assert_eq!(
            format_overlay_summary(&summary),
            "Dock Day: 1/2 panels lettered\n  final/comic-dock-day-panel1-final.png"
        );
    }

    #[test]
    fn cli_dirs_win_over_settings() {
        assert_eq!(resolve_dir(Some("out"), "comics/final"), PathBuf::from("out"));
        assert_eq!(resolve_dir(Some("  "), "comics/final"), PathBuf::from("comics/final"));
        assert_eq!(resolve_dir(None, "comics/final"), PathBuf::from("comics/final"));
    }
}
