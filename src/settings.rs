use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

const DEFAULT_CHARACTER_DESCRIPTION: &str = "Chubby middle-aged man named TR (Tubby Retard), yacht owner character:
- Wearing a white captain's hat with gold anchor emblem
- Blue Hawaiian shirt with orange/red hibiscus flowers
- Khaki shorts
- Often smoking a cigar
- Overconfident, slightly oblivious expression
- Heavyset build, rosy cheeks
- Cartoon comic book style, bold outlines, vibrant colors";

const DEFAULT_COMIC_STYLE: &str = "Comic book panel style:
- Bold black outlines
- Vibrant saturated colors
- Cartoon illustration style
- Clear readable expressions
- Yachting/marina setting
- Slightly exaggerated proportions for humor";

const DEFAULT_CHARACTER_SHORT: &str = "chubby middle-aged man, white captain's hat with gold anchor emblem, blue Hawaiian shirt with orange hibiscus flowers, khaki shorts, cigar in mouth";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub character: CharacterSettings,
    pub generation: GenerationSettings,
    pub openai: OpenAiSettings,
    pub midapi: MidApiSettings,
    pub overlay: OverlaySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterSettings {
    pub name: String,
    pub description: String,
    pub style: String,
    pub short: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub output_dir: String,
    pub scripts_dir: String,
    pub pattern: String,
    pub format: String,
    pub max_retries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
    pub size: String,
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MidApiSettings {
    pub base_url: String,
    pub model: String,
    pub mode: String,
    pub aspect_ratio: String,
    pub reference_url: Option<String>,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySettings {
    pub output_dir: String,
    pub images_dir: String,
    pub font_family: Option<String>,
    pub font_path: Option<String>,
    pub bubble_font_size: f32,
    pub caption_font_size: f32,
    pub label_font_size: f32,
    pub text_color: String,
    pub fill_color: String,
    pub stroke_color: String,
    pub label_color: String,
    pub caption_text_color: String,
    pub caption_fill_color: String,
    pub caption_stroke_color: String,
    pub speakers: Vec<SpeakerRule>,
}

/// Where a speaker's bubble goes on odd and even numbered panels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeakerRule {
    pub name: String,
    pub odd: String,
    pub even: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            character: CharacterSettings {
                name: "TR".to_string(),
                description: DEFAULT_CHARACTER_DESCRIPTION.to_string(),
                style: DEFAULT_COMIC_STYLE.to_string(),
                short: DEFAULT_CHARACTER_SHORT.to_string(),
            },
            generation: GenerationSettings {
                output_dir: "comics/generated".to_string(),
                scripts_dir: "scripts".to_string(),
                pattern: "comic-draft-*.md".to_string(),
                format: "png".to_string(),
                max_retries: 3,
            },
            openai: OpenAiSettings {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "dall-e-3".to_string(),
                size: "1024x1024".to_string(),
                quality: "hd".to_string(),
            },
            midapi: MidApiSettings {
                base_url: "https://api.midapi.ai/v1".to_string(),
                model: "midjourney-v7".to_string(),
                mode: "fast".to_string(),
                aspect_ratio: "1:1".to_string(),
                reference_url: None,
                poll_interval_secs: 5,
                max_wait_secs: 120,
                retry_delay_secs: 5,
            },
            overlay: OverlaySettings {
                output_dir: "comics/final".to_string(),
                images_dir: "comics/generated".to_string(),
                font_family: None,
                font_path: None,
                bubble_font_size: 18.0,
                caption_font_size: 16.0,
                label_font_size: 14.0,
                text_color: "#000000".to_string(),
                fill_color: "#ffffff".to_string(),
                stroke_color: "#000000".to_string(),
                label_color: "#666666".to_string(),
                caption_text_color: "#333333".to_string(),
                caption_fill_color: "#fffff0".to_string(),
                caption_stroke_color: "#c8c8b4".to_string(),
                speakers: vec![
                    SpeakerRule {
                        name: "TR".to_string(),
                        odd: "top-right".to_string(),
                        even: "bottom-right".to_string(),
                    },
                    SpeakerRule {
                        name: "Captain".to_string(),
                        odd: "bottom-left".to_string(),
                        even: "top-left".to_string(),
                    },
                ],
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    character: Option<CharacterFile>,
    generation: Option<GenerationFile>,
    openai: Option<OpenAiFile>,
    midapi: Option<MidApiFile>,
    overlay: Option<OverlayFile>,
}

#[derive(Debug, Default, Deserialize)]
struct CharacterFile {
    name: Option<String>,
    description: Option<String>,
    style: Option<String>,
    short: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerationFile {
    output_dir: Option<String>,
    scripts_dir: Option<String>,
    pattern: Option<String>,
    format: Option<String>,
    max_retries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiFile {
    base_url: Option<String>,
    model: Option<String>,
    size: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MidApiFile {
    base_url: Option<String>,
    model: Option<String>,
    mode: Option<String>,
    aspect_ratio: Option<String>,
    reference_url: Option<String>,
    poll_interval_secs: Option<u64>,
    max_wait_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlayFile {
    output_dir: Option<String>,
    images_dir: Option<String>,
    font_family: Option<String>,
    font_path: Option<String>,
    bubble_font_size: Option<f32>,
    caption_font_size: Option<f32>,
    label_font_size: Option<f32>,
    text_color: Option<String>,
    fill_color: Option<String>,
    stroke_color: Option<String>,
    label_color: Option<String>,
    caption_text_color: Option<String>,
    caption_fill_color: Option<String>,
    caption_stroke_color: Option<String>,
    speakers: Option<Vec<SpeakerRule>>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];

    if let Some(home) = paths::settings_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .merge_toml(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    pub fn merge_toml(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed);
        Ok(())
    }

    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(character) = incoming.character {
            merge_string(&mut self.character.name, character.name);
            merge_string(&mut self.character.description, character.description);
            merge_string(&mut self.character.style, character.style);
            merge_string(&mut self.character.short, character.short);
        }
        if let Some(generation) = incoming.generation {
            merge_string(&mut self.generation.output_dir, generation.output_dir);
            merge_string(&mut self.generation.scripts_dir, generation.scripts_dir);
            merge_string(&mut self.generation.pattern, generation.pattern);
            merge_string(&mut self.generation.format, generation.format);
            if let Some(retries) = generation.max_retries.filter(|value| *value > 0) {
                self.generation.max_retries = retries;
            }
        }
        if let Some(openai) = incoming.openai {
            merge_string(&mut self.openai.base_url, openai.base_url);
            merge_string(&mut self.openai.model, openai.model);
            merge_string(&mut self.openai.size, openai.size);
            merge_string(&mut self.openai.quality, openai.quality);
        }
        if let Some(midapi) = incoming.midapi {
            merge_string(&mut self.midapi.base_url, midapi.base_url);
            merge_string(&mut self.midapi.model, midapi.model);
            merge_string(&mut self.midapi.mode, midapi.mode);
            merge_string(&mut self.midapi.aspect_ratio, midapi.aspect_ratio);
            merge_optional(&mut self.midapi.reference_url, midapi.reference_url);
            merge_secs(&mut self.midapi.poll_interval_secs, midapi.poll_interval_secs);
            merge_secs(&mut self.midapi.max_wait_secs, midapi.max_wait_secs);
            merge_secs(&mut self.midapi.retry_delay_secs, midapi.retry_delay_secs);
        }
        if let Some(overlay) = incoming.overlay {
            self.merge_overlay(overlay);
        }
    }

    fn merge_overlay(&mut self, overlay: OverlayFile) {
        let target = &mut self.overlay;
        merge_string(&mut target.output_dir, overlay.output_dir);
        merge_string(&mut target.images_dir, overlay.images_dir);
        merge_optional(&mut target.font_family, overlay.font_family);
        merge_optional(&mut target.font_path, overlay.font_path);
        merge_size(&mut target.bubble_font_size, overlay.bubble_font_size);
        merge_size(&mut target.caption_font_size, overlay.caption_font_size);
        merge_size(&mut target.label_font_size, overlay.label_font_size);
        merge_string(&mut target.text_color, overlay.text_color);
        merge_string(&mut target.fill_color, overlay.fill_color);
        merge_string(&mut target.stroke_color, overlay.stroke_color);
        merge_string(&mut target.label_color, overlay.label_color);
        merge_string(&mut target.caption_text_color, overlay.caption_text_color);
        merge_string(&mut target.caption_fill_color, overlay.caption_fill_color);
        merge_string(
            &mut target.caption_stroke_color,
            overlay.caption_stroke_color,
        );
        for rule in overlay.speakers.unwrap_or_default() {
            if rule.name.trim().is_empty() {
                continue;
            }
            match target
                .speakers
                .iter_mut()
                .find(|existing| existing.name.eq_ignore_ascii_case(rule.name.trim()))
            {
                Some(existing) => *existing = rule,
                None => target.speakers.push(rule),
            }
        }
    }
}

fn merge_string(target: &mut String, value: Option<String>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn merge_optional(target: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            *target = Some(value);
        }
    }
}

fn merge_size(target: &mut f32, value: Option<f32>) {
    if let Some(size) = value {
        if size > 0.0 {
            *target = size;
        }
    }
}

fn merge_secs(target: &mut u64, value: Option<u64>) {
    if let Some(secs) = value {
        if secs > 0 {
            *target = secs;
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = paths::settings_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}
