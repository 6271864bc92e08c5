//! Speech bubble and caption lettering over generated panels.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use usvg::fontdb;

pub mod font;
pub mod layout;
pub mod render;

pub use font::OverlayFont;
pub use layout::{BubblePosition, BubbleStyle, SpeechBubble};
pub use render::OverlayStyle;

use crate::generator::write_atomic;
use crate::paths;
use crate::script::{self, ComicScript, Panel};
use crate::settings::{OverlaySettings, SpeakerRule};
use layout::{bubble_position_for, bubble_style_for};

#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub images_dir: PathBuf,
    pub output_dir: PathBuf,
    pub font_size: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverlaySummary {
    pub title: String,
    pub processed: usize,
    pub total: usize,
    pub outputs: Vec<PathBuf>,
}

pub struct OverlayTool {
    options: OverlayOptions,
    style: OverlayStyle,
    font: OverlayFont,
    fonts: Arc<fontdb::Database>,
    speakers: Vec<SpeakerRule>,
}

impl OverlayTool {
    /// Resolves the lettering font up front. Without one, text widths are
    /// estimated and rasterisation uses any installed sans-serif.
    pub fn new(settings: &OverlaySettings, options: OverlayOptions) -> Self {
        let font_path = configured_font_path(settings);
        let font = match font::resolve_overlay_font(font_path.as_deref(), settings.font_family.as_deref()) {
            Ok(font) => {
                debug!("overlay font: {}", font.family.as_deref().unwrap_or("unnamed"));
                font
            }
            Err(err) => {
                warn!("no overlay font available, estimating text widths: {:#}", err);
                OverlayFont::estimated(settings.font_family.clone())
            }
        };
        Self::with_font(settings, options, font)
    }

    pub fn with_font(settings: &OverlaySettings, options: OverlayOptions, font: OverlayFont) -> Self {
        let mut style = OverlayStyle::from_settings(settings, font.family.clone());
        if let Some(size) = options.font_size.filter(|size| *size > 0.0) {
            style.bubble_font_size = size;
        }
        let fonts = render::font_database(font.data());
        Self {
            options,
            style,
            font,
            fonts,
            speakers: settings.speakers.clone(),
        }
    }

    pub fn image_path(&self, slug: &str, number: u32) -> PathBuf {
        self.options
            .images_dir
            .join(format!("comic-{}-panel{}.png", slug, number))
    }

    pub fn output_path(&self, slug: &str, number: u32) -> PathBuf {
        self.options
            .output_dir
            .join(format!("comic-{}-panel{}-final.png", slug, number))
    }

    pub fn process_comic(&self, script_path: &Path) -> Result<OverlaySummary> {
        let script = script::load_script(script_path)?;
        info!("adding text overlays: {}", script_path.display());
        self.process_script(&script)
    }

    pub fn process_script(&self, script: &ComicScript) -> Result<OverlaySummary> {
        let mut summary = OverlaySummary {
            title: script.title.clone(),
            total: script.panels.len(),
            ..OverlaySummary::default()
        };
        if script.panels.is_empty() {
            warn!("no panels found in script");
            return Ok(summary);
        }
        fs::create_dir_all(&self.options.output_dir).with_context(|| {
            format!(
                "failed to create output dir: {}",
                self.options.output_dir.display()
            )
        })?;

        let last = script.panels.len() - 1;
        for (idx, panel) in script.panels.iter().enumerate() {
            // The document caption closes the comic unless the last panel has its own.
            let caption = if !panel.caption.trim().is_empty() {
                Some(panel.caption.as_str())
            } else if idx == last && !script.caption.trim().is_empty() {
                Some(script.caption.as_str())
            } else {
                None
            };
            if let Some(path) = self.process_panel(panel, &script.slug, caption)? {
                summary.processed += 1;
                summary.outputs.push(path);
            }
        }

        info!(
            "processed {}/{} panels into {}",
            summary.processed,
            summary.total,
            self.options.output_dir.display()
        );
        Ok(summary)
    }

    /// Letters one panel. Returns `None` when its image has not been
    /// generated yet.
    pub fn process_panel(&self, panel: &Panel, slug: &str, caption: Option<&str>) -> Result<Option<PathBuf>> {
        let image_path = self.image_path(slug, panel.number);
        if !image_path.is_file() {
            warn!("panel {} image not found: {}", panel.number, image_path.display());
            return Ok(None);
        }
        let image_bytes = fs::read(&image_path)
            .with_context(|| format!("failed to read panel image: {}", image_path.display()))?;

        let bubbles = panel_bubbles(panel, &self.speakers);
        debug!("panel {}: {} bubble(s)", panel.number, bubbles.len());
        let rendered = render::render_panel(
            &image_bytes,
            &bubbles,
            caption,
            &self.style,
            &self.font,
            &self.fonts,
        )
        .with_context(|| format!("failed to letter panel {}", panel.number))?;

        let output_path = self.output_path(slug, panel.number);
        write_atomic(&output_path, &rendered)?;
        info!("  panel {} -> {}", panel.number, output_path.display());
        Ok(Some(output_path))
    }
}

fn configured_font_path(settings: &OverlaySettings) -> Option<PathBuf> {
    settings
        .font_path
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| PathBuf::from(paths::expand_tilde(value)))
}

/// One bubble per dialogue line, placed and styled by speaker.
pub fn panel_bubbles(panel: &Panel, rules: &[SpeakerRule]) -> Vec<SpeechBubble> {
    panel
        .dialogue
        .iter()
        .filter(|line| !line.text.trim().is_empty())
        .map(|line| {
            let position = bubble_position_for(panel.number, &line.speaker, rules);
            SpeechBubble::new(line.text.clone(), line.speaker.clone(), position)
                .with_style(bubble_style_for(&line.speaker, &line.text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;
    use crate::settings::Settings;
    use std::io::Cursor;

    const SCRIPT: &str = r#"# Comic Draft

**Title:** Dock Day
**Slug:** dock-day

### Panel 1: Arrival

**Scene:** TR rows a tiny dinghy up to the fuel dock.

**Dialogue:**
TR: "Fill her up!"
Captain: "It's a rowboat."

### Panel 2: Departure

**Scene:** TR rows away, triumphant.

**Dialogue:**
TR (thinking): "Nailed it."

## Caption: Every legend starts somewhere.
"#;

    fn write_panel(path: &Path) {
        let image = image::RgbaImage::from_pixel(256, 256, image::Rgba([30, 120, 200, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn tool(root: &Path, font_size: Option<f32>) -> OverlayTool {
        OverlayTool::with_font(
            &Settings::default().overlay,
            OverlayOptions {
                images_dir: root.join("generated"),
                output_dir: root.join("final"),
                font_size,
            },
            OverlayFont::estimated(None),
        )
    }

    #[test]
    fn bubbles_follow_speakers_and_parity() {
        let script = parse_script(SCRIPT);
        let rules = Settings::default().overlay.speakers;

        let first = panel_bubbles(&script.panels[0], &rules);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].position, BubblePosition::TopRight);
        assert_eq!(first[0].style, BubbleStyle::Round);
        assert_eq!(first[1].position, BubblePosition::BottomLeft);

        let second = panel_bubbles(&script.panels[1], &rules);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].position, BubblePosition::TopCenter);
        assert_eq!(second[0].style, BubbleStyle::Thought);
    }

    #[test]
    fn letters_available_panels_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), None);
        fs::create_dir_all(dir.path().join("generated")).unwrap();
        write_panel(&tool.image_path("dock-day", 1));

        let script = parse_script(SCRIPT);
        let summary = tool.process_script(&script).unwrap();

        assert_eq!(summary.title, "Dock Day");
        assert_eq!(summary.total, 2);
        assert_eq!(summary.processed, 1);
        let expected = dir.path().join("final/comic-dock-day-panel1-final.png");
        assert_eq!(summary.outputs, vec![expected.clone()]);
        let rendered = image::open(&expected).unwrap();
        assert_eq!((rendered.width(), rendered.height()), (256, 256));
        assert!(!tool.output_path("dock-day", 2).exists());
    }

    #[test]
    fn process_comic_reads_script_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("comic-draft-dock-day.md");
        fs::write(&script_path, SCRIPT).unwrap();
        let tool = tool(dir.path(), Some(24.0));
        assert_eq!(tool.style.bubble_font_size, 24.0);

        let summary = tool.process_comic(&script_path).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.total, 2);
        assert!(summary.outputs.is_empty());
    }

    #[test]
    fn font_path_expands_home() {
        crate::test_util::with_temp_home(|home| {
            let mut settings = Settings::default().overlay;
            settings.font_path = Some("~/fonts/letters.ttf".to_string());
            assert_eq!(
                configured_font_path(&settings),
                Some(home.join("fonts/letters.ttf"))
            );

            settings.font_path = Some("  ".to_string());
            assert_eq!(configured_font_path(&settings), None);
        });
    }

    #[test]
    fn empty_script_yields_zero_summary() {
        let dir = tempfile::tempdir().unwrap();
        let summary = tool(dir.path(), None)
            .process_script(&parse_script("# Comic Draft\n\n**Title:** Nothing Yet\n"))
            .unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.processed, 0);
        assert!(!dir.path().join("final").exists());
    }
}
