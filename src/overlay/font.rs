use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

use super::layout::TextMeasure;

/// Tried in order when no font is configured. Bold weights are preferred.
pub const FALLBACK_FAMILIES: [&str; 5] = [
    "DejaVu Sans",
    "Liberation Sans",
    "Arial",
    "Helvetica",
    "sans-serif",
];

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    descender: i16,
    line_gap: i16,
    family: Option<String>,
    face_index: u32,
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn scale(&self, font_size: f32) -> f32 {
        font_size / self.units_per_em.max(1) as f32
    }
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("face_index", &self.face_index)
            .field("units_per_em", &self.units_per_em)
            .finish()
    }
}

/// The font used for lettering. Without metrics, widths are estimated
/// and the renderer falls back to whatever sans-serif resvg finds.
#[derive(Debug, Clone, Default)]
pub struct OverlayFont {
    pub metrics: Option<FontMetrics>,
    pub family: Option<String>,
}

impl OverlayFont {
    pub fn estimated(family: Option<String>) -> Self {
        Self {
            metrics: None,
            family,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.metrics.as_ref().map(FontMetrics::data)
    }
}

impl TextMeasure for OverlayFont {
    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        measure_text_width_px(text, font_size, self.metrics.as_ref())
    }

    fn line_height(&self, font_size: f32) -> f32 {
        match &self.metrics {
            Some(m) => {
                let units = m.ascender as f32 - m.descender as f32 + m.line_gap.max(0) as f32;
                (units * m.scale(font_size)).max(font_size)
            }
            None => font_size * 1.2,
        }
    }

    fn ascent(&self, font_size: f32) -> f32 {
        match &self.metrics {
            Some(m) if m.ascender > 0 => m.ascender as f32 * m.scale(font_size),
            _ => font_size * 0.95,
        }
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data, None)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

/// A configured path wins, then a configured family, then the first
/// fallback family installed on the system.
pub fn resolve_overlay_font(font_path: Option<&Path>, font_family: Option<&str>) -> Result<OverlayFont> {
    if let Some(path) = font_path {
        let metrics = load_font_metrics(path)?;
        let family = metrics
            .family()
            .map(|name| name.to_string())
            .or_else(|| font_family.map(|name| name.to_string()));
        return Ok(OverlayFont {
            metrics: Some(metrics),
            family,
        });
    }

    let mut db = fontdb::Database::new();
    db.load_system_fonts();

    if let Some(family) = font_family {
        return load_font_from_family(&db, family);
    }

    for candidate in FALLBACK_FAMILIES {
        if let Ok(resolved) = load_font_from_family(&db, candidate) {
            return Ok(resolved);
        }
    }

    Err(anyhow!("no fallback fonts found"))
}

pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font {
        if let Ok(face) = Face::parse(&font.data, font.face_index) {
            let mut advance = 0u32;
            for ch in text.chars() {
                if ch == '\n' {
                    continue;
                }
                let glyph_advance = face
                    .glyph_index(ch)
                    .and_then(|glyph| face.glyph_hor_advance(glyph))
                    .unwrap_or(font.space_advance);
                advance = advance.saturating_add(glyph_advance as u32);
            }
            return advance as f32 * font.scale(font_size);
        }
    }
    estimate_text_width_px(text, font_size)
}

/// Rough width for bold sans lettering.
pub(crate) fn estimate_text_width_px(text: &str, font_size: f32) -> f32 {
    text.chars().map(estimate_char_units).sum::<f32>() * font_size
}

fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.3
    } else if ch.is_ascii_uppercase() || ch.is_ascii_digit() {
        0.7
    } else if ch.is_ascii_alphanumeric() {
        0.6
    } else if ch.is_ascii() {
        0.4
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF
    ) {
        1.0
    } else {
        0.9
    }
}

/// Reads the face at `face_index`, or the first parseable face in the
/// collection when no index is given.
fn load_font_metrics_from_data(data: &[u8], face_index: Option<u32>) -> Result<FontMetrics> {
    let count = ttf_parser::fonts_in_collection(data).unwrap_or(1);
    let candidates = match face_index {
        Some(index) => index..index + 1,
        None => 0..count,
    };
    for index in candidates {
        let Ok(face) = Face::parse(data, index) else {
            continue;
        };
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2);
        return Ok(FontMetrics {
            data: Arc::new(data.to_vec()),
            units_per_em,
            space_advance,
            ascender: face.ascender(),
            descender: face.descender(),
            line_gap: face.line_gap(),
            family: extract_family_name(&face),
            face_index: index,
        });
    }
    Err(anyhow!("failed to parse font data"))
}

fn load_font_from_family(db: &fontdb::Database, family: &str) -> Result<OverlayFont> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        weight: fontdb::Weight::BOLD,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let (data, face_index) = db
        .with_face_data(id, |data, index| (data.to_vec(), index))
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let metrics = load_font_metrics_from_data(&data, Some(face_index))?;
    let resolved_family = metrics
        .family()
        .map(|name| name.to_string())
        .unwrap_or_else(|| family.to_string());
    Ok(OverlayFont {
        metrics: Some(metrics),
        family: Some(resolved_family),
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
