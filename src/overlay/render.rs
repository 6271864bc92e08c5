use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use resvg::render;
use std::fmt::Write as _;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use super::font::OverlayFont;
use super::layout::{
    BubbleLayout, BubbleShape, CaptionLayout, SpeechBubble, TextLine, TextMeasure, layout_bubble,
    layout_caption,
};
use crate::settings::OverlaySettings;

/// Colours and sizes for lettering, resolved from overlay settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub font_family: Option<String>,
    pub bubble_font_size: f32,
    pub label_font_size: f32,
    pub caption_font_size: f32,
    pub text_color: String,
    pub fill_color: String,
    pub stroke_color: String,
    pub label_color: String,
    pub caption_text_color: String,
    pub caption_fill_color: String,
    pub caption_stroke_color: String,
}

impl OverlayStyle {
    pub fn from_settings(settings: &OverlaySettings, font_family: Option<String>) -> Self {
        Self {
            font_family,
            bubble_font_size: settings.bubble_font_size,
            label_font_size: settings.label_font_size,
            caption_font_size: settings.caption_font_size,
            text_color: settings.text_color.clone(),
            fill_color: settings.fill_color.clone(),
            stroke_color: settings.stroke_color.clone(),
            label_color: settings.label_color.clone(),
            caption_text_color: settings.caption_text_color.clone(),
            caption_fill_color: settings.caption_fill_color.clone(),
            caption_stroke_color: settings.caption_stroke_color.clone(),
        }
    }
}

/// Letters one panel image and returns it PNG encoded.
pub fn render_panel(
    image_bytes: &[u8],
    bubbles: &[SpeechBubble],
    caption: Option<&str>,
    style: &OverlayStyle,
    font: &OverlayFont,
    fonts: &Arc<fontdb::Database>,
) -> Result<Vec<u8>> {
    let image = image::load_from_memory(image_bytes).with_context(|| "failed to decode panel image")?;
    let (width, height) = (image.width(), image.height());
    let mime = infer::get(image_bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or("image/png");

    let layouts = bubbles
        .iter()
        .filter(|bubble| !bubble.text.trim().is_empty())
        .map(|bubble| {
            layout_bubble(
                bubble,
                width as f32,
                height as f32,
                style.bubble_font_size,
                font,
            )
        })
        .collect::<Vec<_>>();
    let caption = caption.and_then(|text| {
        layout_caption(
            text,
            width as f32,
            height as f32,
            style.caption_font_size,
            font,
        )
    });

    let svg = render_svg(
        image_bytes,
        mime,
        width,
        height,
        &layouts,
        caption.as_ref(),
        style,
        font,
    );
    render_svg_bytes(&svg, fonts)
}

#[allow(clippy::too_many_arguments)]
pub fn render_svg(
    image_bytes: &[u8],
    image_mime: &str,
    width: u32,
    height: u32,
    bubbles: &[BubbleLayout],
    caption: Option<&CaptionLayout>,
    style: &OverlayStyle,
    measure: &dyn TextMeasure,
) -> String {
    let encoded = BASE64.encode(image_bytes);
    let data_uri = format!("data:{};base64,{}", image_mime, encoded);

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    );
    let _ = write!(
        svg,
        r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
        uri = data_uri,
        w = width,
        h = height
    );

    for bubble in bubbles {
        push_bubble_shape(&mut svg, bubble, style);
        for line in &bubble.lines {
            push_text(
                &mut svg,
                line,
                TextPaint {
                    size: style.bubble_font_size,
                    color: &style.text_color,
                    weight: "bold",
                    italic: false,
                },
                style,
                measure,
            );
        }
        if let Some(label) = &bubble.label {
            push_text(
                &mut svg,
                label,
                TextPaint {
                    size: style.label_font_size,
                    color: &style.label_color,
                    weight: "normal",
                    italic: true,
                },
                style,
                measure,
            );
        }
    }

    if let Some(caption) = caption {
        let rect = caption.rect;
        let _ = write!(
            svg,
            r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{fill}" stroke="{stroke}" stroke-width="1"/>"#,
            x = rect.x,
            y = rect.y,
            w = rect.w,
            h = rect.h,
            fill = escape_xml(&style.caption_fill_color),
            stroke = escape_xml(&style.caption_stroke_color)
        );
        for line in &caption.lines {
            push_text(
                &mut svg,
                line,
                TextPaint {
                    size: style.caption_font_size,
                    color: &style.caption_text_color,
                    weight: "normal",
                    italic: false,
                },
                style,
                measure,
            );
        }
    }

    svg.push_str("</svg>");
    svg
}

fn push_bubble_shape(svg: &mut String, bubble: &BubbleLayout, style: &OverlayStyle) {
    let rect = bubble.rect;
    let fill = escape_xml(&style.fill_color);
    let stroke = escape_xml(&style.stroke_color);
    match &bubble.shape {
        BubbleShape::Rounded { radius, tail } => {
            let _ = write!(
                svg,
                r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" rx="{r}" ry="{r}" fill="{fill}" stroke="{stroke}" stroke-width="2"/>"#,
                x = rect.x,
                y = rect.y,
                w = rect.w,
                h = rect.h,
                r = radius,
                fill = fill,
                stroke = stroke
            );
            let _ = write!(
                svg,
                r#"<polygon points="{points}" fill="{fill}" stroke="{stroke}" stroke-width="2"/>"#,
                points = polygon_points(tail),
                fill = fill,
                stroke = stroke
            );
        }
        BubbleShape::Square => {
            let _ = write!(
                svg,
                r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{fill}" stroke="{stroke}" stroke-width="2"/>"#,
                x = rect.x,
                y = rect.y,
                w = rect.w,
                h = rect.h,
                fill = fill,
                stroke = stroke
            );
        }
        BubbleShape::Thought { trail } => {
            for ellipse in std::iter::once(&rect).chain(trail.iter()) {
                let _ = write!(
                    svg,
                    r#"<ellipse cx="{cx}" cy="{cy}" rx="{rx}" ry="{ry}" fill="{fill}" stroke="{stroke}" stroke-width="2"/>"#,
                    cx = ellipse.x + ellipse.w / 2.0,
                    cy = ellipse.y + ellipse.h / 2.0,
                    rx = ellipse.w / 2.0,
                    ry = ellipse.h / 2.0,
                    fill = fill,
                    stroke = stroke
                );
            }
        }
        BubbleShape::Jagged { points } => {
            let _ = write!(
                svg,
                r#"<polygon points="{points}" fill="{fill}" stroke="{stroke}" stroke-width="3"/>"#,
                points = polygon_points(points),
                fill = fill,
                stroke = stroke
            );
        }
    }
}

struct TextPaint<'a> {
    size: f32,
    color: &'a str,
    weight: &'a str,
    italic: bool,
}

fn push_text(
    svg: &mut String,
    line: &TextLine,
    paint: TextPaint<'_>,
    style: &OverlayStyle,
    measure: &dyn TextMeasure,
) {
    let baseline = line.y + measure.ascent(paint.size);
    let family = style
        .font_family
        .as_deref()
        .map(|family| format!(r#" font-family="{}""#, escape_xml(family)))
        .unwrap_or_default();
    let slant = if paint.italic {
        r#" font-style="italic""#
    } else {
        ""
    };
    let _ = write!(
        svg,
        r#"<text x="{x}" y="{y}" font-size="{size}" font-weight="{weight}" fill="{color}"{family}{slant}>{text}</text>"#,
        x = line.x,
        y = baseline,
        size = paint.size,
        weight = paint.weight,
        color = escape_xml(paint.color),
        family = family,
        slant = slant,
        text = escape_xml(&line.text)
    );
}

fn polygon_points(points: &[(f32, f32)]) -> String {
    points
        .iter()
        .map(|(x, y)| format!("{},{}", x, y))
        .collect::<Vec<_>>()
        .join(" ")
}

/// System fonts plus the lettering font, loaded once and shared by every
/// panel render.
pub fn font_database(font_data: Option<&[u8]>) -> Arc<fontdb::Database> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    if let Some(data) = font_data {
        db.load_font_data(data.to_vec());
    }
    Arc::new(db)
}

pub fn render_svg_bytes(svg: &str, fonts: &Arc<fontdb::Database>) -> Result<Vec<u8>> {
    let options = Options {
        fontdb: fonts.clone(),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    let mut pixmap_mut = pixmap.as_mut();
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);
    let image = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut cursor, image::ImageFormat::Png)
        .with_context(|| "failed to encode image from SVG")?;
    Ok(bytes)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::layout::{BubblePosition, BubbleStyle, EstimatedMeasure};
    use crate::settings::Settings;

    fn blank_panel(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([40, 90, 160, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn style() -> OverlayStyle {
        OverlayStyle::from_settings(&Settings::default().overlay, None)
    }

    #[test]
    fn svg_draws_each_bubble_style() {
        let style = style();
        let bubbles = [
            (BubbleStyle::Round, "<rect", "rx=\"20\""),
            (BubbleStyle::Thought, "<ellipse", "<ellipse"),
            (BubbleStyle::Shout, "<polygon", "stroke-width=\"3\""),
            (BubbleStyle::Square, "<rect", "stroke-width=\"2\""),
        ];
        for (bubble_style, shape, marker) in bubbles {
            let bubble = SpeechBubble::new("Ahoy", "TR", BubblePosition::Center).with_style(bubble_style);
            let layout = layout_bubble(&bubble, 400.0, 300.0, 18.0, &EstimatedMeasure);
            let svg = render_svg(b"png", "image/png", 400, 300, &[layout], None, &style, &EstimatedMeasure);
            let body = svg.split_once("preserveAspectRatio").unwrap().1;
            assert!(body.contains(shape), "{:?} missing {}", bubble_style, shape);
            assert!(body.contains(marker), "{:?} missing {}", bubble_style, marker);
        }
    }

    #[test]
    fn svg_escapes_text_and_letters_labels() {
        let bubble = SpeechBubble::new("Fish & <chips>", "Captain", BubblePosition::TopLeft);
        let layout = layout_bubble(&bubble, 400.0, 300.0, 18.0, &EstimatedMeasure);
        let caption = layout_caption("Later, at the dock.", 400.0, 300.0, 16.0, &EstimatedMeasure);
        let svg = render_svg(
            b"png",
            "image/png",
            400,
            300,
            &[layout],
            caption.as_ref(),
            &style(),
            &EstimatedMeasure,
        );
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("data:image/png;base64,cG5n"));
        assert!(svg.contains("Fish &amp; &lt;chips&gt;"));
        assert!(svg.contains("\u{2014} Captain"));
        assert!(svg.contains(r#"font-style="italic""#));
        assert!(svg.contains(r##"fill="#fffff0""##));
        assert!(svg.contains("Later, at the dock."));
        assert!(svg.ends_with("</svg>"));
    }

    #[test]
    fn render_panel_keeps_dimensions_and_paints_bubble() {
        let panel = blank_panel(320, 240);
        let bubbles = [SpeechBubble::new("Ahoy!", "TR", BubblePosition::TopLeft)];
        let png = render_panel(
            &panel,
            &bubbles,
            Some("Meanwhile..."),
            &style(),
            &OverlayFont::estimated(None),
            &font_database(None),
        )
        .unwrap();
        let rendered = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(rendered.dimensions(), (320, 240));
        // Inside the top-left bubble, clear of its text.
        assert_eq!(rendered.get_pixel(30, 60).0, [255, 255, 255, 255]);
        // Untouched background.
        assert_eq!(rendered.get_pixel(300, 120).0, [40, 90, 160, 255]);
    }

    #[test]
    fn render_panel_rejects_non_images() {
        let fonts = font_database(None);
        let err = render_panel(b"not an image", &[], None, &style(), &OverlayFont::default(), &fonts)
            .unwrap_err();
        assert!(err.to_string().contains("failed to decode panel image"));
    }

    #[test]
    fn one_font_database_serves_every_panel() {
        let fonts = font_database(None);
        let font = OverlayFont::estimated(None);
        for text in ["Ahoy!", "Land ho!"] {
            let bubbles = [SpeechBubble::new(text, "TR", BubblePosition::TopRight)];
            let png = render_panel(&blank_panel(200, 160), &bubbles, None, &style(), &font, &fonts).unwrap();
            assert_eq!(image::load_from_memory(&png).unwrap().width(), 200);
        }
        assert_eq!(Arc::strong_count(&fonts), 1);
    }
}
