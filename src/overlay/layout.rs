//! Speech bubble and caption geometry.
//!
//! Everything here is pure: text measurement is injected through
//! [`TextMeasure`], so layouts can be computed and tested without fonts.

use crate::settings::SpeakerRule;

pub const BUBBLE_WRAP_CHARS: usize = 30;
pub const CAPTION_WRAP_CHARS: usize = 60;
pub const MIN_WRAP_CHARS: usize = 8;
pub const BUBBLE_PADDING: f32 = 15.0;
pub const LINE_SPACING: f32 = 5.0;
pub const BUBBLE_MAX_WIDTH: f32 = 300.0;
pub const EDGE_MARGIN: f32 = 20.0;
pub const CAPTION_RESERVE: f32 = 30.0;
pub const CORNER_RADIUS: f32 = 20.0;
pub const TAIL_HALF_WIDTH: f32 = 10.0;
pub const TAIL_HEIGHT: f32 = 15.0;
pub const SHOUT_STEP: usize = 15;
pub const LABEL_GAP: f32 = 5.0;
pub const CAPTION_LINE_HEIGHT: f32 = 20.0;
pub const CAPTION_PADDING: f32 = 10.0;
pub const CAPTION_INSET: f32 = 10.0;

// Fixed jitter so shout outlines are identical between runs.
const SHOUT_JITTER: [f32; 12] = [
    2.0, -3.0, 1.0, 3.0, -1.0, -2.0, 0.0, 3.0, -3.0, 1.0, -1.0, 2.0,
];

const UNLABELLED_SPEAKERS: [&str; 2] = ["narrator", "caption"];

pub trait TextMeasure {
    fn text_width(&self, text: &str, font_size: f32) -> f32;
    fn line_height(&self, font_size: f32) -> f32;
    fn ascent(&self, font_size: f32) -> f32;
}

/// Character-count based measurement used when no font is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatedMeasure;

impl TextMeasure for EstimatedMeasure {
    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        super::font::estimate_text_width_px(text, font_size)
    }

    fn line_height(&self, font_size: f32) -> f32 {
        font_size * 1.2
    }

    fn ascent(&self, font_size: f32) -> f32 {
        font_size * 0.95
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BubblePosition {
    TopLeft,
    TopRight,
    TopCenter,
    BottomLeft,
    BottomRight,
    BottomCenter,
    Center,
    Custom { x: f32, y: f32 },
}

impl BubblePosition {
    /// Parses `top-left`, `bottom-center`, `custom:120,40` and friends.
    /// Unrecognised names fall back to the top-right corner.
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_lowercase().replace('_', "-");
        if let Some(coords) = normalized.strip_prefix("custom:") {
            if let Some((x, y)) = coords.split_once(',') {
                if let (Ok(x), Ok(y)) = (x.trim().parse::<f32>(), y.trim().parse::<f32>()) {
                    return BubblePosition::Custom { x, y };
                }
            }
        }
        match normalized.as_str() {
            "top-left" => BubblePosition::TopLeft,
            "top-right" => BubblePosition::TopRight,
            "top-center" => BubblePosition::TopCenter,
            "bottom-left" => BubblePosition::BottomLeft,
            "bottom-right" => BubblePosition::BottomRight,
            "bottom-center" => BubblePosition::BottomCenter,
            "center" => BubblePosition::Center,
            _ => BubblePosition::TopRight,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BubbleStyle {
    Round,
    Square,
    Thought,
    Shout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechBubble {
    pub text: String,
    pub speaker: String,
    pub position: BubblePosition,
    pub style: BubbleStyle,
    pub max_width: f32,
}

impl SpeechBubble {
    pub fn new(text: impl Into<String>, speaker: impl Into<String>, position: BubblePosition) -> Self {
        Self {
            text: text.into(),
            speaker: speaker.into(),
            position,
            style: BubbleStyle::Round,
            max_width: BUBBLE_MAX_WIDTH,
        }
    }

    pub fn with_style(mut self, style: BubbleStyle) -> Self {
        self.style = style;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BubbleShape {
    Rounded {
        radius: f32,
        tail: [(f32, f32); 3],
    },
    Square,
    Thought {
        trail: [Rect; 2],
    },
    Jagged {
        points: Vec<(f32, f32)>,
    },
}

/// A line of text positioned by the top-left corner of its line box.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub x: f32,
    pub y: f32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BubbleLayout {
    pub rect: Rect,
    pub shape: BubbleShape,
    pub lines: Vec<TextLine>,
    pub label: Option<TextLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLayout {
    pub rect: Rect,
    pub lines: Vec<TextLine>,
}

/// Greedy word wrap by character count. Words longer than `width` are
/// split across lines; runs of whitespace collapse to one space.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let mut chars = word.chars().collect::<Vec<_>>();
        loop {
            let needed = if current_len == 0 {
                chars.len()
            } else {
                current_len + 1 + chars.len()
            };
            if needed <= width {
                if current_len > 0 {
                    current.push(' ');
                    current_len += 1;
                }
                current.extend(chars.iter());
                current_len += chars.len();
                break;
            }
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            let rest = chars.split_off(width);
            lines.push(chars.iter().collect());
            chars = rest;
            if chars.is_empty() {
                break;
            }
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

pub fn layout_bubble(
    bubble: &SpeechBubble,
    panel_width: f32,
    panel_height: f32,
    font_size: f32,
    measure: &dyn TextMeasure,
) -> BubbleLayout {
    let max_width = bubble.max_width.max(BUBBLE_PADDING * 2.0 + 1.0);
    let mut wrap_width = BUBBLE_WRAP_CHARS;
    let mut lines = wrap_text(&bubble.text, wrap_width);
    let mut text_width = widest_line(&lines, font_size, measure);
    while text_width + BUBBLE_PADDING * 2.0 > max_width && wrap_width > MIN_WRAP_CHARS {
        wrap_width -= 1;
        lines = wrap_text(&bubble.text, wrap_width);
        text_width = widest_line(&lines, font_size, measure);
    }

    let line_height = measure.line_height(font_size);
    let text_height = if lines.is_empty() {
        line_height
    } else {
        lines.len() as f32 * line_height + (lines.len() - 1) as f32 * LINE_SPACING
    };
    let width = (text_width + BUBBLE_PADDING * 2.0).min(max_width).round();
    let height = (text_height + BUBBLE_PADDING * 2.0).round();
    let (x, y) = bubble_origin(bubble.position, width, height, panel_width, panel_height);
    let rect = Rect {
        x,
        y,
        w: width,
        h: height,
    };

    let mut text_y = y + BUBBLE_PADDING;
    let mut text_lines = Vec::with_capacity(lines.len());
    for line in lines {
        text_lines.push(TextLine {
            x: x + BUBBLE_PADDING,
            y: text_y,
            text: line,
        });
        text_y += line_height + LINE_SPACING;
    }

    let label = speaker_label(&bubble.speaker).map(|text| TextLine {
        x,
        y: rect.bottom() + LABEL_GAP,
        text,
    });

    BubbleLayout {
        shape: bubble_shape(bubble.style, rect),
        rect,
        lines: text_lines,
        label,
    }
}

/// Top-left corner of a bubble of the given size, kept inside the panel.
pub fn bubble_origin(
    position: BubblePosition,
    width: f32,
    height: f32,
    panel_width: f32,
    panel_height: f32,
) -> (f32, f32) {
    let m = EDGE_MARGIN;
    let centered_x = ((panel_width - width) / 2.0).floor();
    let right_x = panel_width - width - m;
    let bottom_y = panel_height - height - m - CAPTION_RESERVE;
    let (x, y) = match position {
        BubblePosition::TopLeft => (m, m),
        BubblePosition::TopRight => (right_x, m),
        BubblePosition::TopCenter => (centered_x, m),
        BubblePosition::BottomLeft => (m, bottom_y),
        BubblePosition::BottomRight => (right_x, bottom_y),
        BubblePosition::BottomCenter => (centered_x, bottom_y),
        BubblePosition::Center => (centered_x, ((panel_height - height) / 2.0).floor()),
        BubblePosition::Custom { x, y } => (x, y),
    };
    (
        x.clamp(0.0, (panel_width - width).max(0.0)),
        y.clamp(0.0, (panel_height - height).max(0.0)),
    )
}

pub fn bubble_shape(style: BubbleStyle, rect: Rect) -> BubbleShape {
    match style {
        BubbleStyle::Round => {
            let tail_x = (rect.x + rect.w / 2.0).floor();
            let tail_y = rect.bottom();
            BubbleShape::Rounded {
                radius: CORNER_RADIUS.min(rect.h / 2.0),
                tail: [
                    (tail_x - TAIL_HALF_WIDTH, tail_y),
                    (tail_x + TAIL_HALF_WIDTH, tail_y),
                    (tail_x, tail_y + TAIL_HEIGHT),
                ],
            }
        }
        BubbleStyle::Square => BubbleShape::Square,
        BubbleStyle::Thought => BubbleShape::Thought {
            trail: [
                Rect {
                    x: rect.x + 10.0,
                    y: rect.bottom(),
                    w: 10.0,
                    h: 10.0,
                },
                Rect {
                    x: rect.x + 5.0,
                    y: rect.bottom() + 8.0,
                    w: 7.0,
                    h: 7.0,
                },
            ],
        },
        BubbleStyle::Shout => BubbleShape::Jagged {
            points: shout_points(rect),
        },
    }
}

/// Jagged outline stepping clockwise around `rect`.
pub fn shout_points(rect: Rect) -> Vec<(f32, f32)> {
    let width = rect.w.max(0.0) as usize;
    let height = rect.h.max(0.0) as usize;
    let mut jitter = SHOUT_JITTER.iter().copied().cycle();
    let mut next = || jitter.next().unwrap_or(0.0);
    let mut points = Vec::new();

    for i in (0..width).step_by(SHOUT_STEP) {
        points.push((rect.x + i as f32, rect.y + next()));
    }
    for i in (0..height).step_by(SHOUT_STEP) {
        points.push((rect.right() + next(), rect.y + i as f32));
    }
    for i in descending_steps(width) {
        points.push((rect.x + i as f32, rect.bottom() + next()));
    }
    for i in descending_steps(height) {
        points.push((rect.x + next(), rect.y + i as f32));
    }
    points
}

fn descending_steps(start: usize) -> impl Iterator<Item = usize> {
    (0..start.div_ceil(SHOUT_STEP)).map(move |step| start - step * SHOUT_STEP)
}

pub fn layout_caption(
    caption: &str,
    panel_width: f32,
    panel_height: f32,
    font_size: f32,
    measure: &dyn TextMeasure,
) -> Option<CaptionLayout> {
    if caption.trim().is_empty() {
        return None;
    }
    let lines = wrap_text(caption, CAPTION_WRAP_CHARS);
    let line_height = CAPTION_LINE_HEIGHT.max(measure.line_height(font_size));
    let height = lines.len() as f32 * line_height + CAPTION_PADDING * 2.0;
    let top = panel_height - height - CAPTION_INSET;
    let rect = Rect {
        x: CAPTION_INSET,
        y: top,
        w: (panel_width - CAPTION_INSET * 2.0).max(0.0),
        h: height,
    };
    let lines = lines
        .into_iter()
        .enumerate()
        .map(|(idx, text)| TextLine {
            x: CAPTION_INSET + CAPTION_PADDING,
            y: top + CAPTION_PADDING + idx as f32 * line_height,
            text,
        })
        .collect();
    Some(CaptionLayout { rect, lines })
}

/// Speaker rules decide by panel parity; thoughts float top-center and
/// everyone else speaks from the bottom.
pub fn bubble_position_for(panel_number: u32, speaker: &str, rules: &[SpeakerRule]) -> BubblePosition {
    let speaker = speaker.trim();
    if let Some(rule) = rules
        .iter()
        .find(|rule| rule.name.trim().eq_ignore_ascii_case(speaker))
    {
        let name = if panel_number % 2 == 1 {
            &rule.odd
        } else {
            &rule.even
        };
        return BubblePosition::parse(name);
    }
    if is_thought_speaker(speaker) {
        return BubblePosition::TopCenter;
    }
    BubblePosition::BottomCenter
}

pub fn bubble_style_for(speaker: &str, text: &str) -> BubbleStyle {
    if is_thought_speaker(speaker) {
        return BubbleStyle::Thought;
    }
    let has_letters = text.chars().any(char::is_alphabetic);
    let shouting = has_letters
        && !text.chars().any(char::is_lowercase)
        && text.trim_end().ends_with('!');
    if shouting {
        BubbleStyle::Shout
    } else {
        BubbleStyle::Round
    }
}

fn is_thought_speaker(speaker: &str) -> bool {
    let lower = speaker.to_lowercase();
    lower.contains("thought") || lower.contains("thinking")
}

fn speaker_label(speaker: &str) -> Option<String> {
    let speaker = speaker.trim();
    if speaker.is_empty()
        || UNLABELLED_SPEAKERS
            .iter()
            .any(|name| speaker.eq_ignore_ascii_case(name))
    {
        return None;
    }
    Some(format!("\u{2014} {}", speaker))
}

fn widest_line(lines: &[String], font_size: f32, measure: &dyn TextMeasure) -> f32 {
    lines
        .iter()
        .map(|line| measure.text_width(line, font_size))
        .fold(0.0, f32::max)
}
