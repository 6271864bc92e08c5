use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

const SLUG_MAX_LEN: usize = 50;
const PANEL_HEADING: &str = "### Panel";
const CAPTION_HEADING: &str = "## Caption:";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComicScript {
    pub title: String,
    pub slug: String,
    pub location: String,
    pub caption: String,
    pub panels: Vec<Panel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Panel {
    pub number: u32,
    pub title: String,
    pub scene: String,
    pub dialogue: Vec<DialogueLine>,
    pub dialogue_text: String,
    pub image_prompt: Option<String>,
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
}

impl ComicScript {
    /// Panels that carry a scene and can be sent to an image provider.
    pub fn drawable_panels(&self) -> impl Iterator<Item = &Panel> {
        self.panels.iter().filter(|panel| panel.has_scene())
    }
}

impl Panel {
    pub fn has_scene(&self) -> bool {
        !self.scene.trim().is_empty()
    }

    /// The explicit image prompt when present, otherwise the scene text.
    pub fn visual_description(&self) -> &str {
        self.image_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or(&self.scene)
    }
}

pub fn load_script(path: &Path) -> Result<ComicScript> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read script: {}", path.display()))?;
    Ok(parse_script(&content))
}

pub fn parse_script(content: &str) -> ComicScript {
    let lines = content.lines().collect::<Vec<_>>();

    let title = first_label_value(&lines, "Title").unwrap_or_else(|| "Untitled".to_string());
    let slug = first_label_value(&lines, "Slug")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| slugify(&title));
    let location = first_label_value(&lines, "Location").unwrap_or_else(|| "Unknown".to_string());
    let caption = document_caption(&lines);

    let mut panels = Vec::new();
    for (index, section) in panel_sections(&lines).into_iter().enumerate() {
        panels.push(parse_panel(index as u32 + 1, section));
    }

    ComicScript {
        title,
        slug,
        location,
        caption,
        panels,
    }
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    slug.chars().take(SLUG_MAX_LEN).collect()
}

/// Splits `Speaker: text` lines; list markers and quotes are dropped.
pub fn parse_dialogue(text: &str) -> Vec<DialogueLine> {
    let mut result = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        let line = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line);
        let Some((speaker, text)) = line.split_once(':') else {
            continue;
        };
        let speaker = speaker.trim_matches(|ch: char| ch == '-' || ch == '*' || ch.is_whitespace());
        let text = text.trim_matches(|ch: char| {
            ch == '"' || ch == '\u{201c}' || ch == '\u{201d}' || ch.is_whitespace()
        });
        if speaker.is_empty() || text.is_empty() {
            continue;
        }
        result.push(DialogueLine {
            speaker: speaker.to_string(),
            text: text.to_string(),
        });
    }
    result
}

fn parse_panel(index: u32, section: &[&str]) -> Panel {
    let heading = section.first().copied().unwrap_or_default();
    let (number, title) = parse_panel_heading(heading, index);
    let body = &section[1.min(section.len())..];

    let scene = field_value(body, &["Scene"]).unwrap_or_default();
    let dialogue_text = field_value(body, &["Dialogue"]).unwrap_or_default();
    let caption = field_value(body, &["Caption"]).unwrap_or_default();
    let image_prompt = field_value(body, &["DALL-E Prompt", "Prompt"])
        .map(|value| fenced_block(&value).unwrap_or(value))
        .filter(|value| !value.trim().is_empty());

    Panel {
        number,
        title,
        scene,
        dialogue: parse_dialogue(&dialogue_text),
        dialogue_text,
        image_prompt,
        caption,
    }
}

fn parse_panel_heading(heading: &str, index: u32) -> (u32, String) {
    let rest = heading
        .trim()
        .strip_prefix(PANEL_HEADING)
        .unwrap_or_default()
        .trim();
    let (number_part, title_part) = rest.split_once(':').unwrap_or((rest, ""));
    let number = number_part.trim().parse::<u32>().unwrap_or(index);
    let title = title_part.trim();
    let title = if title.is_empty() {
        format!("Panel {}", number)
    } else {
        title.to_string()
    };
    (number, title)
}

fn panel_sections<'a>(lines: &'a [&'a str]) -> Vec<&'a [&'a str]> {
    let starts = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| is_panel_heading(line))
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();
    let mut sections = Vec::with_capacity(starts.len());
    for (pos, start) in starts.iter().enumerate() {
        let end = starts.get(pos + 1).copied().unwrap_or(lines.len());
        sections.push(&lines[*start..end]);
    }
    sections
}

fn is_panel_heading(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with(PANEL_HEADING) && trimmed.contains(':')
}

fn is_heading(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Returns `(label, rest)` for lines shaped like `**Label:** rest`.
fn split_label(line: &str) -> Option<(&str, &str)> {
    let inner = line.trim_start().strip_prefix("**")?;
    let (label, rest) = inner.split_once(":**")?;
    if label.contains("**") {
        return None;
    }
    Some((label.trim(), rest))
}

fn first_label_value(lines: &[&str], label: &str) -> Option<String> {
    lines.iter().find_map(|line| {
        let (found, rest) = split_label(line)?;
        if !found.eq_ignore_ascii_case(label) {
            return None;
        }
        let value = rest.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

fn field_value(lines: &[&str], labels: &[&str]) -> Option<String> {
    let start = lines.iter().position(|line| {
        split_label(line)
            .map(|(found, _)| labels.iter().any(|label| found.eq_ignore_ascii_case(label)))
            .unwrap_or(false)
    })?;
    let (_, first) = split_label(lines[start])?;

    let mut collected = vec![first.trim()];
    let mut in_fence = false;
    for line in &lines[start + 1..] {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && !trimmed.starts_with("```") && (split_label(line).is_some() || is_heading(line)) {
            break;
        }
        collected.push(line.trim_end());
    }
    let value = collected.join("\n").trim().to_string();
    Some(value)
}

fn fenced_block(value: &str) -> Option<String> {
    let start = value.find("```")?;
    let after_open = &value[start + 3..];
    let body_start = after_open.find('\n').map(|idx| idx + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

fn document_caption(lines: &[&str]) -> String {
    let Some(start) = lines
        .iter()
        .position(|line| line.trim().starts_with(CAPTION_HEADING))
    else {
        return String::new();
    };
    let mut collected = Vec::new();
    let inline = lines[start].trim()[CAPTION_HEADING.len()..].trim();
    if !inline.is_empty() {
        collected.push(inline);
    }
    for line in &lines[start + 1..] {
        if line.trim_start().starts_with("##") {
            break;
        }
        collected.push(line.trim_end());
    }
    collected.join("\n").trim().to_string()
}
