use anyhow::{Context, Result};
use tera::{Context as TeraContext, Tera};

use crate::script::{ComicScript, Panel};
use crate::settings::Settings;

const OPENAI_PANEL_TEMPLATE: &str = include_str!("templates/openai_panel.tera");
const MIDJOURNEY_PANEL_TEMPLATE: &str = include_str!("templates/midjourney_panel.tera");

const SIMPLIFIED_SCENE_MAX_CHARS: usize = 200;

/// Full prompt for providers that cope with long, structured descriptions.
pub fn render_openai_prompt(
    panel: &Panel,
    script: &ComicScript,
    settings: &Settings,
) -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("character", settings.character.description.trim());
    context.insert("character_name", settings.character.name.trim());
    context.insert("style", settings.character.style.trim());
    context.insert("number", &panel.number);
    context.insert("panel_count", &script.panels.len().max(1));
    context.insert("title", script.title.trim());
    context.insert("scene", panel.visual_description().trim());
    let location = script.location.trim();
    let location = if location.eq_ignore_ascii_case("unknown") {
        ""
    } else {
        location
    };
    context.insert("location", location);

    let rendered = Tera::one_off(OPENAI_PANEL_TEMPLATE, &context, false)
        .with_context(|| "failed to render OpenAI panel prompt")?;
    Ok(rendered.trim().to_string())
}

/// Short prompt for Midjourney, which works best with one visual sentence.
pub fn render_midjourney_prompt(panel: &Panel, settings: &Settings) -> Result<String> {
    let scene = match panel.image_prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => simplify_scene(prompt),
        _ => simplify_scene(&panel.scene),
    };
    let mut context = TeraContext::new();
    context.insert("scene", &scene);
    context.insert("character_name", settings.character.name.trim());
    context.insert("character_short", settings.character.short.trim());

    let rendered = Tera::one_off(MIDJOURNEY_PANEL_TEMPLATE, &context, false)
        .with_context(|| "failed to render Midjourney panel prompt")?;
    Ok(rendered.trim().to_string())
}

pub fn simplify_scene(scene: &str) -> String {
    let flattened = scene.replace('\n', " ");
    let mut scene = flattened.trim().to_string();
    if let Some(idx) = scene.find('.') {
        scene.truncate(idx + 1);
    }
    if scene.chars().count() > SIMPLIFIED_SCENE_MAX_CHARS {
        let mut truncated = scene
            .chars()
            .take(SIMPLIFIED_SCENE_MAX_CHARS)
            .collect::<String>();
        truncated.push_str("...");
        return truncated;
    }
    scene
}

/// Shortens long prompts for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flattened = text.replace('\n', " ");
    if flattened.chars().count() <= max_chars {
        return flattened;
    }
    let mut out = flattened.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;

    #[test]
    fn simplify_keeps_first_sentence() {
        assert_eq!(
            simplify_scene("TR waves from the deck.\nThe crowd cheers. Gulls fly."),
            "TR waves from the deck."
        );
    }

    #[test]
    fn simplify_truncates_long_text() {
        let long = "word ".repeat(60);
        let simplified = simplify_scene(&long);
        assert!(simplified.ends_with("..."));
        assert_eq!(simplified.chars().count(), 203);
    }

    #[test]
    fn midjourney_prompt_prefers_explicit_prompt() {
        let script = parse_script(
            "### Panel 1: A\n**Scene:** Long scene text. More.\n**Prompt:** TR on a jet ski. Splash.",
        );
        let prompt = render_midjourney_prompt(&script.panels[0], &Settings::default()).unwrap();
        assert!(prompt.starts_with("TR on a jet ski.\n\nTR character: chubby middle-aged man"));
        assert!(prompt.ends_with("clean composition"));
    }

    #[test]
    fn openai_prompt_omits_unknown_location() {
        let script = parse_script("### Panel 1: A\n**Scene:** TR naps on deck.");
        let prompt =
            render_openai_prompt(&script.panels[0], &script, &Settings::default()).unwrap();
        assert!(prompt.contains("Panel 1 of 1 for comic titled \"Untitled\":"));
        assert!(prompt.contains("Scene: TR naps on deck.\n\nMake sure:"));
        assert!(!prompt.contains("Location:"));
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(preview("abc\ndef", 10), "abc def");
        assert_eq!(preview("abcdef", 3), "abc...");
    }
}
