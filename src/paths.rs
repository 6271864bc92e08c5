use std::path::{Path, PathBuf};

const BASE_DIR_ENV: &str = "COMIC_FORGE_DIR";

pub(crate) fn settings_dir() -> Option<PathBuf> {
    if let Some(dir) = base_dir_override() {
        return Some(dir);
    }
    default_base_dir()
}

fn base_dir_override() -> Option<PathBuf> {
    std::env::var(BASE_DIR_ENV)
        .ok()
        .and_then(|value| normalize_dir(&value))
}

fn default_base_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".comic-forge"))
        }
    })
}

fn normalize_dir(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let expanded = expand_tilde(trimmed);
    Some(normalize_path(PathBuf::from(expanded)))
}

fn normalize_path(path: PathBuf) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        normalized.push(component.as_os_str());
    }
    normalized
}

pub(crate) fn expand_tilde(value: &str) -> String {
    if value == "~" || value.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let home = home.trim();
            if home.is_empty() {
                return value.to_string();
            }
            if value == "~" {
                return home.to_string();
            }
            return format!("{}{}", home, &value[1..]);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn settings_dir_defaults_under_home() {
        with_temp_home(|home| {
            assert_eq!(settings_dir(), Some(home.join(".comic-forge")));
        });
    }

    #[test]
    fn expand_tilde_uses_home() {
        with_temp_home(|home| {
            let expanded = expand_tilde("~/fonts/comic.ttf");
            assert_eq!(
                PathBuf::from(expanded),
                home.join("fonts").join("comic.ttf")
            );
            assert_eq!(expand_tilde("fonts/comic.ttf"), "fonts/comic.ttf");
        });
    }
}
