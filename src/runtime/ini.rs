//! Minimal INI handling for `GameUserSettings.ini` and `Game.ini`
//!
//! Sections and keys are kept in ordered maps so rendering the same data
//! always produces the same bytes.

use thiserror::Error;

use crate::config::IniSections;

#[derive(Error, Debug, PartialEq)]
pub enum IniError {
    #[error("Line {0}: key/value outside of any section")]
    NoSection(usize),

    #[error("Line {0}: expected 'key=value' or '[section]'")]
    Malformed(usize),
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse INI content into sections
pub fn parse_ini(content: &str) -> Result<IniSections, IniError> {
    let mut sections = IniSections::new();
    let mut current: Option<String> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let (key, value) = line.split_once('=').ok_or(IniError::Malformed(line_no))?;
        let section = current.as_ref().ok_or(IniError::NoSection(line_no))?;
        sections
            .entry(section.clone())
            .or_default()
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(sections)
}

/// Overlay `overlay` onto `base`; overlay values win
pub fn merge_into(base: &mut IniSections, overlay: &IniSections) {
    for (section, keys) in overlay {
        let target = base.entry(section.clone()).or_default();
        for (key, value) in keys {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Render sections as INI text
pub fn render_ini(sections: &IniSections) -> String {
    let mut output = String::new();
    for (i, (section, keys)) in sections.iter().enumerate() {
        if i > 0 {
            output.push('\n');
        }
        output.push_str(&format!("[{}]\n", section));
        for (key, value) in keys {
            output.push_str(&format!("{}={}\n", key, value));
        }
    }
    output
}

/// Set a single key, creating the section if needed
pub fn set(sections: &mut IniSections, section: &str, key: &str, value: impl Into<String>) {
    sections
        .entry(section.to_string())
        .or_default()
        .insert(key.to_string(), value.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ini() {
        let content = "; comment\n[ServerSettings]\nXPMultiplier = 2.0\nRCONEnabled=True\n\n[SessionSettings]\nSessionName=My Server\n";
        let sections = parse_ini(content).unwrap();
        assert_eq!(sections["ServerSettings"]["XPMultiplier"], "2.0");
        assert_eq!(sections["SessionSettings"]["SessionName"], "My Server");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_ini("Key=Value"), Err(IniError::NoSection(1)));
        assert_eq!(parse_ini("[A]\nnot a pair"), Err(IniError::Malformed(2)));
    }

    #[test]
    fn test_merge_and_render() {
        let mut base = parse_ini("[A]\nx=1\ny=2\n").unwrap();
        let overlay = parse_ini("[A]\ny=3\n[B]\nz=4\n").unwrap();
        merge_into(&mut base, &overlay);
        assert_eq!(render_ini(&base), "[A]\nx=1\ny=3\n\n[B]\nz=4\n");
    }

    #[test]
    fn test_render_is_parseable() {
        let mut sections = IniSections::new();
        set(&mut sections, "/Script/Engine.GameSession", "MaxPlayers", "70");
        let rendered = render_ini(&sections);
        assert_eq!(parse_ini(&rendered).unwrap(), sections);
    }
}
