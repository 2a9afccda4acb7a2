//! Ordered INI document model.
//!
//! Instrument metadata, descriptor templates and downstream settings files
//! all use the same `[Section]` / `key=value` layout. Section and key order
//! is preserved so that generated files read like the templates they were
//! derived from.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::error::{GhgError, Result};

/// Parse failure with the 1-based line it occurred on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct IniParseError {
    pub line: usize,
    pub reason: String,
}

/// One `[Section]` with its entries in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace a value, keeping the original position on replace
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An ordered collection of sections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse INI text.
    ///
    /// Accepts `=` or `:` as the key separator, `;` and `#` comment lines and
    /// indented continuation lines. Repeated sections are merged and a
    /// repeated key keeps its last value.
    pub fn parse(text: &str) -> std::result::Result<Self, IniParseError> {
        let mut document = Self::new();
        let mut current: Option<usize> = None;
        let mut last_key: Option<String> = None;

        for (index, raw_line) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim_end_matches('\r');
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }

            // Continuation of the previous value
            if line.starts_with(char::is_whitespace) {
                if let (Some(section_index), Some(key)) = (current, last_key.as_ref()) {
                    let section = &mut document.sections[section_index];
                    let previous = section.get(key).unwrap_or_default().to_string();
                    section.set(key.clone(), format!("{}\n{}", previous, trimmed));
                    continue;
                }
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| IniParseError {
                    line: line_number,
                    reason: format!("unterminated section header '{}'", trimmed),
                })?;
                current = Some(document.section_index_or_insert(name.trim()));
                last_key = None;
                continue;
            }

            let section_index = current.ok_or_else(|| IniParseError {
                line: line_number,
                reason: "entry before the first section header".to_string(),
            })?;

            let split_at = trimmed.find(['=', ':']).ok_or_else(|| IniParseError {
                line: line_number,
                reason: format!("expected 'key=value', found '{}'", trimmed),
            })?;
            let key = trimmed[..split_at].trim().to_string();
            let value = trimmed[split_at + 1..].trim().to_string();
            if key.is_empty() {
                return Err(IniParseError {
                    line: line_number,
                    reason: "empty key".to_string(),
                });
            }

            document.sections[section_index].set(key.clone(), value);
            last_key = Some(key);
        }

        Ok(document)
    }

    /// Read and parse an INI file from disk
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| {
            GhgError::configuration(format!("Cannot parse {}: {}", path.display(), e))
        })
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        match self.sections.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(IniSection::new(name));
                self.sections.len() - 1
            }
        }
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> &mut IniSection {
        let index = self.section_index_or_insert(name);
        &mut self.sections[index]
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: impl Into<String>, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter()
    }

    /// Every `(section, key, value)` triple in document order
    pub fn flatten(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.sections
            .iter()
            .flat_map(|s| s.entries().map(move |(k, v)| (s.name(), k, v)))
    }

    /// Render with a leading marker line and no spaces around `=`
    pub fn render(&self, header: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(header) = header {
            out.push_str(header);
            out.push('\n');
        }
        for section in &self.sections {
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in section.entries() {
                let _ = writeln!(out, "{}={}", key, value.replace('\n', "\n\t"));
            }
            out.push('\n');
        }
        out
    }

    /// Write to disk, creating the parent directory if needed
    pub fn write(&self, path: &Path, header: Option<&str>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render(header))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = ";GHG_METADATA
[Project]
title=Test site
[FileDescription]
separator=tab
header_rows = 8
data_label: DATA
col_1_variable=Seconds
; a comment
[Instruments]
instr_1_model=wm_81000
";

    #[test]
    fn test_parse_preserves_sections_and_order() {
        let doc = IniDocument::parse(METADATA).unwrap();

        let names: Vec<&str> = doc.sections().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Project", "FileDescription", "Instruments"]);
        assert_eq!(doc.get("FileDescription", "header_rows"), Some("8"));
        assert_eq!(doc.get("FileDescription", "data_label"), Some("DATA"));
        assert_eq!(doc.get("Instruments", "instr_1_model"), Some("wm_81000"));

        let keys: Vec<&str> = doc.section("FileDescription").unwrap().keys().collect();
        assert_eq!(
            keys,
            vec!["separator", "header_rows", "data_label", "col_1_variable"]
        );
    }

    #[test]
    fn test_entry_before_section_is_rejected() {
        let err = IniDocument::parse("key=value\n[Section]\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_line_without_separator_is_rejected() {
        let err = IniDocument::parse("[Section]\nnot an entry\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_continuation_lines_are_joined() {
        let doc = IniDocument::parse("[A]\nnotes=first\n  second\n").unwrap();
        assert_eq!(doc.get("A", "notes"), Some("first\nsecond"));
    }

    #[test]
    fn test_render_uses_header_and_compact_entries() {
        let mut doc = IniDocument::new();
        doc.set("Project", "col_co2", "5");
        doc.set("Project", "col_h2o", "6");
        doc.set("Project", "col_co2", "7");

        let text = doc.render(Some(";EDDYPRO_PROCESSING"));
        assert_eq!(
            text,
            ";EDDYPRO_PROCESSING\n[Project]\ncol_co2=7\ncol_h2o=6\n\n"
        );
        assert_eq!(IniDocument::parse(&text).unwrap(), doc);
    }
}
