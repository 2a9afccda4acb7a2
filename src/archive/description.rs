//! `FileDescription` decoding.
//!
//! Turns the metadata's `[FileDescription]` section, layered with per
//! file-type overrides, into the layout needed to read the data component.

use std::collections::BTreeMap;
use std::path::Path;

use crate::constants::{DATA_LABEL_NOT_SET, FILE_DESCRIPTION_SECTION};
use crate::error::{GhgError, Result};
use crate::ini::IniDocument;

/// Layout of a delimited data component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescription {
    pub separator: u8,
    /// Lines before the first data row
    pub header_rows: usize,
    /// Lines before the column-name row
    pub skip_rows: usize,
    /// Leading label column value, `None` when the file has none
    pub data_label: Option<String>,
    pub na_values: Vec<String>,
}

impl FileDescription {
    /// Decode the section of `metadata`, with `overrides` taking precedence.
    ///
    /// The effective values are written back into `metadata` so the
    /// recorded metadata describes how the file was actually read.
    pub fn resolve(
        metadata: &mut IniDocument,
        overrides: &BTreeMap<String, String>,
        delimiters: &BTreeMap<String, String>,
        path: &Path,
    ) -> Result<Self> {
        if !metadata.has_section(FILE_DESCRIPTION_SECTION) {
            return Err(GhgError::MissingSection {
                path: path.to_path_buf(),
                section: FILE_DESCRIPTION_SECTION.to_string(),
            });
        }
        for (key, value) in overrides {
            metadata.set(FILE_DESCRIPTION_SECTION, key.clone(), value.clone());
        }

        let field = |key: &str| metadata.get(FILE_DESCRIPTION_SECTION, key);

        let separator_name = field("separator").ok_or_else(|| GhgError::Delimiter {
            path: path.to_path_buf(),
            reason: "no separator in FileDescription".to_string(),
        })?;
        let separator = resolve_delimiter(separator_name, delimiters, path)?;

        let header_rows = parse_count(field("header_rows").unwrap_or("0"), "header_rows", path)?;
        let skip_rows = match field("skip_rows") {
            Some(value) => parse_count(value, "skip_rows", path)?,
            None => header_rows.saturating_sub(1),
        };

        let data_label = field("data_label")
            .map(str::trim)
            .filter(|label| !label.is_empty() && *label != DATA_LABEL_NOT_SET)
            .map(str::to_string);

        let na_values = field("na_values")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            separator,
            header_rows,
            skip_rows,
            data_label,
            na_values,
        })
    }

    /// Index of the column-name row, if the header has one
    pub fn name_row(&self) -> Option<usize> {
        (self.skip_rows < self.header_rows).then_some(self.skip_rows)
    }

    /// Index of the unit row directly below the names, if present
    pub fn unit_row(&self) -> Option<usize> {
        (self.skip_rows + 1 < self.header_rows).then_some(self.skip_rows + 1)
    }
}

fn parse_count(value: &str, field: &str, path: &Path) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        GhgError::invalid_archive(path, format!("{} is not a row count: '{}'", field, value))
    })
}

/// Look up a delimiter by name and decode it to a single byte
pub fn resolve_delimiter(
    name: &str,
    delimiters: &BTreeMap<String, String>,
    path: &Path,
) -> Result<u8> {
    let name = name.trim();
    let raw = delimiters
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| GhgError::Delimiter {
            path: path.to_path_buf(),
            reason: format!("unknown delimiter name '{}'", name),
        })?;

    let decoded = decode_escapes(raw).ok_or_else(|| GhgError::Delimiter {
        path: path.to_path_buf(),
        reason: format!("malformed escape in '{}'", raw),
    })?;
    match decoded.as_bytes() {
        [byte] => Ok(*byte),
        _ => Err(GhgError::Delimiter {
            path: path.to_path_buf(),
            reason: format!("'{}' does not decode to a single byte", raw),
        }),
    }
}

/// Decode `\t`, `\n`, `\r`, `\\` and `\xHH`; `None` on a malformed escape
pub fn decode_escapes(raw: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                if hex.len() != 2 {
                    return None;
                }
                let code = u8::from_str_radix(&hex, 16).ok()?;
                out.push(char::from(code));
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;

    fn description(text: &str, overrides: &[(&str, &str)]) -> Result<FileDescription> {
        let mut doc = IniDocument::parse(text).unwrap();
        let overrides = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FileDescription::resolve(
            &mut doc,
            &overrides,
            &ProcessingConfig::default().delimiters,
            Path::new("test.ghg"),
        )
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_escapes("\\t").as_deref(), Some("\t"));
        assert_eq!(decode_escapes("\\x3B").as_deref(), Some(";"));
        assert_eq!(decode_escapes("\\\\").as_deref(), Some("\\"));
        assert_eq!(decode_escapes(",").as_deref(), Some(","));
        assert_eq!(decode_escapes("\\q"), None);
        assert_eq!(decode_escapes("\\x4"), None);
    }

    #[test]
    fn test_archive_layout() {
        let desc = description(
            "[FileDescription]\nseparator=tab\nheader_rows=8\ndata_label=DATA\n",
            &[],
        )
        .unwrap();
        assert_eq!(desc.separator, b'\t');
        assert_eq!(desc.name_row(), Some(7));
        assert_eq!(desc.unit_row(), None);
        assert_eq!(desc.data_label.as_deref(), Some("DATA"));
    }

    #[test]
    fn test_overrides_give_unit_row() {
        let desc = description(
            "[FileDescription]\nseparator=tab\nheader_rows=1\ndata_label=Not set\n",
            &[("separator", "comma"), ("header_rows", "4"), ("skip_rows", "1")],
        )
        .unwrap();
        assert_eq!(desc.separator, b',');
        assert_eq!(desc.name_row(), Some(1));
        assert_eq!(desc.unit_row(), Some(2));
        assert_eq!(desc.data_label, None);
    }

    #[test]
    fn test_missing_section_and_unknown_delimiter() {
        match description("[Project]\ntitle=x\n", &[]).unwrap_err() {
            GhgError::MissingSection { section, .. } => assert_eq!(section, "FileDescription"),
            other => panic!("Expected MissingSection, got {:?}", other),
        }
        match description("[FileDescription]\nseparator=colon\n", &[]).unwrap_err() {
            GhgError::Delimiter { reason, .. } => assert!(reason.contains("colon")),
            other => panic!("Expected Delimiter, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_byte_delimiter_rejected() {
        let delimiters = BTreeMap::from([("double".to_string(), "\\t\\t".to_string())]);
        assert!(resolve_delimiter("double", &delimiters, Path::new("x")).is_err());
    }
}
