//! Filename timestamp extraction and renaming.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::path::Path;

use crate::config::FileTypeConfig;
use crate::error::Result;

/// What a filename says about its interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedInterval {
    /// Timestamp after the configured shift
    pub timestamp: NaiveDateTime,
    /// Filename re-rendered with the shifted timestamp
    pub output_name: String,
    /// Output name with the timestamp replaced by the wildcard token
    pub prototype: String,
}

/// Compiled naming rules for one file type
#[derive(Debug, Clone)]
pub struct FileNamePattern {
    extension: String,
    search: Regex,
    format: String,
    wildcard: String,
    search_tag: Option<String>,
    time_shift: Duration,
}

impl FileNamePattern {
    pub fn from_config(file_type: &FileTypeConfig) -> Result<Self> {
        Ok(Self {
            extension: file_type.extension.trim_start_matches('.').to_string(),
            search: Regex::new(&file_type.search)?,
            format: file_type.format.clone(),
            wildcard: file_type.wildcard.clone(),
            search_tag: file_type.search_tag.clone().filter(|t| !t.is_empty()),
            time_shift: Duration::minutes(file_type.time_shift_minutes),
        })
    }

    /// Extension and search tag checks, before any timestamp parsing
    pub fn is_candidate(&self, path: &Path) -> bool {
        let extension_matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));
        let tag_matches = match (&self.search_tag, path.file_name().and_then(|n| n.to_str())) {
            (Some(tag), Some(name)) => name.contains(tag.as_str()),
            (None, Some(_)) => true,
            (_, None) => false,
        };
        extension_matches && tag_matches
    }

    fn parse_timestamp(&self, text: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(text, &self.format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(text, &self.format)
                    .ok()
                    .map(|d| d.and_time(NaiveTime::MIN))
            })
    }

    /// Extract, shift and re-render the timestamp of a filename
    pub fn describe(&self, file_name: &str) -> Option<NamedInterval> {
        let path = Path::new(file_name);
        let stem = path.file_stem()?.to_str()?;
        let found = self.search.find(stem)?;
        let original = self.parse_timestamp(found.as_str())?;
        let timestamp = original + self.time_shift;

        let prefix = &stem[..found.start()];
        let suffix = &stem[found.end()..];
        let rendered = if self.time_shift.is_zero() {
            found.as_str().to_string()
        } else {
            timestamp.format(&self.format).to_string()
        };

        Some(NamedInterval {
            timestamp,
            output_name: format!("{}{}{}.{}", prefix, rendered, suffix, self.extension),
            prototype: format!("{}{}{}.{}", prefix, self.wildcard, suffix, self.extension),
        })
    }
}
