//! Workflow configuration.
//!
//! Plain `key=value` lines, `#` comments, optional single or double quotes
//! around values. Unknown keys are reported and skipped.

use crate::types::TestStatus;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid test status for {key}: {value}")]
    InvalidStatus { key: String, value: String },
}

/// Workflow behavior knobs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Notes written onto an assignment when it is reassigned.
    pub reassign_note: String,
    /// Let a member start executing a test nobody assigned to them.
    pub self_serve_execution: bool,
    /// Archive the discarded attempt before a reassignment clears it.
    pub archive_on_reassign: bool,
    /// Test statuses that may receive assignments.
    pub assignable_statuses: Vec<TestStatus>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reassign_note: "Reassigned for re-execution".to_string(),
            self_serve_execution: true,
            archive_on_reassign: true,
            assignable_statuses: vec![TestStatus::Active],
        }
    }
}

impl Config {
    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<Vec<String>, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content. Returns the unknown keys that were skipped.
    pub fn parse_content(&mut self, content: &str) -> Result<Vec<String>, ConfigError> {
        let mut unknown = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            if !self.apply_value(key, &value)? {
                unknown.push(key.to_string());
            }
        }
        Ok(unknown)
    }

    /// Whether tests in this status may be assigned.
    pub fn is_assignable(&self, status: TestStatus) -> bool {
        self.assignable_statuses.contains(&status)
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value. Returns false for unknown keys.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "reassign_note" => self.reassign_note = value.to_string(),
            "self_serve_execution" => self.self_serve_execution = Self::parse_bool(key, value)?,
            "archive_on_reassign" => self.archive_on_reassign = Self::parse_bool(key, value)?,
            "assignable_statuses" => {
                self.assignable_statuses = value
                    .split_whitespace()
                    .map(|s| {
                        TestStatus::parse(s).ok_or_else(|| ConfigError::InvalidStatus {
                            key: key.to_string(),
                            value: s.to_string(),
                        })
                    })
                    .collect::<Result<_, _>>()?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.reassign_note, "Reassigned for re-execution");
        assert!(config.self_serve_execution);
        assert!(config.archive_on_reassign);
        assert!(config.is_assignable(TestStatus::Active));
        assert!(!config.is_assignable(TestStatus::Draft));
        assert!(!config.is_assignable(TestStatus::Archived));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# workflow settings
reassign_note="Please run again"
self_serve_execution=no
archive_on_reassign=off
assignable_statuses=active draft
"#;
        let unknown = config.parse_content(content).unwrap();
        assert!(unknown.is_empty());
        assert_eq!(config.reassign_note, "Please run again");
        assert!(!config.self_serve_execution);
        assert!(!config.archive_on_reassign);
        assert!(config.is_assignable(TestStatus::Draft));
    }

    #[test]
    fn unknown_keys_are_reported_not_rejected() {
        let mut config = Config::default();
        let unknown = config.parse_content("theme=dark\nself_serve_execution=1").unwrap();
        assert_eq!(unknown, vec!["theme".to_string()]);
        assert!(config.self_serve_execution);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("archive_on_reassign=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("assignable_statuses=active retired"),
            Err(ConfigError::InvalidStatus { .. })
        ));
        assert!(matches!(
            config.parse_content("no equals sign"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn load_file_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "reassign_note=Retest\ncolor=blue").unwrap();
        let mut config = Config::default();
        let unknown = config.load_file(file.path()).unwrap();
        assert_eq!(unknown, vec!["color".to_string()]);
        assert_eq!(config.reassign_note, "Retest");
        assert!(config.archive_on_reassign);
    }
}
