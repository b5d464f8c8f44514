//! Prompt templates and the STRUCTURE response schema.
//!
//! Loaded once at startup and handed to the handlers. Files in `prompt_dir`
//! (`analyze.txt`, `structure.txt`, `structure_schema.json`) override the built-in text.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::payload::RawRow;

const ANALYZE_FILE: &str = "analyze.txt";
const STRUCTURE_FILE: &str = "structure.txt";
const SCHEMA_FILE: &str = "structure_schema.json";

const DEFAULT_ANALYZE_PROMPT: &str = "\
You research local elections. The rows below were uploaded by an election office and \
describe one race. For every candidate, confirm the race details (municipality, state, \
position, election date) and collect public contact and biographical information. \
Report what you found as JSON. Use \"N/A\" for anything you could not verify.";

const DEFAULT_STRUCTURE_PROMPT: &str = "\
Convert the research notes and the original rows below into the required JSON schema. \
Keep one election per distinct race and list its candidates. Do not invent values: \
leave a field null when the notes do not support it.";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("structure schema in {path} is not valid JSON: {source}")]
    Schema {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Prompt text for the AI stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSet {
    pub analyze: String,
    pub structure: String,
    pub structure_schema: Value,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            analyze: DEFAULT_ANALYZE_PROMPT.to_string(),
            structure: DEFAULT_STRUCTURE_PROMPT.to_string(),
            structure_schema: default_structure_schema(),
        }
    }
}

impl PromptSet {
    /// Built-in prompts, overridden file by file from `dir` when given.
    pub fn load(dir: Option<&Path>) -> Result<Self, PromptError> {
        let mut prompts = Self::default();
        let Some(dir) = dir else {
            return Ok(prompts);
        };

        if let Some(text) = read_optional(&dir.join(ANALYZE_FILE))? {
            prompts.analyze = text;
        }
        if let Some(text) = read_optional(&dir.join(STRUCTURE_FILE))? {
            prompts.structure = text;
        }
        let schema_path = dir.join(SCHEMA_FILE);
        if let Some(text) = read_optional(&schema_path)? {
            prompts.structure_schema = serde_json::from_str(&text).map_err(|source| {
                PromptError::Schema {
                    path: schema_path.clone(),
                    source,
                }
            })?;
        }

        info!(dir = %dir.display(), "Loaded prompt overrides");
        Ok(prompts)
    }

    pub fn analyze_parts(&self, rows: &[RawRow]) -> Vec<String> {
        vec![self.analyze.clone(), rows_block(rows)]
    }

    pub fn structure_parts(&self, analysis: &str, rows: &[RawRow]) -> Vec<String> {
        vec![
            self.structure.clone(),
            format!("Research notes:\n{analysis}"),
            rows_block(rows),
        ]
    }
}

fn rows_block(rows: &[RawRow]) -> String {
    let rows = serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string());
    format!("Rows:\n{rows}")
}

fn read_optional(path: &Path) -> Result<Option<String>, PromptError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PromptError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn default_structure_schema() -> Value {
    let nullable_string = json!({ "type": "string", "nullable": true });
    json!({
        "type": "object",
        "properties": {
            "elections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "municipality": { "type": "string" },
                        "state": { "type": "string" },
                        "position": { "type": "string" },
                        "election_date": nullable_string,
                        "description": nullable_string,
                        "candidates": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": { "type": "string" },
                                    "email": nullable_string,
                                    "party": nullable_string,
                                    "website": nullable_string,
                                    "bio": nullable_string
                                },
                                "required": ["name"]
                            }
                        }
                    },
                    "required": ["municipality", "state", "position", "candidates"]
                }
            }
        },
        "required": ["elections"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_directory() {
        let prompts = PromptSet::load(None).unwrap();
        assert_eq!(prompts, PromptSet::default());
        assert_eq!(prompts.structure_schema["required"][0], "elections");
    }

    #[test]
    fn directory_overrides_individual_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ANALYZE_FILE), "custom analyze").unwrap();

        let prompts = PromptSet::load(Some(dir.path())).unwrap();
        assert_eq!(prompts.analyze, "custom analyze");
        assert_eq!(prompts.structure, DEFAULT_STRUCTURE_PROMPT);
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SCHEMA_FILE), "{not json").unwrap();

        assert!(matches!(
            PromptSet::load(Some(dir.path())),
            Err(PromptError::Schema { .. })
        ));
    }

    #[test]
    fn structure_parts_include_analysis_and_rows() {
        let prompts = PromptSet::default();
        let parts = prompts.structure_parts("notes", &[RawRow::new("Austin", "TX", "Clerk")]);
        assert_eq!(parts.len(), 3);
        assert!(parts[1].contains("notes"));
        assert!(parts[2].contains("Austin"));
    }
}
