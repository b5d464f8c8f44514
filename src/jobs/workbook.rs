use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::{JobContext, JobHandler, decode};
use crate::error::JobError;
use crate::models::JobType;
use crate::payload::{JobOutput, RawRow, RawRows, UploadSummary, WorkbookResult};
use crate::workbook::WorkbookWriter;

const FIXED_COLUMNS: [&str; 5] = ["Name", "Email", "Municipality", "State", "Position"];
const PROFILE_COLUMN: &str = "Profile URL";

/// Exports every uploaded row with a link to the inserted profile.
pub struct WorkbookHandler {
    writer: Arc<dyn WorkbookWriter>,
    public_base_url: String,
}

impl WorkbookHandler {
    pub fn new(writer: Arc<dyn WorkbookWriter>, public_base_url: String) -> Self {
        Self {
            writer,
            public_base_url,
        }
    }
}

#[async_trait]
impl JobHandler for WorkbookHandler {
    fn job_type(&self) -> JobType {
        JobType::Workbook
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let raw = ctx.upload.raw_rows.as_ref().ok_or_else(|| {
            JobError::permanent(format!("upload {} rows have been scrubbed", ctx.upload.id))
        })?;
        let RawRows(rows) = decode(raw, "upload rows")?;
        let summary = UploadSummary::from_json(&ctx.upload.summary);

        let matrix = build_matrix(&rows, &summary.email_to_slug(), &self.public_base_url);
        let bytes = self
            .writer
            .write(&matrix)
            .map_err(|err| JobError::permanent(format!("workbook export failed: {err}")))?;

        Ok(JobOutput::Workbook(WorkbookResult {
            filename: results_filename(&ctx.upload.original_filename, self.writer.extension()),
            content_type: self.writer.content_type().to_string(),
            content_base64: STANDARD.encode(bytes),
            row_count: rows.len(),
        }))
    }
}

/// `roster.xlsx` -> `roster-results.csv`
pub fn results_filename(original: &str, extension: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("upload");
    format!("{stem}-results.{extension}")
}

fn build_matrix(
    rows: &[RawRow],
    email_to_slug: &BTreeMap<String, String>,
    public_base_url: &str,
) -> Vec<Vec<String>> {
    let extra_columns: BTreeSet<&String> = rows.iter().flat_map(|row| row.extra.keys()).collect();

    let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|name| name.to_string()).collect();
    header.extend(extra_columns.iter().map(|name| name.to_string()));
    header.push(PROFILE_COLUMN.to_string());

    let mut matrix = Vec::with_capacity(rows.len() + 1);
    matrix.push(header);
    for row in rows {
        let mut cells = vec![
            row.name.clone().unwrap_or_default(),
            row.email.clone().unwrap_or_default(),
            row.municipality.clone().unwrap_or_default(),
            row.state.clone().unwrap_or_default(),
            row.position.clone().unwrap_or_default(),
        ];
        cells.extend(
            extra_columns
                .iter()
                .map(|column| cell_text(row.extra.get(column.as_str()))),
        );
        let profile = row
            .email
            .as_deref()
            .map(|email| email.trim().to_lowercase())
            .and_then(|email| email_to_slug.get(&email))
            .map(|slug| format!("{public_base_url}/candidates/{slug}"))
            .unwrap_or_default();
        cells.push(profile);
        matrix.push(cells);
    }
    matrix
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filename_keeps_stem() {
        assert_eq!(results_filename("roster.xlsx", "csv"), "roster-results.csv");
        assert_eq!(results_filename("", "csv"), "upload-results.csv");
    }

    #[test]
    fn matrix_links_profiles_by_email() {
        let mut row = RawRow::new("Austin", "TX", "Clerk")
            .with_name("Ann Lee")
            .with_email("ANN@example.com");
        row.extra.insert("phone".into(), json!("555"));
        let other = RawRow::new("Austin", "TX", "Clerk").with_name("No Email");
        let slugs = BTreeMap::from([("ann@example.com".to_string(), "ann-lee-austin-tx".to_string())]);

        let matrix = build_matrix(&[row, other], &slugs, "https://example.org");

        assert_eq!(
            matrix[0],
            vec!["Name", "Email", "Municipality", "State", "Position", "phone", "Profile URL"]
        );
        assert_eq!(matrix[1][5], "555");
        assert_eq!(matrix[1][6], "https://example.org/candidates/ann-lee-austin-tx");
        assert_eq!(matrix[2][5], "");
        assert_eq!(matrix[2][6], "");
    }
}
