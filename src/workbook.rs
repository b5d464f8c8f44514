//! Spreadsheet writer used by the WORKBOOK stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("workbook has no header row")]
    Empty,
    #[error("row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
}

/// Turns a cell matrix (header row first) into file bytes.
pub trait WorkbookWriter: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn write(&self, matrix: &[Vec<String>]) -> Result<Vec<u8>, WorkbookError>;
}

/// RFC 4180 CSV with CRLF line endings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvWorkbookWriter;

impl WorkbookWriter for CsvWorkbookWriter {
    fn content_type(&self) -> &'static str {
        "text/csv"
    }

    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write(&self, matrix: &[Vec<String>]) -> Result<Vec<u8>, WorkbookError> {
        let header = matrix.first().ok_or(WorkbookError::Empty)?;
        let width = header.len();

        let mut out = String::new();
        for (index, row) in matrix.iter().enumerate() {
            if row.len() != width {
                return Err(WorkbookError::RaggedRow {
                    row: index,
                    found: row.len(),
                    expected: width,
                });
            }
            let line: Vec<String> = row.iter().map(|cell| quote(cell)).collect();
            out.push_str(&line.join(","));
            out.push_str("\r\n");
        }
        Ok(out.into_bytes())
    }
}

fn quote(cell: &str) -> String {
    if cell.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
