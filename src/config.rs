use arrow::csv::reader::Format;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Number of rows echoed back after a CSV load.
pub const DEFAULT_PREVIEW_ROWS: usize = 5;

/// Cell contents read as NULL unless overridden.
pub const DEFAULT_NULL_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// How the CSV source is parsed. Defaults match a plain comma-separated file
/// with a header row, types inferred from the whole file and the usual
/// missing-value markers read as NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvReadOptions {
    pub has_header: bool,
    pub delimiter: u8,
    /// Records sampled for type inference; `None` scans everything.
    pub max_read_records: Option<usize>,
    /// Exact cell contents that mean NULL. Matching is case-sensitive.
    pub null_tokens: Vec<String>,
}

impl Default for CsvReadOptions {
    fn default() -> Self {
        Self {
            has_header: true,
            delimiter: b',',
            max_read_records: None,
            null_tokens: DEFAULT_NULL_TOKENS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl CsvReadOptions {
    pub(crate) fn to_format(&self) -> Result<Format> {
        let mut format = Format::default().with_header(self.has_header);
        if self.delimiter != b',' {
            format = format.with_delimiter(self.delimiter);
        }
        if !self.null_tokens.is_empty() {
            format = format.with_null_regex(self.null_regex()?);
        }
        Ok(format)
    }

    fn null_regex(&self) -> Result<Regex> {
        let alternatives: Vec<String> =
            self.null_tokens.iter().map(|t| regex::escape(t)).collect();
        Ok(Regex::new(&format!("^(?:{})$", alternatives.join("|")))?)
    }
}

/// Options for [`crate::sqlite::create_csv_table_with`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateTableOptions {
    /// Drop and recreate the table when it already exists.
    pub overwrite: bool,
    pub preview_rows: usize,
    pub csv: CsvReadOptions,
}

impl Default for CreateTableOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            preview_rows: DEFAULT_PREVIEW_ROWS,
            csv: CsvReadOptions::default(),
        }
    }
}

impl CreateTableOptions {
    pub fn new(overwrite: bool) -> Self {
        Self {
            overwrite,
            ..Self::default()
        }
    }

    pub fn with_preview_rows(mut self, preview_rows: usize) -> Self {
        self.preview_rows = preview_rows;
        self
    }

    pub fn with_csv(mut self, csv: CsvReadOptions) -> Self {
        self.csv = csv;
        self
    }
}

/// What a table-creating write does when the target name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    /// Leave the table alone and write nothing.
    Fail,
    /// Drop it and recreate from the payload.
    Replace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_regex_matches_whole_cells_only() {
        let regex = CsvReadOptions::default().null_regex().unwrap();
        for token in ["", "NA", "N/A", "NaN", "null", "#N/A"] {
            assert!(regex.is_match(token), "{token:?} should be null");
        }
        for cell in ["NAN", "NAME", "0", "nullable", " NA"] {
            assert!(!regex.is_match(cell), "{cell:?} should be kept");
        }
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: CsvReadOptions = serde_json::from_str(r#"{"delimiter": 59}"#).unwrap();
        assert_eq!(options.delimiter, b';');
        assert!(options.has_header);
        assert_eq!(options.null_tokens.len(), DEFAULT_NULL_TOKENS.len());
    }
}
