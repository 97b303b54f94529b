use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Context filter value meaning "every processed file".
pub const ALL_FILES: &str = "All";

// -- /chat ------------------------------------------------------------------

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    /// `None` serializes as `null` and asks about every processed file.
    pub selected_file: Option<String>,
}

// -- /process ---------------------------------------------------------------

/// JSON returned by `POST /process`, persisted as the last comparison result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Gates whether chat is enabled.
    #[serde(default)]
    pub processed: bool,
    pub file_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_combined_summary: Option<String>,
}

impl ComparisonResult {
    /// Resolve a user-facing context choice into the `selected_file` value
    /// sent with a question.
    ///
    /// `None` and `"All"` mean no filter. Any other value must name one of the
    /// processed files. Chat is refused entirely until the backend reports the
    /// comparison as processed.
    pub fn context_filter(&self, requested: Option<&str>) -> Result<Option<String>> {
        if !self.processed {
            return Err(ChatError::InvalidInput(
                "files have not been processed; chat is disabled".to_string(),
            ));
        }
        match requested.map(str::trim) {
            None | Some("") | Some(ALL_FILES) => Ok(None),
            Some(name) if self.file_names.iter().any(|f| f == name) => Ok(Some(name.to_string())),
            Some(name) => Err(ChatError::InvalidInput(format!(
                "'{}' is not one of the processed files ({})",
                name,
                self.file_names.join(", ")
            ))),
        }
    }

    /// Context choices offered to the user, `"All"` first.
    pub fn context_options(&self) -> Vec<String> {
        std::iter::once(ALL_FILES.to_string())
            .chain(self.file_names.iter().cloned())
            .collect()
    }
}

// -- Reports ----------------------------------------------------------------

/// Metadata for one downloaded report, newest first in the persisted list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: String,
    pub title: String,
    pub summary: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    /// Where the report payload was written.
    #[serde(alias = "blobUrl")]
    pub blob_reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(names: &[&str]) -> ComparisonResult {
        ComparisonResult {
            processed: true,
            file_names: names.iter().map(|s| s.to_string()).collect(),
            diff_summary: None,
            code_combined_summary: None,
        }
    }

    #[test]
    fn test_chat_request_null_filter() {
        let req = ChatRequest { question: "What changed?".into(), selected_file: None };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"question":"What changed?","selected_file":null}"#);
    }

    #[test]
    fn test_context_filter_all_means_none() {
        let result = processed(&["a.pdf", "b.pdf"]);
        assert_eq!(result.context_filter(None).unwrap(), None);
        assert_eq!(result.context_filter(Some("All")).unwrap(), None);
    }

    #[test]
    fn test_context_filter_known_file() {
        let result = processed(&["report.pdf"]);
        assert_eq!(
            result.context_filter(Some("report.pdf")).unwrap().as_deref(),
            Some("report.pdf")
        );
    }

    #[test]
    fn test_context_filter_unknown_file_rejected() {
        let result = processed(&["report.pdf"]);
        assert!(matches!(
            result.context_filter(Some("other.pdf")),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_context_filter_requires_processed() {
        let mut result = processed(&["a.pdf"]);
        result.processed = false;
        assert!(result.context_filter(None).is_err());
    }

    #[test]
    fn test_context_options_all_first() {
        let result = processed(&["old.py", "new.py"]);
        assert_eq!(result.context_options(), vec!["All", "old.py", "new.py"]);
    }

    #[test]
    fn test_report_record_accepts_legacy_blob_url() {
        let json = r#"{"id":"k3x9","title":"Report","summary":"s","createdAt":17,"blobUrl":"blob:abc"}"#;
        let rec: ReportRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.blob_reference, "blob:abc");
        assert!(serde_json::to_string(&rec).unwrap().contains("\"blobReference\""));
    }
}
