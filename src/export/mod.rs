//! JSON export bundles
//!
//! The ledger exports itself through [`crate::ledger::LedgerSnapshot`]; this
//! module adds the single-result bundle and a file writer for either.

use crate::pipeline::{AnalysisInput, AnalysisResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to serialize export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Export of the current result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultExport {
    pub response: String,
    pub technical_data: Option<serde_json::Value>,
    pub verification_code: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: ExportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub original_text: String,
    pub file_name: Option<String>,
    pub question: String,
}

impl ResultExport {
    pub fn new(result: &AnalysisResult, input: &AnalysisInput, timestamp: DateTime<Utc>) -> Self {
        let original_text = input
            .resolve()
            .map(|request| request.text)
            .unwrap_or_default();

        Self {
            response: result.humanized_text.clone(),
            technical_data: result.technical_data.clone(),
            verification_code: result.verification_code.clone(),
            timestamp,
            metadata: ExportMetadata {
                original_text,
                file_name: input.source_file_name().map(str::to_string),
                question: input.question.clone().unwrap_or_default(),
            },
        }
    }
}

/// Pretty-print `value` as JSON into `path`
pub async fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), ExportError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|source| ExportError::Io {
            path: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), "Wrote export");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AuditLedger;
    use crate::pipeline::UploadedFile;
    use serde_json::json;

    fn sample_result() -> AnalysisResult {
        AnalysisResult {
            humanized_text: "Hello, analyzed.".to_string(),
            technical_data: Some(json!({"words": 1})),
            verification_code: Some("SAP-LOYW3V28-ABC123".to_string()),
        }
    }

    #[test]
    fn test_result_export_shape() {
        let input = AnalysisInput::typed("ignored")
            .with_upload(UploadedFile {
                name: "essay.txt".to_string(),
                content: "from file".to_string(),
            })
            .with_question("Is it formal?");

        let export = ResultExport::new(&sample_result(), &input, Utc::now());
        let json = serde_json::to_value(&export).unwrap();

        assert_eq!(json["response"], "Hello, analyzed.");
        assert_eq!(json["technicalData"]["words"], 1);
        assert_eq!(json["verificationCode"], "SAP-LOYW3V28-ABC123");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["metadata"]["originalText"], "from file");
        assert_eq!(json["metadata"]["fileName"], "essay.txt");
        assert_eq!(json["metadata"]["question"], "Is it formal?");
    }

    #[test]
    fn test_typed_input_has_no_file_name() {
        let export = ResultExport::new(&sample_result(), &AnalysisInput::typed("hi"), Utc::now());
        assert_eq!(export.metadata.original_text, "hi");
        assert_eq!(export.metadata.file_name, None);
        assert_eq!(export.metadata.question, "");

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["metadata"]["question"], "");
    }

    #[tokio::test]
    async fn test_write_ledger_snapshot() {
        let ledger = AuditLedger::new();
        ledger.record("a", "first", None);
        ledger.record("b", "second", Some("b.txt"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        write_json(&path, &ledger.export_snapshot()).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["totalEntries"], 2);
        assert_eq!(written["auditLogs"][0]["response"], "second");
        assert_eq!(written["auditLogs"][1]["response"], "first");
    }

    #[tokio::test]
    async fn test_write_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.json");
        let err = write_json(&path, &sample_result()).await.unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }
}
