//! Wire types for the analysis backend's HTTP API.

use crate::session::Model;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: Model,
}

/// Synchronous acknowledgement of `POST /api/upload`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadAck {
    /// True when indexing continues in the background and status must be polled.
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Name the backend registered the job under (the uploaded file name).
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `GET /api/status`: readiness and per-file progress.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    /// "ready" or "initializing".
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub query_engine_ready: bool,
    #[serde(default)]
    pub total_files: u32,
    #[serde(default)]
    pub completed_files: u32,
    #[serde(default)]
    pub processing_files: u32,
    #[serde(default)]
    pub error_files: u32,
    #[serde(default)]
    pub files_detail: Vec<FileDetail>,
}

impl StatusResponse {
    /// Detail entry whose filename matches exactly.
    pub fn file(&self, file_name: &str) -> Option<&FileDetail> {
        self.files_detail.iter().find(|f| f.filename == file_name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDetail {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    /// Unix seconds.
    #[serde(default)]
    pub upload_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /api/clear` result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearResponse {
    #[serde(default)]
    pub message: Option<String>,
    /// "success" or "warning".
    #[serde(default)]
    pub status: Option<String>,
}

/// `GET /api/health` result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Error body shape shared by all endpoints on failure: `{ "error": "...", "status": "error" }`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_matches_file_by_exact_name() {
        let status: StatusResponse = serde_json::from_str(
            r#"{"status":"initializing","query_engine_ready":false,"total_files":2,
                "completed_files":1,"processing_files":1,"error_files":0,
                "files_detail":[
                    {"filename":"report.pdf","status":"completed","upload_time":1700000000.5,"error":null},
                    {"filename":"report.pdf.bak","status":"processing","upload_time":1700000001.0}
                ],"timestamp":1700000002.0}"#,
        )
        .unwrap();
        assert_eq!(status.file("report.pdf").unwrap().status, "completed");
        assert_eq!(status.file("report.pdf.bak").unwrap().status, "processing");
        assert!(status.file("Report.pdf").is_none());
    }

    #[test]
    fn chat_request_serializes_model_id() {
        let body = serde_json::to_value(ChatRequest {
            message: "hi".into(),
            model: Model::Azure,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"message": "hi", "model": "azure"}));
    }
}
