//! Attachment upload and download

use axum::{
    extract::{Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppState;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_url: String,
}

pub fn file_url(file_id: &str) -> String {
    format!("/api/files/{}", file_id)
}

/// POST /api/files/upload
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data: Bytes = field
            .bytes()
            .await
            .map_err(|e| Error::BadRequest(e.to_string()))?;

        if data.is_empty() {
            return Err(Error::BadRequest("File is empty".to_string()));
        }
        if data.len() > state.config.max_file_bytes() {
            warn!("Rejected upload {} ({} bytes)", file_name, data.len());
            return Err(Error::PayloadTooLarge {
                limit_mb: state.config.max_file_mb,
            });
        }

        let meta = state.files.put(&file_name, &content_type, data).await?;
        info!(
            "POST /api/files/upload - {} ({} bytes) as {}",
            meta.file_name, meta.size, meta.file_id
        );

        return Ok(Json(UploadResponse {
            file_url: file_url(&meta.file_id),
            file_id: meta.file_id,
            file_name: meta.file_name,
            file_type: meta.content_type,
        }));
    }

    Err(Error::BadRequest("Missing 'file' field".to_string()))
}

/// GET /api/files/{file_id}
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response> {
    let (data, meta) = state
        .files
        .get(&file_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))?;

    let disposition = format!(
        "inline; filename=\"{}\"",
        meta.file_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, meta.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}
