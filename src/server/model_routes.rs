//! /api/model 以下のハンドラー
//!
//! マルチパートの取り出しとレスポンスの整形だけを行い、
//! 状態はすべてライフサイクル側が持つ。

use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::ml::{DatasetSource, UploadedFile};
use crate::server::api_error::ApiError;
use crate::server::AppState;
use crate::types::{Prediction, StatusSnapshot, TrainingReport};

/// 学習用画像のフィールド名
pub const IMAGES_FIELD: &str = "images";

/// 推論用画像のフィールド名
pub const IMAGE_FIELD: &str = "image";

/// エクスポートのファイル名
pub const EXPORT_FILE_NAME: &str = "fruit-classifier-model.tar.gz";

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub message: String,
    #[serde(flatten)]
    pub report: TrainingReport,
}

impl From<TrainingReport> for TrainResponse {
    fn from(report: TrainingReport) -> Self {
        Self {
            message: "model trained successfully".to_string(),
            report,
        }
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::BadRequest(e.body_text())
    }
}

/// フィールドを1つ読み、画像であることとサイズを確認する
///
/// 上限を超えた時点で読むのをやめる。
async fn read_image_field(
    mut field: axum::extract::multipart::Field<'_>,
    max_bytes: usize,
) -> Result<UploadedFile, ApiError> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let content_type = field.content_type().unwrap_or_default().to_string();
    if !content_type.starts_with("image/") {
        return Err(ApiError::BadRequest(format!(
            "only image files are accepted ({}: {})",
            filename,
            if content_type.is_empty() { "no content type" } else { content_type.as_str() }
        )));
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "{} exceeds the limit of {} bytes",
                filename, max_bytes
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(UploadedFile { filename, bytes })
}

/// POST /api/model/train - アップロード画像で学習
pub async fn train_uploads(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TrainResponse>, ApiError> {
    let limits = &state.server;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGES_FIELD) {
            continue;
        }
        if files.len() >= limits.max_upload_files {
            return Err(ApiError::BadRequest(format!(
                "at most {} images can be uploaded at once",
                limits.max_upload_files
            )));
        }
        files.push(read_image_field(field, limits.max_upload_bytes).await?);
    }

    if files.is_empty() {
        return Err(ApiError::BadRequest("no images were provided for training".to_string()));
    }

    info!("{} 枚の画像を処理します", files.len());
    let report = state.lifecycle.train_from(DatasetSource::Uploads(files)).await?;
    Ok(Json(report.into()))
}

/// POST /api/model/train/dataset - 設定されたデータセットで学習
pub async fn train_dataset(State(state): State<AppState>) -> Result<Json<TrainResponse>, ApiError> {
    let root = state.lifecycle.settings().dataset_root.clone();
    let report = state.lifecycle.train_from(DatasetSource::Directory(root)).await?;
    Ok(Json(report.into()))
}

/// POST /api/model/predict - 1枚の画像を分類
pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some(IMAGE_FIELD) {
            let upload = read_image_field(field, state.server.max_upload_bytes).await?;
            let prediction = state.inference.predict(upload.bytes).await?;
            return Ok(Json(prediction));
        }
    }
    Err(ApiError::BadRequest("no image was provided".to_string()))
}

/// GET /api/model/info - モデルの状態
pub async fn model_info(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.lifecycle.status())
}

/// GET /api/model/export - 保存済みモデルをtar.gzで返す
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stream = state.lifecycle.exporter().export()?;
    let body = Body::from_stream(stream);

    let content_disposition = format!("attachment; filename=\"{}\"", EXPORT_FILE_NAME);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, content_disposition),
        ],
        body,
    ))
}
