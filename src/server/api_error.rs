//! HTTPエラーレスポンス

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::LifecycleError;

/// エラーレスポンスのボディ
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

/// ハンドラーが返すエラー
#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    /// リクエストの形式が不正（ファイル無し・画像以外など）
    BadRequest(String),
    /// アップロードサイズ超過
    PayloadTooLarge(String),
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        ApiError::Lifecycle(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(e) => match e {
                LifecycleError::AlreadyInProgress => StatusCode::CONFLICT,
                LifecycleError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                LifecycleError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::DatasetUnavailable(_) | LifecycleError::EmptyDataset(_) => {
                    StatusCode::BAD_REQUEST
                }
                LifecycleError::UnsupportedImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
                LifecycleError::TrainingFailure(_)
                | LifecycleError::PersistenceFailure(_)
                | LifecycleError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Lifecycle(e) => ErrorBody {
                error: e.kind().to_string(),
                detail: e.to_string(),
            },
            ApiError::BadRequest(detail) => ErrorBody {
                error: "bad_request".to_string(),
                detail: detail.clone(),
            },
            ApiError::PayloadTooLarge(detail) => ErrorBody {
                error: "payload_too_large".to_string(),
                detail: detail.clone(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();
        if status.is_server_error() {
            error!("{}: {}", body.error, body.detail);
        }
        (status, Json(body)).into_response()
    }
}
