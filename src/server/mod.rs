//! HTTP API サーバー

pub mod api_error;
pub mod model_routes;

use std::net::SocketAddr;
use std::path::Path;

use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::lifecycle::ModelLifecycleManager;
use crate::ml::InferenceService;
use crate::model::{AppConfig, ServerSettings};
use crate::types::{InitOutcome, ModelState};

/// ハンドラー間で共有する状態
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ModelLifecycleManager,
    pub inference: InferenceService,
    pub server: ServerSettings,
}

impl AppState {
    pub fn new(lifecycle: ModelLifecycleManager, server: ServerSettings) -> Self {
        Self {
            inference: InferenceService::new(lifecycle.clone()),
            lifecycle,
            server,
        }
    }
}

#[derive(Serialize)]
pub struct IndexResponse {
    pub message: String,
    pub endpoints: Vec<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub state: ModelState,
}

/// GET / - エンドポイント一覧
pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        message: "Fruit classification API".to_string(),
        endpoints: [
            "POST /api/model/train - train the model with uploaded images",
            "POST /api/model/train/dataset - train the model from the dataset directory",
            "POST /api/model/predict - classify one image",
            "GET /api/model/info - model status",
            "GET /api/model/export - download the trained model",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    })
}

/// GET /health - ヘルスチェック
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        state: state.lifecycle.state(),
    })
}

/// ルーターを組み立てる
pub fn router(state: AppState, public_dir: &Path) -> Router {
    // マルチパートの区切りやヘッダー分の余裕を足す
    let body_limit = state
        .server
        .max_upload_bytes
        .saturating_mul(state.server.max_upload_files)
        .saturating_add(1024 * 1024);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/api/model/train", post(model_routes::train_uploads))
        .route("/api/model/train/dataset", post(model_routes::train_dataset))
        .route("/api/model/predict", post(model_routes::predict))
        .route("/api/model/info", get(model_routes::model_info))
        .route("/api/model/export", get(model_routes::export))
        .with_state(state)
        .fallback_service(ServeDir::new(public_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// サーバーを起動する
///
/// 初期化（読み込みまたは学習）はバックグラウンドで走らせ、待たずに受け付けを始める。
pub async fn serve(config: &AppConfig, lifecycle: ModelLifecycleManager) -> anyhow::Result<()> {
    let init = lifecycle.clone();
    tokio::spawn(async move {
        match init.initialize().await {
            Ok(InitOutcome::NoModelAvailable { reason }) => {
                warn!("モデルなしで起動します: {}", reason)
            }
            Ok(outcome) => info!("初期化完了: {}", outcome_name(&outcome)),
            Err(e) => warn!("初期化に失敗しました: {}", e),
        }
    });

    let state = AppState::new(lifecycle, config.server.clone());
    let app = router(state, &config.paths.public_dir);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn outcome_name(outcome: &InitOutcome) -> &'static str {
    match outcome {
        InitOutcome::AlreadyReady => "already ready",
        InitOutcome::Loaded { .. } => "loaded persisted model",
        InitOutcome::Trained(_) => "trained from dataset",
        InitOutcome::NoModelAvailable { .. } => "no model available",
    }
}
