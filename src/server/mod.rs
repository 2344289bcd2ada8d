//! HTTPサーバー
//!
//! 推論の前後処理だけを担当し、分類そのものは推論ワーカーに任せます。

pub mod state;
pub mod worker;

use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::backend::{cpu_device, resolve_device_type, CpuBackend};
#[cfg(feature = "wgpu")]
use crate::backend::{gpu_device, GpuBackend};
use crate::error::Error;
use crate::ml::{ClassRegistry, PredictionResult};
use crate::model::{AppConfig, ServerSettings};
#[cfg(feature = "wgpu")]
use crate::model::DeviceType;

pub use state::{ServerState, StatusReport, MODEL_NAME};
pub use worker::{InferenceWorker, WorkerSettings};

/// アップロードできる画像の最大サイズ
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// multipart で画像を受け取るフィールド名
pub const FILE_FIELD: &str = "file";

/// エラーレスポンス（`{"error": ...}`）
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        if error.is_per_request() {
            tracing::warn!("推論リクエストが失敗しました: {:?}", error);
        } else {
            tracing::error!("推論サービスのエラー: {:?}", error);
        }
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        Self {
            status: error.status(),
            message: error.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// /predict のレスポンス
#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub filename: Option<String>,
    #[serde(flatten)]
    pub result: PredictionResult,
}

/// ルーターを構築
pub fn router(state: ServerState, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors_layer(settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(settings: &ServerSettings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("無効なCORSオリジンを無視します: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "RETINA CNN backend running" }))
}

async fn health(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.worker.is_alive() { "ok" } else { "unavailable" },
        "device": state.device.to_string(),
        "classes": state.registry.labels(),
    }))
}

async fn status(State(state): State<ServerState>) -> Json<StatusReport> {
    Json(state.status())
}

async fn predict(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        tracing::debug!("画像を受信しました: {:?} ({} バイト)", filename, bytes.len());

        let result = state.worker.predict(bytes.to_vec()).await?;
        tracing::info!(
            "予測: {:?} -> {} ({:.4})",
            filename,
            result.prediction,
            result.confidence
        );

        return Ok(Json(PredictResponse { filename, result }));
    }

    Err(ApiError::bad_request(format!(
        "multipart フィールド '{}' がありません",
        FILE_FIELD
    )))
}

/// 設定に従って推論ワーカーを起動し、HTTPサーバーを実行
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let registry = ClassRegistry::build(&config.model.dataset_dir)
        .context("クラス一覧の構築に失敗しました")?;
    let device = resolve_device_type(&config.device_type);

    let settings = WorkerSettings {
        checkpoint_path: config.model.checkpoint_path.clone(),
        registry: registry.clone(),
        architecture: config.model.architecture(registry.len()),
        inference: config.inference.clone(),
        queue_capacity: config.server.queue_capacity,
        timeout: config.server.predict_timeout_secs.map(Duration::from_secs),
    };

    let worker = match device {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => InferenceWorker::spawn::<GpuBackend, _>(settings, gpu_device).await,
        _ => InferenceWorker::spawn::<CpuBackend, _>(settings, cpu_device).await,
    }
    .context("モデルの読み込みに失敗しました")?;

    let state = ServerState::new(worker, registry, device);
    let app = router(state, &config.server);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("{} で待ち受けできません", addr))?;
    tracing::info!("サーバーを起動しました: http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("サーバーが異常終了しました")?;

    tracing::info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("シグナルの待機に失敗しました: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::RetinaCnnConfig;
    use crate::model::{save_checkpoint, CheckpointMetadata, DeviceType, InferenceConfig};
    use axum::body::Body;
    use axum::http::Request;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "retina-test-boundary";

    async fn test_app(dir: &std::path::Path) -> Router {
        let config = RetinaCnnConfig::new(3)
            .with_image_size(16)
            .with_base_channels(4)
            .with_hidden_size(8);
        let model = config.init::<CpuBackend>(&cpu_device()).unwrap();
        let labels = vec!["cataract".to_string(), "glaucoma".into(), "normal".into()];
        let metadata = CheckpointMetadata::new(config.clone(), labels.clone(), 1);
        let path = save_checkpoint(&dir.join("model"), &metadata, &model).unwrap();
        let registry = ClassRegistry::from_labels(labels).unwrap();

        let worker = InferenceWorker::spawn::<CpuBackend, _>(
            WorkerSettings {
                checkpoint_path: path,
                registry: registry.clone(),
                architecture: config,
                inference: InferenceConfig::default(),
                queue_capacity: 4,
                timeout: None,
            },
            cpu_device,
        )
        .await
        .unwrap();

        router(
            ServerState::new(worker, registry, DeviceType::Cpu),
            &ServerSettings::default(),
        )
    }

    fn multipart_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(32, 32, Rgb([200, 80, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_status_reports_classes() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["model"], MODEL_NAME);
        assert_eq!(body["ready"], true);
        assert_eq!(body["classes"], json!(["cataract", "glaucoma", "normal"]));
    }

    #[tokio::test]
    async fn test_predict_returns_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let response = app
            .oneshot(multipart_request("file", "eye.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["filename"], "eye.png");
        assert_eq!(body["top_predictions"].as_array().unwrap().len(), 3);
        assert!(body["confidence"].as_f64().is_some());
        assert!(body["message"].is_string());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_image_is_500_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let response = app
            .oneshot(multipart_request("file", "eye.png", b"not an image"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_file_field_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let response = app
            .oneshot(multipart_request("image", "eye.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
