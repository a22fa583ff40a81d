//! HTTP surface: `POST /face-swap` and `GET /health`.

use crate::engine::{EngineError, EngineHandle};
use crate::storage::UploadGuard;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceswap_core::{Config, ModelInitializationArtifact, SwapError};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const MULTI_FACE_FIELD: &str = "multi_face_img";
const SINGLE_FACE_FIELD: &str = "single_face_img";

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub config: Arc<Config>,
    pub model: ModelInitializationArtifact,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Swap(SwapError),
    #[error("Field required: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Swap(e) => ApiError::Swap(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Swap(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": e.to_string() }))).into_response()
            }
            ApiError::MissingField(_) => {
                let detail = self.to_string();
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "detail": detail }))).into_response()
            }
            ApiError::Multipart(e) => e.into_response(),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "unhandled error in face-swap request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model_name: String,
    swapper_model: String,
    swapper_model_present: bool,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/face-swap", post(face_swap))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model_name: state.model.model_name.clone(),
        swapper_model: state.config.swapper_model_path.display().to_string(),
        swapper_model_present: state.config.swapper_model_path.exists(),
    })
}

async fn face_swap(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response, ApiError> {
    // Holds the uploads until the response is built.
    let mut uploads = UploadGuard::new();
    let mut target: Option<PathBuf> = None;
    let mut source: Option<PathBuf> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let (slot, prefix) = match name.as_str() {
            MULTI_FACE_FIELD => (&mut target, "multi"),
            SINGLE_FACE_FIELD => (&mut source, "single"),
            _ => continue,
        };
        let bytes = field.bytes().await?;
        let path = uploads
            .save(&state.config.upload_dir, prefix, &bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to save {name}: {e}")))?;
        *slot = Some(path);
    }

    let target = target.ok_or(ApiError::MissingField(MULTI_FACE_FIELD))?;
    let source = source.ok_or(ApiError::MissingField(SINGLE_FACE_FIELD))?;
    tracing::info!(target = %target.display(), source = %source.display(), "face swap requested");

    let artifact = state.engine.swap(target, source).await?;

    let bytes = tokio::fs::read(&artifact.result_image_path).await.map_err(|e| {
        ApiError::Internal(format!("failed to read {}: {e}", artifact.result_image_path.display()))
    })?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name());

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::fake_engine;
    use axum::body::Body;
    use axum::http::Request;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use tower::ServiceExt;

    const BOUNDARY: &str = "faceswap-test-boundary";

    fn test_config(root: &Path) -> Config {
        Config {
            output_dir: root.join("Artifacts"),
            upload_dir: root.join("uploads"),
            swapper_model_path: root.join("weights/inswapper_128.onnx"),
            ..Config::default()
        }
    }

    fn test_app(config: Config, missing_model: Option<PathBuf>) -> Router {
        let engine = fake_engine(config.clone(), missing_model);
        create_app(AppState {
            engine,
            config: Arc::new(config),
            model: ModelInitializationArtifact { model_name: "buffalo_l".into() },
        })
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::from_pixel(w, h, Rgb([90, 60, 30]))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn multipart_body(parts: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.png\"\r\n").as_bytes(),
            );
            body.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn swap_request(parts: &[(&str, Vec<u8>)]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/face-swap")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[tokio::test]
    async fn test_face_swap_returns_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(swap_request(&[(MULTI_FACE_FIELD, png(16, 16)), (SINGLE_FACE_FIELD, png(8, 8))]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename=\"swapped_face_"), "{disposition}");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));

        assert!(dir_is_empty(&dir.path().join("uploads")));
        assert!(!dir_is_empty(&dir.path().join("Artifacts/results")));
    }

    #[tokio::test]
    async fn test_no_faces_in_target() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(swap_request(&[(MULTI_FACE_FIELD, png(1, 1)), (SINGLE_FACE_FIELD, png(8, 8))]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "No faces detected in the multi-face image!" })
        );
        assert!(dir_is_empty(&dir.path().join("Artifacts/results")));
    }

    #[tokio::test]
    async fn test_no_faces_in_source() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(swap_request(&[(MULTI_FACE_FIELD, png(8, 8)), (SINGLE_FACE_FIELD, png(1, 1))]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["detail"],
            "No faces detected in the single-face image!"
        );
    }

    #[tokio::test]
    async fn test_missing_swapper_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let missing = config.swapper_model_path.clone();
        let app = test_app(config, Some(missing.clone()));

        let response = app
            .oneshot(swap_request(&[(MULTI_FACE_FIELD, png(8, 8)), (SINGLE_FACE_FIELD, png(8, 8))]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["detail"],
            format!("Swapper model not found at: {}", missing.display())
        );
        assert!(dir_is_empty(&dir.path().join("uploads")));
    }

    #[tokio::test]
    async fn test_missing_part_is_422() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(swap_request(&[(MULTI_FACE_FIELD, png(8, 8))]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["detail"], "Field required: single_face_img");
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model_name"], "buffalo_l");
        assert_eq!(body["swapper_model_present"], false);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(test_config(dir.path()), None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
