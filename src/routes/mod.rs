//! Router assembly: HTTP endpoints, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{warn, Level};

use crate::config::Settings;
use crate::state::AppState;

pub mod generate;
pub mod http;
pub mod quiz;

/// Uploaded question images can be large phone photos.
const IMAGE_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// CORS for the configured origins, or any origin when none are configured.
fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(target: "gestalt_backend", origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let allow_origin = if origins.is_empty() { AllowOrigin::from(Any) } else { AllowOrigin::list(origins) };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the application router with:
/// - JSON API under `/api/v1/...`
/// - Static SPA from `./static` with index fallback
/// - CORS (any origin unless `settings.cors_origins` is set)
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    // Static files with SPA fallback
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    let cors = cors_layer(&state.settings);

    let images = Router::new()
        .route("/api/v1/generate/images", post(generate::http_generate_images))
        .route("/api/v1/generate/images/preview", post(generate::http_preview_images))
        .layer(DefaultBodyLimit::max(IMAGE_BODY_LIMIT));

    Router::new()
        .route("/api/v1/health", get(http::http_health))
        // Generation
        .route("/api/v1/generate", post(generate::http_generate))
        .route("/api/v1/generate/preview", post(generate::http_preview))
        .merge(images)
        // Packages, folders, files
        .route("/api/v1/packages", get(http::http_list_packages).post(http::http_create_package))
        .route("/api/v1/packages/folders", post(http::http_create_folder))
        .route("/api/v1/packages/:id", get(http::http_get_package))
        .route("/api/v1/packages/:id/folders", get(http::http_package_folders))
        .route("/api/v1/packages/:id/folders/:folder_id/files", get(http::http_folder_files))
        .route("/api/v1/packages/:id/folders/:folder_id/download", get(http::http_download_folder))
        .route("/api/v1/packages/:id/download", get(http::http_download_package))
        .route("/api/v1/packages/:id/folder", get(http::http_first_folder))
        .route("/api/v1/packages/:id/folder/files", get(http::http_first_folder_files))
        .route("/api/v1/packages/:id/files/:file_id", get(http::http_file_content))
        .route("/api/v1/folders", get(http::http_list_folders))
        // Rendering
        .route("/api/v1/quiz/:package_id", post(quiz::http_render_quiz))
        .route("/api/v1/html/convert", post(http::http_convert_html))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Frontend fallback
        .fallback_service(static_service)
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    pub async fn send(app: Router, req: Request<Body>) -> Response {
        app.oneshot(req).await.unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    pub fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub async fn body_bytes(res: Response) -> Vec<u8> {
        to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    pub async fn json_of(res: Response) -> (StatusCode, Value) {
        let status = res.status();
        let bytes = body_bytes(res).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }
}
