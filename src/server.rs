//! Axum router construction and request handlers.
//!
//! The [`app`] function wires the form page, the upload endpoint and the
//! operational endpoints and returns a ready-to-serve [`axum::Router`].
//!
//! `POST /upload` always answers with a redirect to `/` carrying a flash
//! message, except when the body is over the size limit, which is a 413.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use chrono::Utc;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::errors::UploadError;
use crate::flash::{self, ResultMessage, CLEAR_FLASH_COOKIE};
use crate::metrics::{metrics_handler, metrics_middleware, record_upload};
use crate::pages;
use crate::upload::{UploadRequest, Uploader};
use crate::AppState;

/// Room for multipart boundaries and part headers on top of the file cap.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Name of the form field holding the file.
const FILE_FIELD: &str = "file";

/// Build the axum [`Router`] with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_upload_size + MULTIPART_OVERHEAD;

    let mut router = Router::new()
        .route("/", get(handle_index))
        .route("/upload", post(handle_upload))
        .route("/files", get(handle_list_files))
        .route("/health", get(health_check));

    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        // The axum default (2 MB) is replaced by an explicit limit sized to
        // the upload cap; oversized requests get a 413 before any handler.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Form page ---------------------------------------------------------------

/// `GET /` -- the upload form, with any pending flash message.
async fn handle_index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let cookie = flash::read_cookie(&headers);
    let message = cookie
        .as_deref()
        .and_then(|value| state.flash.decode(value, Utc::now()));

    let template = pages::load_template(&state.config.server.template_path).await;
    let html = pages::render_index(template.as_deref(), message.as_ref());

    let mut response = Html(html).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    // Read at most once: any flash cookie, valid or not, is cleared here.
    if cookie.is_some() {
        response_headers.insert(
            header::SET_COOKIE,
            HeaderValue::from_static(CLEAR_FLASH_COOKIE),
        );
    }
    response
}

// -- Upload ------------------------------------------------------------------

/// `POST /upload` -- store the submitted file and redirect back to the form.
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let max = state.config.server.max_upload_size;

    let request = match multipart {
        Ok(multipart) => read_upload(multipart, max).await,
        Err(rejection) => Err(UploadError::Multipart(rejection.body_text())),
    };

    let result = match request {
        Ok(request) => {
            let uploader = Uploader::new(state.storage.clone(), max);
            uploader.upload(request, (state.clock)()).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => {
            record_upload("success", outcome.size);
            info!(
                blob = %outcome.blob_name,
                url = %outcome.url,
                size = outcome.size,
                "Upload complete"
            );
            redirect_home(
                &state,
                ResultMessage::success(format!(
                    "File '{}' uploaded successfully!",
                    outcome.filename
                )),
            )
        }
        Err(e @ UploadError::PayloadTooLarge { .. }) => {
            record_upload(e.kind(), 0);
            warn!("Rejected upload: {}", e);
            e.into_response()
        }
        Err(UploadError::NoFileSelected) => {
            record_upload(UploadError::NoFileSelected.kind(), 0);
            redirect_home(
                &state,
                ResultMessage::error(UploadError::NoFileSelected.user_message()),
            )
        }
        Err(e) => {
            record_upload(e.kind(), 0);
            error!("Error uploading file: {}", e);
            redirect_home(&state, ResultMessage::error(e.user_message()))
        }
    }
}

/// Pull the `file` part out of the form, enforcing the size cap while
/// reading.  Other fields are skipped.
async fn read_upload(mut multipart: Multipart, max: usize) -> Result<UploadRequest, UploadError> {
    let map_err = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UploadError::PayloadTooLarge { limit: max }
        } else {
            UploadError::Multipart(e.body_text())
        }
    };

    while let Some(mut field) = multipart.next_field().await.map_err(map_err)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(UploadError::NoFileSelected);
        }
        let content_type = field.content_type().map(str::to_string);

        let mut data = BytesMut::new();
        while let Some(chunk) = field.chunk().await.map_err(map_err)? {
            if data.len() + chunk.len() > max {
                return Err(UploadError::PayloadTooLarge { limit: max });
            }
            data.extend_from_slice(&chunk);
        }

        return Ok(UploadRequest {
            filename,
            content_type,
            data: data.freeze(),
        });
    }

    Err(UploadError::NoFileSelected)
}

/// 302 to `/` with `message` in the flash cookie.
fn redirect_home(state: &AppState, message: ResultMessage) -> Response {
    let cookie = state.flash.set_cookie(&message, Utc::now());
    let mut response = (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response();
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(e) => warn!("Flash cookie not set: {}", e),
    }
    response
}

// -- Listing -----------------------------------------------------------------

/// `GET /files` -- names of the blobs in the container.
async fn handle_list_files(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.list_blobs().await {
        Ok(names) => Json(names).into_response(),
        Err(e) => {
            error!("Error listing files: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flash::FlashSigner;
    use crate::storage::backend::StorageBackend;
    use crate::storage::memory::MemoryBackend;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, TimeZone};
    use tower::ServiceExt;

    const BOUNDARY: &str = "blobdropTestBoundary";

    fn new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn test_state(max_upload_size: usize) -> (Arc<AppState>, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new("uploads", 0));
        let mut config = Config::default();
        config.server.max_upload_size = max_upload_size;
        config.server.template_path = "does/not/exist.html".to_string();
        config.observability.metrics = false;
        let state = Arc::new(AppState {
            config,
            storage: storage.clone(),
            flash: FlashSigner::new("test-secret"),
            clock: new_year,
        });
        (state, storage)
    }

    /// (field name, filename, content) triples as multipart/form-data.
    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(f) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: text/plain\r\n\r\n",
                        name, f
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        name
                    )
                    .as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>, with_length: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            );
        if with_length {
            builder = builder.header("content-length", body.len());
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn flash_cookie(response: &Response) -> String {
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("flash cookie set")
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    /// Follow a redirect to `/` carrying its flash cookie and return the page.
    async fn follow(state: &Arc<AppState>, redirect: &Response) -> String {
        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, flash_cookie(redirect))
            .body(Body::empty())
            .unwrap();
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let cleared = response
            .headers()
            .get(header::SET_COOKIE)
            .map(|v| v.to_str().unwrap().to_string());
        assert_eq!(cleared.as_deref(), Some(CLEAR_FLASH_COOKIE));
        body_text(response).await
    }

    fn assert_redirect_home(response: &Response) {
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
    }

    #[tokio::test]
    async fn test_index_serves_form() {
        let (state, _) = test_state(1024);
        let response = app(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let html = body_text(response).await;
        assert!(html.contains(r#"action="/upload""#));
        assert!(html.contains(r#"type="file" name="file""#));
    }

    #[tokio::test]
    async fn test_index_uses_template_file() {
        let (state, _) = test_state(1024);
        let mut config = state.config.clone();
        config.server.template_path = "templates/index.html".to_string();
        let state = Arc::new(AppState {
            config,
            storage: state.storage.clone(),
            flash: FlashSigner::new("test-secret"),
            clock: new_year,
        });
        let response = app(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let html = body_text(response).await;
        assert!(html.contains("Maximum size: 16 MB"));
        assert!(html.contains(r#"action="/upload""#));
        assert!(!html.contains("{{ flash }}"));
    }

    #[tokio::test]
    async fn test_upload_end_to_end() {
        let (state, storage) = test_state(16 * 1024 * 1024);
        let body = multipart_body(&[("file", Some("report.txt"), b"0123456789")]);

        let response = app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_redirect_home(&response);

        let blob = storage
            .get_blob("20240101_000000_report.txt")
            .await
            .expect("blob written");
        assert_eq!(blob.data.len(), 10);
        assert_eq!(blob.content_type, "text/plain");

        let html = follow(&state, &response).await;
        assert!(html.contains("File &#x27;report.txt&#x27; uploaded successfully!"));
        assert!(html.contains("flash-success"));
    }

    #[tokio::test]
    async fn test_upload_sanitizes_name() {
        let (state, storage) = test_state(1024);
        let body = multipart_body(&[("file", Some("../../etc/passwd"), b"root")]);

        let response = app(state).oneshot(upload_request(body, true)).await.unwrap();
        assert_redirect_home(&response);
        assert_eq!(
            storage.list_blobs().await.unwrap(),
            vec!["20240101_000000_etc_passwd"]
        );
    }

    #[tokio::test]
    async fn test_missing_file_part() {
        let (state, storage) = test_state(1024);
        let body = multipart_body(&[("comment", None, b"hello")]);

        let response = app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_redirect_home(&response);
        assert_eq!(storage.call_count(), 0);

        let html = follow(&state, &response).await;
        assert!(html.contains("No file selected"));
        assert!(html.contains("flash-error"));
    }

    #[tokio::test]
    async fn test_empty_filename() {
        let (state, storage) = test_state(1024);
        let body = multipart_body(&[("file", Some(""), b"")]);

        let response = app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_redirect_home(&response);
        assert_eq!(storage.call_count(), 0);

        let html = follow(&state, &response).await;
        assert!(html.contains("No file selected"));
    }

    #[tokio::test]
    async fn test_not_multipart_redirects_with_error() {
        let (state, storage) = test_state(1024);
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", "text/plain")
            .body(Body::from("hello"))
            .unwrap();

        let response = app(state.clone()).oneshot(request).await.unwrap();
        assert_redirect_home(&response);
        assert_eq!(storage.call_count(), 0);

        let html = follow(&state, &response).await;
        assert!(html.contains("Error uploading file"));
    }

    #[tokio::test]
    async fn test_default_cap_boundary() {
        let max = Config::default().server.max_upload_size;
        assert_eq!(max, 16 * 1024 * 1024);

        let (state, storage) = test_state(max);
        let exact = vec![b'x'; max];
        let body = multipart_body(&[("file", Some("exact.bin"), &exact)]);
        let response = app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_redirect_home(&response);
        let blob = storage
            .get_blob("20240101_000000_exact.bin")
            .await
            .expect("blob at the cap is accepted");
        assert_eq!(blob.data.len(), max);

        let calls = storage.call_count();
        let over = vec![b'x'; max + 1];
        let body = multipart_body(&[("file", Some("over.bin"), &over)]);
        let response = app(state).oneshot(upload_request(body, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(storage.call_count(), calls);
    }

    #[tokio::test]
    async fn test_oversized_with_content_length_rejected() {
        let (state, storage) = test_state(1024);
        let big = vec![b'x'; 1024 + MULTIPART_OVERHEAD + 1];
        let body = multipart_body(&[("file", Some("big.bin"), &big)]);

        let response = app(state).oneshot(upload_request(body, true)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(storage.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_file_within_body_limit_rejected() {
        let (state, storage) = test_state(1024);
        let big = vec![b'x'; 2048];
        let body = multipart_body(&[("file", Some("big.bin"), &big)]);

        let response = app(state).oneshot(upload_request(body, false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(storage.call_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_redirects_with_reason() {
        let (state, storage) = test_state(1024);
        storage.set_deny_auth(true);
        let body = multipart_body(&[("file", Some("report.txt"), b"data")]);

        let response = app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_redirect_home(&response);
        assert!(!storage.container_exists().await);

        let html = follow(&state, &response).await;
        assert!(html.contains("Error uploading file: Authentication failed"));
    }

    #[tokio::test]
    async fn test_tampered_flash_cookie_ignored_and_cleared() {
        let (state, _) = test_state(1024);
        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, "blobdrop_flash=forged.value")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::SET_COOKIE).unwrap(),
            CLEAR_FLASH_COOKIE
        );
        let html = body_text(response).await;
        assert!(!html.contains("class=\"flash"));
    }

    #[tokio::test]
    async fn test_list_files() {
        let (state, storage) = test_state(1024);
        let body = multipart_body(&[("file", Some("a.txt"), b"a")]);
        app(state.clone())
            .oneshot(upload_request(body, true))
            .await
            .unwrap();
        assert_eq!(storage.blob_count().await, 1);

        let response = app(state)
            .oneshot(Request::builder().uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let names: Vec<String> = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(names, vec!["20240101_000000_a.txt"]);
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = test_state(1024);
        let response = app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"status":"ok"}"#);
    }
}
