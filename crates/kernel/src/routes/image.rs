//! Image transformation route.
//!
//! `GET /image?input.source=...&output.typeToken=...` resolves the request
//! through the coordinator and streams the cached output.

use axum::{
    Router,
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;

use crate::error::ProxyError;
use crate::request::{ImageParams, TransformRequest};
use crate::services::coordinator::Resolved;
use crate::state::AppState;

/// Cached outputs never change, so clients may keep them for a year.
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Create the image routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/image", get(serve_image))
}

/// GET /image: serve or produce a transformed image.
async fn serve_image(
    State(state): State<AppState>,
    params: Result<Query<ImageParams>, QueryRejection>,
) -> Result<Response, ProxyError> {
    let Query(params) = params.map_err(|e| ProxyError::Validation(e.body_text()))?;
    let request = TransformRequest::from_params(&params)?;
    let resolved = state.images().resolve(&request).await?;
    Ok(stream_response(resolved))
}

fn stream_response(resolved: Resolved) -> Response {
    let Resolved {
        blob,
        format,
        fingerprint,
        status,
    } = resolved;

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_LENGTH, blob.len.to_string()),
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
            (header::ETAG, format!("\"{fingerprint}\"")),
        ],
        Body::from_stream(ReaderStream::new(blob.reader)),
    )
        .into_response();
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(status.as_str()));
    response
}
