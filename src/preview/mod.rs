//! Operator preview server
//!
//! ## Responsibilities
//!
//! - Serve the landing page and the MJPEG stream for browsers.
//! - Encode frames per connected client at low quality; a slow client never
//!   blocks the frame loop, it just sees fewer frames.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::stream;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::debug;

use crate::state::AppState;

const JPEG_QUALITY: u8 = 10;

const INDEX_HTML: &str = r#"<html>
    <head>
        <title>__TITLE__</title>
        <style>
            body {
                background-color: black;
            }

            img {
                position: absolute;
                left: 50%;
                top: 50%;
                transform: translate(-50%, -50%);
                max-width: 100%;
                max-height: 100%;
            }
        </style>
    </head>
    <body>
        <img src="stream.mjpg" />
    </body>
</html>
"#;

/// Create preview router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream.mjpg", get(stream_mjpg))
        .fallback(not_found)
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(INDEX_HTML.replace("__TITLE__", &format!("TagSight {}", state.device_name)))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// One multipart body part: boundary, part headers, JPEG payload.
fn encode_part(frame: &RgbImage) -> Bytes {
    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    if let Err(e) = frame.write_with_encoder(encoder) {
        debug!(error = %e, "preview frame encode failed");
        return Bytes::new();
    }
    let mut part = Vec::with_capacity(jpeg.len() + 80);
    part.extend_from_slice(
        format!(
            "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(&jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

async fn stream_mjpg(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.preview_rx.clone();
    let body = stream::unfold(rx, |mut rx| async move {
        // The sender dropping means the frame loop is gone; end the stream.
        if rx.changed().await.is_err() {
            return None;
        }
        let frame = rx.borrow_and_update().clone();
        let part = match frame {
            Some(frame) => encode_part(&frame),
            None => Bytes::new(),
        };
        Some((Ok::<Bytes, Infallible>(part), rx))
    });

    (
        [
            (header::AGE, "0"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
            (
                header::CONTENT_TYPE,
                "multipart/x-mixed-replace; boundary=FRAME",
            ),
        ],
        Body::from_stream(body),
    )
}
