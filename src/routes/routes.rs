//! Defines routes for the image API.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `POST   /images`: upload a new image (multipart field `image`)
//!   - `GET    /images`: list image locators (optional `prefix`)
//!
//! - **Single-image endpoints**, addressed by `?locator=`
//!   - `GET    /image`: download an image
//!   - `PUT    /image`: replace an image (multipart field `image`)
//!   - `DELETE /image`: delete an image
//!
//! Locators travel in the query string because public locators are full URLs.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{delete_image, get_image, list_images, replace_image, upload_image},
    },
    state::AppState,
};
use axum::{Router, extract::DefaultBodyLimit, routing::get};

/// Build and return the router for the image API.
///
/// Request bodies are capped at `max_upload_bytes`.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/images", get(list_images).post(upload_image))
        .route(
            "/image",
            get(get_image).put(replace_image).delete(delete_image),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
