//! HTTP handlers for image operations.
//! Streams image bodies in both directions and delegates everything else to
//! `ImageRepository`. Handlers only ever see locators.

use crate::{
    errors::AppError,
    models::image::Locator,
    services::{
        image_repository::{ImageError, ImageResult},
        object_store::ByteStream,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::{future::Future, io};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Multipart field carrying the image.
const IMAGE_FIELD: &str = "image";

#[derive(Debug, Deserialize)]
pub struct LocatorQuery {
    pub locator: String,
}

#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LocatorResponse {
    pub locator: Locator,
}

#[derive(Debug, Serialize)]
pub struct LocatorsResponse {
    pub locators: Vec<Locator>,
}

/// `POST /images`: store the multipart `image` field as a new image.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let repository = &state.repository;
    let scope = &state.scope();

    let locator = with_image_field(&mut multipart, |file_name, body| async move {
        repository.create(body, &file_name, scope).await
    })
    .await?;

    Ok((StatusCode::CREATED, Json(LocatorResponse { locator })))
}

/// `GET /images?prefix=`: every stored image, optionally under a prefix.
pub async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ListImagesQuery>,
) -> Result<Json<LocatorsResponse>, AppError> {
    let scope = state.scope();
    let locators: Vec<Locator> = state
        .repository
        .enumerate(query.prefix.as_deref(), &scope)
        .try_collect()
        .await?;
    Ok(Json(LocatorsResponse { locators }))
}

/// `GET /image?locator=`: stream a validated image.
pub async fn get_image(
    State(state): State<AppState>,
    Query(query): Query<LocatorQuery>,
) -> Result<Response, AppError> {
    let download = state.repository.read(&query.locator, &state.scope()).await?;

    let mut response = Response::new(Body::from_stream(download.body));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&download.object.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(size) = download.object.size_bytes {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// `PUT /image?locator=`: replace an image with the multipart `image` field.
///
/// Responds with the locator to use from now on, which differs from the
/// request's unless the gateway updates in place.
pub async fn replace_image(
    State(state): State<AppState>,
    Query(query): Query<LocatorQuery>,
    mut multipart: Multipart,
) -> Result<Json<LocatorResponse>, AppError> {
    let repository = &state.repository;
    let scope = &state.scope();
    let old = query.locator.as_str();

    let locator = with_image_field(&mut multipart, |_file_name, body| async move {
        repository.update(old, body, scope).await
    })
    .await?;

    Ok(Json(LocatorResponse { locator }))
}

/// `DELETE /image?locator=`: succeeds whether or not the image existed.
pub async fn delete_image(
    State(state): State<AppState>,
    Query(query): Query<LocatorQuery>,
) -> Result<StatusCode, AppError> {
    state
        .repository
        .delete(&query.locator, &state.scope())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Find the image field and run `op` on it while its chunks are still
/// arriving. The field is never buffered whole.
///
/// A broken upload explains most operation failures, so the multipart error is
/// reported instead, except when the operation already destroyed data.
async fn with_image_field<T, F, Fut>(multipart: &mut Multipart, op: F) -> Result<T, AppError>
where
    F: FnOnce(String, ByteStream) -> Fut,
    Fut: Future<Output = ImageResult<T>>,
{
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);

        let forward = async move {
            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Consumer stopped reading; nothing left to do.
                            return None;
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        let _ = tx.send(Err(io::Error::other(err.body_text()))).await;
                        return Some(err);
                    }
                }
            }
        };

        let body: ByteStream = Box::pin(ReceiverStream::new(rx));
        let (upload_error, result) = tokio::join!(forward, op(file_name, body));

        return match (upload_error, result) {
            (_, Err(err @ ImageError::PartialUpdateFailure { .. })) => Err(err.into()),
            (Some(err), _) => Err(multipart_error(err)),
            (None, result) => result.map_err(AppError::from),
        };
    }

    Err(AppError::bad_request(format!(
        "multipart field `{}` is missing",
        IMAGE_FIELD
    )))
}

fn multipart_error(err: MultipartError) -> AppError {
    let status = err.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else if status.is_client_error() {
        "bad_request"
    } else {
        "upload_failed"
    };
    AppError::new(status, code, err.body_text())
}
