//! Single-attempt binary upload to the content API's asset endpoint.
//!
//! Retry policy lives with the caller; this module does exactly one POST
//! and maps the outcome onto [`StoreError`].

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::error::StoreError;
use super::types::AssetReference;

/// Guess a mime type from the file extension. The asset endpoint rejects
/// parts without one.
fn mime_for_filename(filename: &str) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

/// Pull a human-readable message out of an API error body.
///
/// The API answers errors with JSON shaped either `{"error": {"description":
/// ...}}` or `{"message": ...}`; plain-text bodies pass through truncated.
pub(super) fn remote_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in [
            &value["error"]["description"],
            &value["message"],
            &value["error"],
        ] {
            if let Some(text) = field.as_str() {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

fn parse_asset_document(body: &serde_json::Value) -> Result<AssetReference, StoreError> {
    let document = &body["document"];
    let id = document["_id"].as_str().ok_or_else(|| StoreError::Remote {
        status: 200,
        message: "asset response missing document._id".to_string(),
    })?;
    Ok(AssetReference {
        id: id.to_string(),
        url: document["url"].as_str().map(str::to_string),
    })
}

/// POST one image to the asset endpoint as multipart form data.
///
/// Authentication rides on the client's default headers. The whole
/// request, connect through body, races `timeout`; losing the race yields
/// [`StoreError::Timeout`] so the caller's classifier sees a transient
/// failure.
pub(super) async fn upload_once(
    client: &Client,
    url: &str,
    data: Vec<u8>,
    filename: &str,
    timeout: Duration,
) -> Result<AssetReference, StoreError> {
    let mime = mime_for_filename(filename);
    let part = Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str(mime)
        .map_err(|e| StoreError::Validation(format!("invalid mime type {mime:?}: {e}")))?;
    let form = Form::new().part("file", part);

    let request = client
        .post(url)
        .query(&[("filename", filename)])
        .multipart(form)
        .send();
    let response = match tokio::time::timeout(timeout, request).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(StoreError::Timeout {
                ms: timeout.as_millis() as u64,
            })
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(StoreError::Remote {
            status: status.as_u16(),
            message: remote_message(&text),
        });
    }

    let body: serde_json::Value = response.json().await?;
    parse_asset_document(&body)
}
