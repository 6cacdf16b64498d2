//! Shared record types for the content store, the manifest, and the sync
//! pipeline. Field names serialize as camelCase to match the wire format of
//! the content API, which also keeps manifests hand-editable in the same
//! shape the API returns.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One gallery image in a category, either persisted (has `id`) or pending
/// creation (no `id`, `file` points at the binary to upload).
///
/// The display URLs are derived by the content API after upload; they are
/// informational and never consulted by the sync pipeline itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Remote document id; absent until the record has been created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display position within the category. Not guaranteed unique.
    #[serde(default, deserialize_with = "deserialize_order")]
    pub order: i64,

    /// Local file to upload. Present only for records whose binary has not
    /// been persisted yet; cleared once the remote create/update succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Owning category document id. Injected on manifest load and omitted
    /// on save; the manifest nests images under their category already.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category_id: String,

    /// Layout hint: render across two columns of the gallery grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_two_columns: Option<bool>,

    /// Remote asset id backing this image, once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    /// Last modification time reported by the content API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    /// A short human-readable handle for log and progress messages:
    /// the pending file name if there is one, else the remote id, else a
    /// placeholder.
    pub fn label(&self) -> String {
        if let Some(file) = &self.file {
            if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
                return name.to_string();
            }
        }
        match &self.id {
            Some(id) => id.clone(),
            None => "(unnamed image)".to_string(),
        }
    }
}

/// Accept any JSON value where a display order is expected.
///
/// Manifests are hand-edited and the original data source was loosely
/// typed, so orders arrive as integers, floats, numeric strings, null, or
/// garbage. Everything non-numeric collapses to 0 here so that no
/// comparison downstream ever sees a non-number.
fn deserialize_order<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_order(&value))
}

/// Numeric coercion for `order` values: integer as-is, float truncated,
/// numeric string parsed, anything else 0.
pub fn coerce_order(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Number(n) => {
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0)
        }
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

/// A gallery category as stored remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub title: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Opaque handle to an uploaded binary, as returned by the asset endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReference {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Field changes applied to an existing image document.
///
/// `span_two_columns: None` means "remove the field", not "leave it alone";
/// the patch always carries the full set of editable fields.
#[derive(Debug, Clone)]
pub struct ImagePatch {
    pub order: i64,
    pub span_two_columns: Option<bool>,
    /// New asset to point the image at, when the binary changed.
    pub asset_id: Option<String>,
}

impl ImagePatch {
    /// Build the patch for a locally edited record, attaching the freshly
    /// uploaded asset when there is one.
    pub fn from_record(record: &ImageRecord, asset: Option<&AssetReference>) -> Self {
        Self {
            order: record.order,
            span_two_columns: record.span_two_columns,
            asset_id: asset.map(|a| a.id.clone()),
        }
    }
}
