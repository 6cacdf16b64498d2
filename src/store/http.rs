//! HTTP implementation of [`ContentStore`] against the content API.
//!
//! The API exposes three endpoints per dataset: a GROQ query endpoint for
//! reads, a transactional mutation endpoint for document writes, and a
//! multipart asset endpoint for binaries. Every call here is a single
//! attempt; retry policy belongs to the sync engine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

use super::error::StoreError;
use super::types::{AssetReference, Category, ImagePatch, ImageRecord};
use super::upload::{remote_message, upload_once};
use super::ContentStore;

/// Queries and document mutations get a flat per-request deadline. Binary
/// uploads carry their own configured ceiling instead.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const CATEGORY_QUERY: &str = r#"*[_type == "category"] | order(title asc) {
  "id": _id, title, "slug": slug.current, "updatedAt": _updatedAt
}"#;

const IMAGE_QUERY: &str = r#"*[_type == "galleryImage" && category._ref == $cat] | order(order asc) {
  "id": _id,
  order,
  spanTwoColumns,
  "categoryId": category._ref,
  "assetId": image.asset._ref,
  "placeholderUrl": image.asset->metadata.lqip,
  "thumbnailUrl": image.asset->url + "?w=480&fit=max",
  "fullUrl": image.asset->url,
  "updatedAt": _updatedAt
}"#;

fn query_url(base_url: &str, dataset: &str) -> String {
    format!("{}/data/query/{}", base_url, dataset)
}

fn mutate_url(base_url: &str, dataset: &str) -> String {
    format!("{}/data/mutate/{}", base_url, dataset)
}

fn asset_url(base_url: &str, dataset: &str) -> String {
    format!("{}/assets/images/{}", base_url, dataset)
}

/// Document body for a freshly uploaded image.
fn image_create_doc(image: &ImageRecord, asset_id: &str) -> serde_json::Value {
    let mut doc = json!({
        "_type": "galleryImage",
        "order": image.order,
        "category": { "_type": "reference", "_ref": image.category_id },
        "image": {
            "_type": "image",
            "asset": { "_type": "reference", "_ref": asset_id }
        },
    });
    if let Some(span) = image.span_two_columns {
        doc["spanTwoColumns"] = json!(span);
    }
    doc
}

/// Patch body for an existing image document. A `None` span unsets the
/// field on the document rather than leaving it untouched.
fn image_patch_body(id: &str, patch: &ImagePatch) -> serde_json::Value {
    let mut set = json!({ "order": patch.order });
    if let Some(span) = patch.span_two_columns {
        set["spanTwoColumns"] = json!(span);
    }
    if let Some(asset_id) = &patch.asset_id {
        set["image"] = json!({
            "_type": "image",
            "asset": { "_type": "reference", "_ref": asset_id }
        });
    }
    let mut body = json!({ "id": id, "set": set });
    if patch.span_two_columns.is_none() {
        body["unset"] = json!(["spanTwoColumns"]);
    }
    body
}

fn category_create_doc(title: &str, slug: &str) -> serde_json::Value {
    json!({
        "_type": "category",
        "title": title,
        "slug": { "_type": "slug", "current": slug },
    })
}

#[derive(Debug)]
pub struct HttpContentStore {
    client: Client,
    base_url: String,
    dataset: String,
    upload_timeout: Duration,
}

impl HttpContentStore {
    /// Build a store for one dataset. A trailing slash on `base_url` is
    /// normalized away. Fails when the token cannot be sent as an HTTP
    /// header.
    pub fn new(
        base_url: &str,
        dataset: &str,
        token: &str,
        upload_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| StoreError::Validation(format!("API token is not header-safe: {e}")))?;
        auth_value.set_sensitive(true);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(AUTHORIZATION, auth_value);
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("gallery-sync/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dataset: dataset.to_string(),
            upload_timeout,
        })
    }

    /// Run a GROQ query, passing params as `$name`-encoded JSON values.
    async fn run_query(
        &self,
        query: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<serde_json::Value, StoreError> {
        let mut pairs: Vec<(String, String)> = vec![("query".to_string(), query.to_string())];
        for (name, value) in params {
            pairs.push((format!("${name}"), value.to_string()));
        }

        let response = self
            .client
            .get(query_url(&self.base_url, &self.dataset))
            .query(&pairs)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message: remote_message(&text),
            });
        }

        let mut body: serde_json::Value = response.json().await?;
        Ok(body["result"].take())
    }

    /// POST a mutation batch as one transaction.
    async fn mutate(&self, mutations: serde_json::Value) -> Result<serde_json::Value, StoreError> {
        let body = json!({
            "mutations": mutations,
            "transactionId": Uuid::new_v4().to_string(),
        });

        let response = self
            .client
            .post(mutate_url(&self.base_url, &self.dataset))
            .query(&[("returnIds", "true")])
            .json(&body)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message: remote_message(&text),
            });
        }

        Ok(response.json().await?)
    }

    fn created_id(response: &serde_json::Value) -> Result<String, StoreError> {
        response["results"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Remote {
                status: 200,
                message: "mutation response missing results[0].id".to_string(),
            })
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let result = self.run_query(CATEGORY_QUERY, &[]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn create_category(&self, title: &str, slug: &str) -> Result<Category, StoreError> {
        if title.trim().is_empty() {
            return Err(StoreError::Validation(
                "category title must not be empty".to_string(),
            ));
        }
        if slug.trim().is_empty() {
            return Err(StoreError::Validation(
                "category slug must not be empty".to_string(),
            ));
        }
        let response = self
            .mutate(json!([{ "create": category_create_doc(title, slug) }]))
            .await?;
        Ok(Category {
            id: Self::created_id(&response)?,
            title: title.to_string(),
            slug: slug.to_string(),
            updated_at: None,
        })
    }

    async fn delete_category(&self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation(
                "category id must not be empty".to_string(),
            ));
        }
        self.mutate(json!([{ "delete": { "id": id } }])).await?;
        Ok(())
    }

    async fn list_images(&self, category_id: &str) -> Result<Vec<ImageRecord>, StoreError> {
        if category_id.is_empty() {
            return Err(StoreError::Validation(
                "category id must not be empty".to_string(),
            ));
        }
        let result = self
            .run_query(IMAGE_QUERY, &[("cat", json!(category_id))])
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn create_image(
        &self,
        image: &ImageRecord,
        asset: &AssetReference,
    ) -> Result<ImageRecord, StoreError> {
        if image.category_id.is_empty() {
            return Err(StoreError::Validation(format!(
                "{} has no category reference",
                image.label()
            )));
        }
        let response = self
            .mutate(json!([{ "create": image_create_doc(image, &asset.id) }]))
            .await?;
        let id = Self::created_id(&response)?;

        let mut created = image.clone();
        created.id = Some(id);
        created.file = None;
        created.asset_id = Some(asset.id.clone());
        created.full_url = asset.url.clone();
        Ok(created)
    }

    async fn update_image(&self, id: &str, patch: &ImagePatch) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation(
                "image id must not be empty".to_string(),
            ));
        }
        self.mutate(json!([{ "patch": image_patch_body(id, patch) }]))
            .await?;
        Ok(())
    }

    async fn delete_image(&self, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation(
                "image id must not be empty".to_string(),
            ));
        }
        self.mutate(json!([{ "delete": { "id": id } }])).await?;
        Ok(())
    }

    async fn upload_asset(&self, data: Vec<u8>, filename: &str) -> Result<AssetReference, StoreError> {
        upload_once(
            &self.client,
            &asset_url(&self.base_url, &self.dataset),
            data,
            filename,
            self.upload_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            query_url("https://api.example.com/v2024-01-01", "production"),
            "https://api.example.com/v2024-01-01/data/query/production"
        );
        assert_eq!(
            mutate_url("https://api.example.com/v2024-01-01", "production"),
            "https://api.example.com/v2024-01-01/data/mutate/production"
        );
        assert_eq!(
            asset_url("https://api.example.com/v2024-01-01", "production"),
            "https://api.example.com/v2024-01-01/assets/images/production"
        );
    }

    #[test]
    fn test_new_normalizes_trailing_slash() {
        let store =
            HttpContentStore::new("https://api.example.com/", "prod", "tok", Duration::from_secs(60))
                .unwrap();
        assert_eq!(store.base_url, "https://api.example.com");
    }

    #[test]
    fn test_debug_does_not_leak_token() {
        let store = HttpContentStore::new(
            "https://api.example.com",
            "prod",
            "sk-very-secret",
            Duration::from_secs(60),
        )
        .unwrap();
        // The token lives in a sensitive default header, so formatting the
        // store for diagnostics must not reveal it.
        let debug = format!("{:?}", store);
        assert!(!debug.contains("sk-very-secret"));
    }

    #[test]
    fn test_new_rejects_non_header_token() {
        let err = HttpContentStore::new(
            "https://api.example.com",
            "prod",
            "tok\nen",
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_image_create_doc_shape() {
        let image = ImageRecord {
            order: 4,
            category_id: "cat-landscapes".to_string(),
            span_two_columns: Some(true),
            ..Default::default()
        };
        let doc = image_create_doc(&image, "image-abc");
        assert_eq!(doc["_type"], "galleryImage");
        assert_eq!(doc["order"], 4);
        assert_eq!(doc["category"]["_ref"], "cat-landscapes");
        assert_eq!(doc["image"]["asset"]["_ref"], "image-abc");
        assert_eq!(doc["spanTwoColumns"], true);

        let plain = image_create_doc(
            &ImageRecord {
                category_id: "cat-landscapes".to_string(),
                ..Default::default()
            },
            "image-abc",
        );
        assert!(plain.get("spanTwoColumns").is_none());
    }

    #[test]
    fn test_image_patch_body_sets_span() {
        let patch = ImagePatch {
            order: 2,
            span_two_columns: Some(false),
            asset_id: None,
        };
        let body = image_patch_body("img-1", &patch);
        assert_eq!(body["id"], "img-1");
        assert_eq!(body["set"]["order"], 2);
        assert_eq!(body["set"]["spanTwoColumns"], false);
        assert!(body.get("unset").is_none());
        assert!(body["set"].get("image").is_none());
    }

    #[test]
    fn test_image_patch_body_unsets_missing_span() {
        let patch = ImagePatch {
            order: 0,
            span_two_columns: None,
            asset_id: Some("image-new".to_string()),
        };
        let body = image_patch_body("img-1", &patch);
        assert_eq!(body["unset"], json!(["spanTwoColumns"]));
        assert_eq!(body["set"]["image"]["asset"]["_ref"], "image-new");
    }

    #[test]
    fn test_category_create_doc_shape() {
        let doc = category_create_doc("Landscapes", "landscapes");
        assert_eq!(doc["_type"], "category");
        assert_eq!(doc["title"], "Landscapes");
        assert_eq!(doc["slug"]["current"], "landscapes");
    }

    #[test]
    fn test_created_id_extraction() {
        let response = json!({
            "transactionId": "tx-1",
            "results": [{ "id": "img-123", "operation": "create" }]
        });
        assert_eq!(HttpContentStore::created_id(&response).unwrap(), "img-123");

        let empty = json!({ "transactionId": "tx-2", "results": [] });
        assert!(HttpContentStore::created_id(&empty).is_err());
    }

    #[tokio::test]
    async fn test_connection_error_surfaces_as_network() {
        // Nothing listens on port 1; every operation should map the
        // transport failure instead of panicking.
        let store =
            HttpContentStore::new("http://127.0.0.1:1", "prod", "tok", Duration::from_secs(5))
                .unwrap();
        let err = store.list_categories().await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
        assert!(err.to_string().to_lowercase().contains("network"));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_any_request() {
        // Bogus endpoint proves no request is attempted for invalid input.
        let store =
            HttpContentStore::new("http://127.0.0.1:1", "prod", "tok", Duration::from_secs(5))
                .unwrap();
        assert!(matches!(
            store.list_images("").await.unwrap_err(),
            StoreError::Validation(_)
        ));
        assert!(matches!(
            store.delete_image("").await.unwrap_err(),
            StoreError::Validation(_)
        ));
        assert!(matches!(
            store.create_category("", "slug").await.unwrap_err(),
            StoreError::Validation(_)
        ));
        let orphan = ImageRecord::default();
        let asset = AssetReference {
            id: "image-abc".to_string(),
            url: None,
        };
        assert!(matches!(
            store.create_image(&orphan, &asset).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }
}
