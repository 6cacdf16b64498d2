//! Remote content store: the persistence side of the gallery.
//!
//! The gallery lives in a hosted content API as three kinds of things:
//! category documents, gallery image documents, and binary image assets.
//! This module provides the [`ContentStore`] trait the sync pipeline works
//! against and the HTTP implementation used in production.

pub mod error;
pub mod http;
pub mod types;
mod upload;

use async_trait::async_trait;

pub use error::StoreError;
pub use http::HttpContentStore;
pub use types::{AssetReference, Category, ImagePatch, ImageRecord};

/// Remote persistence operations the sync pipeline needs.
///
/// Object-safe so the engine can hold `Arc<dyn ContentStore>` and tests
/// can substitute a scripted fake.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// All categories, ordered by title.
    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;

    /// Create a category document.
    async fn create_category(&self, title: &str, slug: &str) -> Result<Category, StoreError>;

    /// Delete a category document by id. Images in the category are not
    /// touched.
    async fn delete_category(&self, id: &str) -> Result<(), StoreError>;

    /// The persisted images of one category, in display order.
    async fn list_images(&self, category_id: &str) -> Result<Vec<ImageRecord>, StoreError>;

    /// Create an image document pointing at an already uploaded asset.
    /// Returns the record as persisted: id assigned, pending file cleared.
    async fn create_image(
        &self,
        image: &ImageRecord,
        asset: &AssetReference,
    ) -> Result<ImageRecord, StoreError>;

    /// Patch an existing image document.
    async fn update_image(&self, id: &str, patch: &ImagePatch) -> Result<(), StoreError>;

    /// Delete an image document by id.
    async fn delete_image(&self, id: &str) -> Result<(), StoreError>;

    /// Upload one binary to the asset endpoint. Single attempt; retry
    /// policy belongs to the caller.
    async fn upload_asset(&self, data: Vec<u8>, filename: &str)
        -> Result<AssetReference, StoreError>;
}
