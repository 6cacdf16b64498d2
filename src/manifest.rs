//! The gallery manifest: a JSON file listing every category and its
//! images, in the same camelCase shape the content API speaks.
//!
//! The manifest is the photographer's working copy. New images are added
//! by hand (or by a script) as entries with a `file` path and no `id`;
//! `gallery-sync sync` pushes the difference to the store and writes the
//! reconciled state back.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::types::ImageRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub categories: Vec<CategoryEntry>,
}

/// One category section of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryEntry {
    /// Remote document id; absent until `sync` has created the category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

impl Manifest {
    /// Read and normalize a manifest.
    ///
    /// Two fixups happen on the way in: every image inherits its category's
    /// document id, and relative `file` paths are resolved against the
    /// manifest's own directory so the CLI works from anywhere.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("Manifest {} is not valid JSON", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for category in &mut manifest.categories {
            let category_id = category.id.clone().unwrap_or_default();
            for image in &mut category.images {
                image.category_id = category_id.clone();
                if let Some(file) = &image.file {
                    if file.is_relative() {
                        image.file = Some(base.join(file));
                    }
                }
            }
        }
        Ok(manifest)
    }

    /// Write the manifest back, undoing the load-time fixups: `file` paths
    /// under the manifest's directory become relative again, and injected
    /// category ids are dropped from images (load re-derives them).
    pub async fn save(&self, path: &Path) -> Result<()> {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut copy = self.clone();
        for category in &mut copy.categories {
            for image in &mut category.images {
                image.category_id = String::new();
                if let Some(file) = &image.file {
                    if let Ok(relative) = file.strip_prefix(base) {
                        image.file = Some(relative.to_path_buf());
                    }
                }
            }
        }
        let json = serde_json::to_string_pretty(&copy)
            .context("Failed to serialize manifest")?;
        tokio::fs::write(path, json + "\n")
            .await
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        Ok(())
    }

    pub fn category(&self, slug: &str) -> Option<&CategoryEntry> {
        self.categories.iter().find(|c| c.slug == slug)
    }
}

/// Derive a URL slug from a category title: lowercase alphanumerics with
/// single dashes, no leading or trailing dash.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_dash = true;
    for c in title.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
